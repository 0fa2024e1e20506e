use kvcli::server::config::ConfigLoad;

#[test]
fn default_carries_store_defaults() {
    let config = ConfigLoad::default();
    assert_eq!(config.store.node_id(), 1);
    assert!(config.store.batcher_enabled());
    assert!(!config.is_show_affected());
}

#[test]
fn inject_cmd_updates_known_settings() {
    let mut config = ConfigLoad::default();
    config.inject_cmd("show_affected", "true").unwrap();
    assert!(config.is_show_affected());

    config.inject_cmd("multi_line", "false").unwrap();
    assert_eq!(config.multi_line, Some(false));
}

#[test]
fn inject_cmd_rejects_unknown_name() {
    let mut config = ConfigLoad::default();
    assert!(config.inject_cmd("not_a_real_setting", "1").is_err());
}

#[test]
fn inject_cmd_rejects_unparseable_value() {
    let mut config = ConfigLoad::default();
    assert!(config.inject_cmd("show_affected", "not_a_bool").is_err());
}

#[test]
fn terminal_update_turns_on_progress_and_stats() {
    let mut config = ConfigLoad::default();
    config.terminal_update();
    assert_eq!(config.show_stats, Some(true));
}
