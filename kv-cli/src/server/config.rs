use anyhow::anyhow;
use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "kvcli";

/// CLI-facing settings, loaded from a TOML/YAML file via `confy` and
/// layered over [`kv_rs::config::ConfigLoad`] defaults for the embedded
/// store. `kvcli` runs a single-node [`kv_rs::store::Store`] in-process
/// rather than dialing out to one, so there is no connection config here --
/// only REPL ergonomics and the store's own tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// prompt
    pub prompt: Option<String>,

    /// Show stats after executing queries. Only works with non-interactive mode.
    pub show_stats: Option<bool>,

    /// fix part cmd options. default false
    auto_append_part_cmd: Option<bool>,
    /// Division symbol
    auto_append_part_cmd_symbol: Option<char>,

    /// Multi line mode, default is true.
    pub multi_line: Option<bool>,

    /// whether replace '\n' with '\\n', default true.
    pub replace_newline: Option<bool>,

    cli: Option<CliConfig>,

    /// Embedded store tuning (Raft, batcher, lease-read, compactor, limits).
    /// Defaults to [`kv_rs::config::ConfigLoad::default`] when the config
    /// file omits the section entirely.
    #[serde(default)]
    pub store: kv_rs::config::ConfigLoad,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CliConfig {
    /// Show rows affected
    show_affected: Option<bool>,

    /// progress
    pub progress_color: Option<String>,

    /// Show progress [bar] when executing queries.
    pub show_progress: Option<bool>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 0,
            prompt: Some(DEFAULT_PROMPT.to_string()),
            show_stats: Some(false),
            auto_append_part_cmd: Some(false),
            auto_append_part_cmd_symbol: Some(';'),
            multi_line: Some(true),
            replace_newline: Some(true),
            cli: Some(CliConfig::default()),
            store: kv_rs::config::ConfigLoad::default(),
        }
    }
}

impl ConfigLoad {
    /// Loads from `path`, falling back to an error the caller can recover
    /// from with [`ConfigLoad::default`].
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Ok(confy::load_path(path)?)
    }

    pub fn is_show_affected(&self) -> bool {
        match self.cli.as_ref() {
            None => false,
            Some(c) => c.show_affected.unwrap_or(false),
        }
    }

    /// fix part cmd options. default false
    pub fn get_auto_append_part_cmd(&self) -> bool {
        self.auto_append_part_cmd.unwrap_or(false)
    }

    /// Division symbol
    pub fn get_auto_append_part_cmd_symbol(&self) -> char {
        self.auto_append_part_cmd_symbol.unwrap_or(';')
    }

    /// change cmd:
    /// show_progress、show_affected、show_stats、auto_append_part_cmd、auto_append_part_cmd_symbol、multi_line、replace_newline
    pub fn inject_cmd(&mut self, cmd_name: &str, cmd_value: &str) -> anyhow::Result<()> {
        match cmd_name {
            "show_progress" => self.set_show_progress(cmd_value.parse()?),
            "show_affected" => self.set_show_affected(cmd_value.parse()?),
            "show_stats" => self.show_stats = Some(cmd_value.parse()?),
            "auto_append_part_cmd" => self.auto_append_part_cmd = Some(cmd_value.parse()?),
            "auto_append_part_cmd_symbol" => self.auto_append_part_cmd_symbol = Some(cmd_value.parse()?),
            "multi_line" => self.multi_line = Some(cmd_value.parse()?),
            "replace_newline" => self.replace_newline = Some(cmd_value.parse()?),
            _ => return Err(anyhow!("Unknown command: {}", cmd_name)),
        }
        Ok(())
    }

    pub fn terminal_update(&mut self) {
        self.set_show_progress(true);
        self.show_stats = Some(true);
    }

    fn set_show_progress(&mut self, v: bool) {
        match self.cli.as_mut() {
            None => {
                let mut cli = CliConfig::default();
                cli.show_progress = Some(v);
                self.cli = Some(cli);
            }
            Some(c) => c.show_progress = Some(v),
        }
    }

    fn set_show_affected(&mut self, v: bool) {
        match self.cli.as_mut() {
            None => {
                let mut cli = CliConfig::default();
                cli.show_affected = Some(v);
                self.cli = Some(cli);
            }
            Some(c) => c.show_affected = Some(v),
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        CliConfig { show_affected: Some(false), progress_color: None, show_progress: Some(false) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_store_config_defaults() {
        let cfg = ConfigLoad::default();
        assert_eq!(cfg.store.node_id(), 1);
        assert!(!cfg.is_show_affected());
    }

    #[test]
    fn inject_cmd_updates_show_affected() {
        let mut cfg = ConfigLoad::default();
        cfg.inject_cmd("show_affected", "true").unwrap();
        assert!(cfg.is_show_affected());
    }

    #[test]
    fn inject_cmd_rejects_unknown_name() {
        let mut cfg = ConfigLoad::default();
        assert!(cfg.inject_cmd("bogus", "1").is_err());
    }

    #[test]
    fn terminal_update_enables_progress_and_stats() {
        let mut cfg = ConfigLoad::default();
        cfg.terminal_update();
        assert_eq!(cfg.show_stats, Some(true));
    }
}
