use std::io::Cursor;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use kvcli::server::config::ConfigLoad;
use kvcli::server::session::Session;

async fn new_session() -> Result<Session> {
    let running = Arc::new(AtomicBool::new(true));
    Session::try_new(ConfigLoad::default(), false, running).await
}

#[tokio::test]
async fn put_then_get_round_trips() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("SET greeting hello_world")).await?;
    session.handle_reader(Cursor::new("GET greeting")).await?;
    Ok(())
}

#[tokio::test]
async fn setex_grants_a_lease_before_putting() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("SETEX ttl_key 60 value")).await?;
    session.handle_reader(Cursor::new("LEASE LIST")).await?;
    Ok(())
}

#[tokio::test]
async fn range_and_delrange_cover_a_prefix() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("PUT a 1\nPUT b 2\nPUT c 3")).await?;
    session.handle_reader(Cursor::new("RANGE a c")).await?;
    session.handle_reader(Cursor::new("DELRANGE a c")).await?;
    Ok(())
}

#[tokio::test]
async fn del_removes_a_single_key() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("PUT solo value")).await?;
    session.handle_reader(Cursor::new("DEL solo")).await?;
    Ok(())
}

#[tokio::test]
async fn txn_runs_the_then_branch_when_the_compare_holds() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("PUT flag on")).await?;
    session.handle_reader(Cursor::new("TXN IF flag = on THEN PUT flag matched ELSE PUT flag unmatched")).await?;
    session.handle_reader(Cursor::new("GET flag")).await?;
    Ok(())
}

#[tokio::test]
async fn lease_grant_revoke_round_trips() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("LEASE GRANT 30")).await?;
    session.handle_reader(Cursor::new("LEASE LIST")).await?;
    Ok(())
}

#[tokio::test]
async fn compact_accepts_a_revision_above_the_watermark() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("PUT k v")).await?;
    session.handle_reader(Cursor::new("COMPACT 1")).await?;
    Ok(())
}

#[tokio::test]
async fn recompacting_an_already_compacted_revision_is_rejected() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("PUT k v")).await?;
    session.handle_reader(Cursor::new("COMPACT 1")).await?;
    assert!(session.handle_reader(Cursor::new("COMPACT 0")).await.is_err());
    Ok(())
}

#[tokio::test]
async fn status_and_keys_report_store_state() -> Result<()> {
    let mut session = new_session().await?;
    session.handle_reader(Cursor::new("PUT k v")).await?;
    session.handle_reader(Cursor::new("STATUS")).await?;
    session.handle_reader(Cursor::new("KEYS")).await?;
    session.handle_reader(Cursor::new("KSIZE")).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_command_is_rejected() -> Result<()> {
    let mut session = new_session().await?;
    assert!(session.handle_reader(Cursor::new("BOGUS key")).await.is_err());
    Ok(())
}
