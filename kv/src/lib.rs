#![allow(non_camel_case_types)]
#![feature(is_terminal)]
#![feature(const_trait_impl)]
#![feature(exact_size_is_empty)]
// just for cursor.is_empty()
#![feature(cursor_remaining)]


//! `kv-rs` is an etcd-v3-compatible replicated, linearizable,
//! revision-versioned key-value store core: a sharded MVCC store, a
//! load-adaptive proposal batcher, and a Raft apply pipeline, wired together
//! by [`store::Store`] behind the [`facade`] traits. [Author fengyang]
//!
//! Storage is pluggable behind the [`storage::engine::Engine`] trait; the
//! in-memory [`storage::memory::Memory`] engine and the persistent
//! append-only [`storage::log_cask::LogCask`] engine both implement it.
//!
//! ## Running a single-node store
//!
//! ```no_run
//! use kv_rs::config::ConfigLoad;
//! use kv_rs::{CResult, KvFacade, Store};
//!
//! #[tokio::main]
//! async fn main() -> CResult<()> {
//!     let store = Store::new_memory(ConfigLoad::default())?;
//!     store.put(b"greeting", b"hello".to_vec(), 0).await?;
//!     let range = store.range(b"greeting", b"", 0, 0).await?;
//!     assert_eq!(range.kvs[0].value, b"hello");
//!     store.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Using a storage engine directly
//!
//! ```rust
//! use kv_rs::error::Error;
//! use kv_rs::storage::engine::Engine;
//! use kv_rs::storage::log_cask::LogCask;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> Result<(), Error> {
//!     let storage_path = tempdir::TempDir::new("demo")?.path().join("kvdb");
//!
//!     let mut engine = LogCask::new(storage_path)?;
//!     engine.set(b"b", vec![0x01])?;
//!     engine.set(b"b", vec![0x02])?;
//!
//!     engine.set(b"e", vec![0x05])?;
//!     engine.delete(b"e")?;
//!
//!     engine.set(b"c", vec![0x00])?;
//!     engine.delete(b"c")?;
//!     engine.set(b"c", vec![0x03])?;
//!
//!     engine.set(b"", vec![])?;
//!
//!     engine.set(b"a", vec![0x01])?;
//!
//!     engine.delete(b"f")?;
//!
//!     engine.delete(b"d")?;
//!     engine.set(b"d", vec![0x04])?;
//!
//!     // Make sure the scan yields the expected results.
//!     assert_eq!(
//!             vec![
//!                 (b"".to_vec(), vec![]),
//!                 (b"a".to_vec(), vec![0x01]),
//!                 (b"b".to_vec(), vec![0x02]),
//!                 (b"c".to_vec(), vec![0x03]),
//!                 (b"d".to_vec(), vec![0x04]),
//!             ],
//!             engine.scan(..).collect::<Result<Vec<_>,Error>> ()?,
//!         );
//!
//!     let rs = engine.flush();
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;
pub mod codec;
pub mod mvcc;
pub mod row;
pub mod snapshot;

pub mod revision;
pub mod shard;
pub mod lease;
pub mod leaseread;
pub mod watch;
pub mod txn;
pub mod apply;
pub mod batcher;
pub mod raftadapter;
pub mod compactor;
pub mod config;
pub mod facade;
pub mod store;

pub use error::{CResult, Error};
pub use facade::{KvFacade, LeaseFacade, MaintenanceFacade, WatchFacade};
pub use store::Store;
