//! sdp-config: configuration database for the SDP devices.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the master and subarray
//! entries, scheduling block instances, processing blocks and processing
//! block states that the devices and the processing side share.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Every read and write happens inside [`ConfigDb::transaction`], which
//! commits or aborts as a unit. Committed writes advance a revision counter
//! that [`Watcher`]s block on, so a consumer can re-read the database each
//! time something changes.
//!
//! `ConfigDb` is `Clone` + `Send` + `Sync` and is shared between a device's
//! command path and its reconciliation worker.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use error::{ConfigError, ConfigResult};
pub use store::{ConfigDb, Txn};
pub use types::*;
pub use watch::{Wake, WatchHandle, Watcher};
