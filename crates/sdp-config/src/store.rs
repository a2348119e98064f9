//! ConfigDb: redb-backed configuration database for the SDP devices.
//!
//! All access goes through [`ConfigDb::transaction`], which runs a closure
//! against a [`Txn`] bound to a single redb write transaction. The body
//! either commits as a whole or not at all. Every committed transaction that
//! wrote something bumps the database revision, which wakes any [`Watcher`].

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::tables::{self, *};
use crate::types::*;
use crate::watch::{ChangeFeed, Watcher};

/// Convert any `Display` error into a `ConfigError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| ConfigError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe handle to the configuration database.
///
/// Cloning is cheap; clones share the database and its change feed.
#[derive(Clone)]
pub struct ConfigDb {
    db: Arc<Database>,
    feed: Arc<ChangeFeed>,
}

impl ConfigDb {
    /// Open (or create) a persistent database at the given path.
    pub fn open(path: &Path) -> ConfigResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "config db opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory database.
    pub fn open_in_memory() -> ConfigResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory config db opened");
        Ok(store)
    }

    fn from_database(db: Database) -> ConfigResult<Self> {
        let store = Self {
            db: Arc::new(db),
            feed: Arc::new(ChangeFeed::default()),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> ConfigResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in tables::ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `body` inside one transaction.
    ///
    /// The transaction commits if the body returns `Ok` and is aborted if it
    /// returns `Err`, so a failing body never leaves a partial update behind.
    /// Watchers are woken only when the body wrote something.
    pub fn transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&Txn) -> Result<T, E>,
        E: From<ConfigError>,
    {
        let inner = self.db.begin_write().map_err(map_err!(Transaction))?;
        let txn = Txn {
            inner,
            dirty: Cell::new(false),
        };
        match body(&txn) {
            Ok(value) => {
                if txn.finish()? {
                    let revision = self.feed.publish();
                    debug!(revision, "config db transaction committed");
                }
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Start watching the database for committed changes.
    pub fn watcher(&self) -> Watcher {
        Watcher::new(Arc::clone(&self.feed))
    }

    /// Number of committed, non-empty transactions so far.
    pub fn revision(&self) -> u64 {
        self.feed.current()
    }

    /// Remove every entry from every table.
    pub fn wipe(&self) -> ConfigResult<()> {
        self.transaction(|txn| {
            for table in tables::ALL {
                for key in txn.keys(table)? {
                    txn.remove(table, &key)?;
                }
            }
            Ok(())
        })
    }
}

/// A single read/modify/write transaction.
///
/// Obtained only through [`ConfigDb::transaction`].
pub struct Txn {
    inner: WriteTransaction,
    dirty: Cell<bool>,
}

impl Txn {
    /// Commit if anything was written, otherwise discard. Returns whether a
    /// commit happened.
    fn finish(self) -> ConfigResult<bool> {
        if self.dirty.get() {
            self.inner.commit().map_err(map_err!(Transaction))?;
            Ok(true)
        } else {
            self.abort();
            Ok(false)
        }
    }

    fn abort(self) {
        if let Err(e) = self.inner.abort() {
            warn!(error = %e, "failed to abort config db transaction");
        }
    }

    // ── Generic table access ───────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> ConfigResult<Option<T>> {
        let table = self.inner.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn contains(&self, table: Table, key: &str) -> ConfigResult<bool> {
        let table = self.inner.open_table(table).map_err(map_err!(Table))?;
        let found = table.get(key).map_err(map_err!(Read))?.is_some();
        Ok(found)
    }

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> ConfigResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        {
            let mut table = self.inner.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        self.dirty.set(true);
        Ok(())
    }

    fn create<T: Serialize>(
        &self,
        table: Table,
        kind: &'static str,
        key: &str,
        value: &T,
    ) -> ConfigResult<()> {
        if self.contains(table, key)? {
            return Err(ConfigError::Collision {
                kind,
                key: key.to_string(),
            });
        }
        self.put(table, key, value)
    }

    fn update<T: Serialize>(
        &self,
        table: Table,
        kind: &'static str,
        key: &str,
        value: &T,
    ) -> ConfigResult<()> {
        if !self.contains(table, key)? {
            return Err(ConfigError::Vanished {
                kind,
                key: key.to_string(),
            });
        }
        self.put(table, key, value)
    }

    fn keys(&self, table: Table) -> ConfigResult<Vec<String>> {
        let table = self.inner.open_table(table).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn remove(&self, table: Table, key: &str) -> ConfigResult<bool> {
        let existed;
        {
            let mut table = self.inner.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        if existed {
            self.dirty.set(true);
        }
        Ok(existed)
    }

    // ── Master ─────────────────────────────────────────────────────

    pub fn get_master(&self) -> ConfigResult<Option<MasterRecord>> {
        self.get(MASTER, MASTER_KEY)
    }

    pub fn create_master(&self, master: &MasterRecord) -> ConfigResult<()> {
        self.create(MASTER, "master", MASTER_KEY, master)
    }

    pub fn update_master(&self, master: &MasterRecord) -> ConfigResult<()> {
        self.update(MASTER, "master", MASTER_KEY, master)
    }

    // ── Subarrays ──────────────────────────────────────────────────

    pub fn get_subarray(&self, subarray_id: &str) -> ConfigResult<Option<SubarrayRecord>> {
        self.get(SUBARRAYS, subarray_id)
    }

    pub fn create_subarray(&self, subarray_id: &str, subarray: &SubarrayRecord) -> ConfigResult<()> {
        self.create(SUBARRAYS, "subarray", subarray_id, subarray)
    }

    pub fn update_subarray(&self, subarray_id: &str, subarray: &SubarrayRecord) -> ConfigResult<()> {
        self.update(SUBARRAYS, "subarray", subarray_id, subarray)
    }

    pub fn list_subarrays(&self) -> ConfigResult<Vec<String>> {
        self.keys(SUBARRAYS)
    }

    // ── Scheduling block instances ─────────────────────────────────

    pub fn get_scheduling_block(&self, sbi_id: &str) -> ConfigResult<Option<SchedulingBlockInstance>> {
        self.get(SCHEDULING_BLOCKS, sbi_id)
    }

    pub fn create_scheduling_block(&self, sbi: &SchedulingBlockInstance) -> ConfigResult<()> {
        self.create(SCHEDULING_BLOCKS, "scheduling block instance", &sbi.id, sbi)
    }

    pub fn update_scheduling_block(&self, sbi: &SchedulingBlockInstance) -> ConfigResult<()> {
        self.update(SCHEDULING_BLOCKS, "scheduling block instance", &sbi.id, sbi)
    }

    pub fn list_scheduling_blocks(&self) -> ConfigResult<Vec<SbiId>> {
        self.keys(SCHEDULING_BLOCKS)
    }

    // ── Processing blocks ──────────────────────────────────────────

    pub fn get_processing_block(&self, pb_id: &str) -> ConfigResult<Option<ProcessingBlock>> {
        self.get(PROCESSING_BLOCKS, pb_id)
    }

    pub fn create_processing_block(&self, pb: &ProcessingBlock) -> ConfigResult<()> {
        self.create(PROCESSING_BLOCKS, "processing block", &pb.id, pb)
    }

    pub fn list_processing_blocks(&self) -> ConfigResult<Vec<PbId>> {
        self.keys(PROCESSING_BLOCKS)
    }

    // ── Processing block states ────────────────────────────────────

    pub fn get_processing_block_state(&self, pb_id: &str) -> ConfigResult<Option<ProcessingBlockState>> {
        self.get(PROCESSING_BLOCK_STATES, pb_id)
    }

    pub fn create_processing_block_state(
        &self,
        pb_id: &str,
        state: &ProcessingBlockState,
    ) -> ConfigResult<()> {
        self.create(PROCESSING_BLOCK_STATES, "processing block state", pb_id, state)
    }

    pub fn update_processing_block_state(
        &self,
        pb_id: &str,
        state: &ProcessingBlockState,
    ) -> ConfigResult<()> {
        self.update(PROCESSING_BLOCK_STATES, "processing block state", pb_id, state)
    }
}
