//! Typed view of the master entry inside one transaction.

use sdp_config::{ConfigResult, MasterRecord, Txn};

use crate::attributes::DevState;

pub struct MasterView<'a> {
    txn: &'a Txn,
}

impl<'a> MasterView<'a> {
    pub fn new(txn: &'a Txn) -> Self {
        Self { txn }
    }

    /// Create the master entry with `state` unless it already exists.
    /// Returns whether an entry was created.
    pub fn create_if_not_present(&self, state: DevState) -> ConfigResult<bool> {
        if self.txn.get_master()?.is_some() {
            return Ok(false);
        }
        self.txn.create_master(&MasterRecord {
            transaction_id: None,
            state: Some(state.as_str().to_string()),
        })?;
        Ok(true)
    }

    fn record(&self) -> ConfigResult<MasterRecord> {
        Ok(self.txn.get_master()?.unwrap_or_default())
    }

    /// Write the entry, creating it if it vanished.
    fn store(&self, record: &MasterRecord) -> ConfigResult<()> {
        match self.txn.update_master(record) {
            Err(e) if e.is_vanished() => self.txn.create_master(record),
            other => other,
        }
    }

    /// Stored state; `None` if absent or unrecognised.
    pub fn state(&self) -> ConfigResult<Option<DevState>> {
        let record = self.record()?;
        Ok(record.state.as_deref().and_then(DevState::from_name))
    }

    pub fn set_state(&self, state: DevState) -> ConfigResult<()> {
        let mut record = self.record()?;
        record.state = Some(state.as_str().to_string());
        self.store(&record)
    }

    pub fn transaction_id(&self) -> ConfigResult<Option<String>> {
        Ok(self.record()?.transaction_id)
    }

    pub fn set_transaction_id(&self, transaction_id: &str) -> ConfigResult<()> {
        let mut record = self.record()?;
        record.transaction_id = Some(transaction_id.to_string());
        self.store(&record)
    }
}
