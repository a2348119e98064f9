//! Typed view of a subarray entry and its linked records inside one
//! transaction.
//!
//! The subarray entry links to at most one scheduling block instance (SBI)
//! through `sbi_id`; the SBI links back through `subarray_id`. Reads that go
//! through the link return `None` when it is absent. Writes to SBI-held
//! fields are ignored when no SBI is linked.

use sdp_config::{
    ConfigError, ConfigResult, ProcessingBlock, ProcessingBlockState, SbiStatus, ScanType,
    SchedulingBlockInstance, SubarrayRecord, Txn,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::attributes::{DevState, ObsState};
use crate::error::{CommandError, CommandResult};

/// Everything the reconciliation pass needs from one subarray, read in a
/// single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SubarraySnapshot {
    pub transaction_id: Option<String>,
    pub command: Option<String>,
    pub state: Option<DevState>,
    pub obs_state_target: Option<ObsState>,
    pub sbi_id: Option<String>,
    pub scan_type: Option<String>,
    pub scan_id: Option<i64>,
    pub receive_addresses: Option<Value>,
}

pub struct SubarrayView<'a> {
    txn: &'a Txn,
    id: &'a str,
}

impl<'a> SubarrayView<'a> {
    pub fn new(txn: &'a Txn, id: &'a str) -> Self {
        Self { txn, id }
    }

    pub fn id(&self) -> &str {
        self.id
    }

    /// Create the entry unless it exists. Returns whether it was created.
    pub fn create_if_not_present(&self, state: DevState, obs_state: ObsState) -> ConfigResult<bool> {
        if self.txn.get_subarray(self.id)?.is_some() {
            return Ok(false);
        }
        let record = SubarrayRecord {
            state: Some(state.as_str().to_string()),
            obs_state_target: Some(obs_state.as_str().to_string()),
            ..Default::default()
        };
        self.txn.create_subarray(self.id, &record)?;
        info!(subarray_id = self.id, "created subarray entry");
        Ok(true)
    }

    // ── Subarray entry ─────────────────────────────────────────────

    fn record(&self) -> ConfigResult<SubarrayRecord> {
        Ok(self.txn.get_subarray(self.id)?.unwrap_or_default())
    }

    fn modify(&self, f: impl FnOnce(&mut SubarrayRecord)) -> ConfigResult<()> {
        let mut record = self.record()?;
        f(&mut record);
        match self.txn.update_subarray(self.id, &record) {
            Err(e) if e.is_vanished() => self.txn.create_subarray(self.id, &record)?,
            other => other?,
        }
        Ok(())
    }

    /// Name of the last command written to the entry.
    pub fn command(&self) -> ConfigResult<Option<String>> {
        Ok(self.record()?.last_command)
    }

    pub fn set_command(&self, command: &str) -> ConfigResult<()> {
        self.modify(|r| r.last_command = Some(command.to_string()))
    }

    pub fn transaction_id(&self) -> ConfigResult<Option<String>> {
        Ok(self.record()?.transaction_id)
    }

    pub fn set_transaction_id(&self, transaction_id: &str) -> ConfigResult<()> {
        self.modify(|r| r.transaction_id = Some(transaction_id.to_string()))
    }

    pub fn state(&self) -> ConfigResult<Option<DevState>> {
        Ok(self.record()?.state.as_deref().and_then(DevState::from_name))
    }

    pub fn set_state(&self, state: DevState) -> ConfigResult<()> {
        self.modify(|r| r.state = Some(state.as_str().to_string()))
    }

    pub fn obs_state_target(&self) -> ConfigResult<Option<ObsState>> {
        Ok(self
            .record()?
            .obs_state_target
            .as_deref()
            .and_then(ObsState::from_name))
    }

    pub fn set_obs_state_target(&self, obs_state: ObsState) -> ConfigResult<()> {
        self.modify(|r| r.obs_state_target = Some(obs_state.as_str().to_string()))
    }

    pub fn sbi_id(&self) -> ConfigResult<Option<String>> {
        Ok(self.record()?.sbi_id)
    }

    // ── Linked scheduling block instance ───────────────────────────

    fn sbi(&self) -> ConfigResult<Option<SchedulingBlockInstance>> {
        match self.sbi_id()? {
            Some(sbi_id) => Ok(self.txn.get_scheduling_block(&sbi_id)?),
            None => Ok(None),
        }
    }

    /// Apply `f` to the linked SBI. No-op when nothing is linked.
    fn modify_sbi(
        &self,
        f: impl FnOnce(&mut SchedulingBlockInstance) -> CommandResult<()>,
    ) -> CommandResult<()> {
        let Some(mut sbi) = self.sbi()? else {
            debug!(subarray_id = self.id, "no SBI linked, ignoring update");
            return Ok(());
        };
        f(&mut sbi)?;
        self.txn.update_scheduling_block(&sbi)?;
        Ok(())
    }

    pub fn scan_type(&self) -> ConfigResult<Option<String>> {
        Ok(self.sbi()?.and_then(|sbi| sbi.current_scan_type))
    }

    /// Select the current scan type. It must be one the SBI defines.
    pub fn set_scan_type(&self, scan_type: Option<&str>) -> CommandResult<()> {
        self.modify_sbi(|sbi| {
            if let Some(scan_type) = scan_type {
                if !sbi.has_scan_type(scan_type) {
                    return Err(CommandError::failed(
                        format!("Scan type {scan_type} is not defined"),
                        module_path!(),
                    ));
                }
            }
            sbi.current_scan_type = scan_type.map(str::to_string);
            Ok(())
        })
    }

    pub fn scan_id(&self) -> ConfigResult<Option<i64>> {
        Ok(self.sbi()?.and_then(|sbi| sbi.scan_id))
    }

    pub fn set_scan_id(&self, scan_id: Option<i64>) -> CommandResult<()> {
        self.modify_sbi(|sbi| {
            sbi.scan_id = scan_id;
            Ok(())
        })
    }

    /// Receive addresses published by the SBI's receive processing block.
    pub fn receive_addresses(&self) -> ConfigResult<Option<Value>> {
        let Some(pb_id) = self.sbi()?.and_then(|sbi| sbi.pb_receive_addresses) else {
            return Ok(None);
        };
        let state: Option<ProcessingBlockState> = self.txn.get_processing_block_state(&pb_id)?;
        Ok(state.and_then(|s| s.receive_addresses))
    }

    /// Add scan types to the linked SBI. Redefining an existing id fails.
    pub fn add_scan_types(&self, new_scan_types: Option<Vec<ScanType>>) -> CommandResult<()> {
        let Some(new_scan_types) = new_scan_types else {
            return Ok(());
        };
        self.modify_sbi(|sbi| {
            for scan_type in new_scan_types {
                if sbi.has_scan_type(&scan_type.id) {
                    return Err(CommandError::failed(
                        format!("Scan type {} is already defined", scan_type.id),
                        module_path!(),
                    ));
                }
                sbi.scan_types.push(scan_type);
            }
            Ok(())
        })
    }

    /// Create the SBI and its processing blocks and link the SBI to this
    /// subarray. Any existing id fails the whole transaction.
    pub fn create_sbi_and_pbs(
        &self,
        mut sbi: SchedulingBlockInstance,
        pbs: &[ProcessingBlock],
    ) -> CommandResult<()> {
        sbi.subarray_id = Some(self.id.to_string());
        self.txn.create_scheduling_block(&sbi).map_err(duplicate)?;
        for pb in pbs {
            self.txn.create_processing_block(pb).map_err(duplicate)?;
        }
        let sbi_id = sbi.id.clone();
        self.modify(|r| r.sbi_id = Some(sbi_id))?;
        info!(subarray_id = self.id, sbi_id = %sbi.id, pbs = pbs.len(), "created SBI and PBs");
        Ok(())
    }

    pub fn finish_sbi(&self) -> CommandResult<()> {
        self.end_sbi(SbiStatus::Finished)
    }

    pub fn cancel_sbi(&self) -> CommandResult<()> {
        self.end_sbi(SbiStatus::Cancelled)
    }

    /// Break the link between the subarray and its SBI. The SBI side is
    /// released first, then the subarray's forward link is cleared.
    fn end_sbi(&self, status: SbiStatus) -> CommandResult<()> {
        let Some(sbi_id) = self.sbi_id()? else {
            return Ok(());
        };
        if let Some(mut sbi) = self.txn.get_scheduling_block(&sbi_id)? {
            sbi.status = status;
            sbi.subarray_id = None;
            sbi.current_scan_type = None;
            sbi.scan_id = None;
            self.txn.update_scheduling_block(&sbi)?;
        }
        self.modify(|r| r.sbi_id = None)?;
        info!(subarray_id = self.id, %sbi_id, ?status, "released SBI");
        Ok(())
    }

    /// Read the entry and every derived input in one go.
    pub fn snapshot(&self) -> ConfigResult<SubarraySnapshot> {
        let record = self.record()?;
        let sbi = match &record.sbi_id {
            Some(sbi_id) => self.txn.get_scheduling_block(sbi_id)?,
            None => None,
        };
        let receive_addresses = match sbi.as_ref().and_then(|s| s.pb_receive_addresses.as_deref()) {
            Some(pb_id) => self
                .txn
                .get_processing_block_state(pb_id)?
                .and_then(|s| s.receive_addresses),
            None => None,
        };
        Ok(SubarraySnapshot {
            transaction_id: record.transaction_id,
            command: record.last_command,
            state: record.state.as_deref().and_then(DevState::from_name),
            obs_state_target: record
                .obs_state_target
                .as_deref()
                .and_then(ObsState::from_name),
            sbi_id: record.sbi_id,
            scan_type: sbi.as_ref().and_then(|s| s.current_scan_type.clone()),
            scan_id: sbi.as_ref().and_then(|s| s.scan_id),
            receive_addresses,
        })
    }
}

fn duplicate(e: ConfigError) -> CommandError {
    if e.is_collision() {
        CommandError::failed(e.to_string(), module_path!())
    } else {
        e.into()
    }
}
