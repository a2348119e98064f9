//! Record types persisted in the configuration database.
//!
//! Device-facing enumerations (`state`, `obs_state_target`) are stored as
//! plain strings. Decoding them is the job of the device layer, which must
//! tolerate values it does not recognise.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scheduling block instance identifier.
pub type SbiId = String;

/// Processing block identifier.
pub type PbId = String;

// ── Master ────────────────────────────────────────────────────────

/// The master device entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MasterRecord {
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Device state name, e.g. `"STANDBY"`.
    #[serde(default)]
    pub state: Option<String>,
}

// ── Subarray ──────────────────────────────────────────────────────

/// A subarray device entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubarrayRecord {
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Name of the last command that wrote this entry.
    #[serde(default)]
    pub last_command: Option<String>,
    /// Device state name.
    #[serde(default)]
    pub state: Option<String>,
    /// Name of the obsState the in-flight transition is heading for.
    #[serde(default)]
    pub obs_state_target: Option<String>,
    /// Link to the scheduling block instance currently assigned.
    #[serde(default)]
    pub sbi_id: Option<SbiId>,
}

// ── Scheduling block instance ─────────────────────────────────────

/// A scan type declared by a scheduling block instance.
///
/// Only `id` is interpreted; every other field is carried through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanType {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScanType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
        }
    }
}

/// Lifecycle status of a scheduling block instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SbiStatus {
    Active,
    Finished,
    Cancelled,
}

/// A scheduling block instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingBlockInstance {
    pub id: SbiId,
    /// Back-reference to the owning subarray; cleared when released.
    pub subarray_id: Option<String>,
    pub scan_types: Vec<ScanType>,
    #[serde(default)]
    pub pb_realtime: Vec<PbId>,
    #[serde(default)]
    pub pb_batch: Vec<PbId>,
    /// Processing block that publishes the receive addresses.
    #[serde(default)]
    pub pb_receive_addresses: Option<PbId>,
    #[serde(default)]
    pub current_scan_type: Option<String>,
    #[serde(default)]
    pub scan_id: Option<i64>,
    pub status: SbiStatus,
}

impl SchedulingBlockInstance {
    /// A fresh, unlinked, `ACTIVE` instance.
    pub fn new(id: impl Into<SbiId>, scan_types: Vec<ScanType>) -> Self {
        Self {
            id: id.into(),
            subarray_id: None,
            scan_types,
            pb_realtime: Vec::new(),
            pb_batch: Vec::new(),
            pb_receive_addresses: None,
            current_scan_type: None,
            scan_id: None,
            status: SbiStatus::Active,
        }
    }

    pub fn has_scan_type(&self, id: &str) -> bool {
        self.scan_types.iter().any(|st| st.id == id)
    }
}

// ── Processing block ──────────────────────────────────────────────

/// Workflow descriptor of a processing block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    /// `"realtime"` or `"batch"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Workflow name.
    pub id: String,
    pub version: String,
}

/// Dependency of a batch processing block on another processing block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    pub pb_id: PbId,
    #[serde(rename = "type", default)]
    pub kind: Vec<String>,
}

/// A processing block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingBlock {
    pub id: PbId,
    pub sbi_id: SbiId,
    pub workflow: Workflow,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Runtime state of a processing block, written by the processing side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingBlockState {
    #[serde(default)]
    pub status: Option<String>,
    /// Receive addresses, once the receive workflow has computed them.
    #[serde(default)]
    pub receive_addresses: Option<Value>,
}
