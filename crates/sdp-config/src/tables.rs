//! redb table definitions for the configuration database.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Key of the single master entry in [`MASTER`].
pub const MASTER_KEY: &str = "master";

/// The master device entry, stored under [`MASTER_KEY`].
pub const MASTER: TableDefinition<&str, &[u8]> = TableDefinition::new("master");

/// Subarray entries keyed by zero-padded subarray id (`01`, `02`, ...).
pub const SUBARRAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("subarrays");

/// Scheduling block instances keyed by `{sbi_id}`.
pub const SCHEDULING_BLOCKS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scheduling_blocks");

/// Processing blocks keyed by `{pb_id}`.
pub const PROCESSING_BLOCKS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("processing_blocks");

/// Processing block runtime state keyed by `{pb_id}`.
pub const PROCESSING_BLOCK_STATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("processing_block_states");

/// All tables, in creation order.
pub const ALL: [TableDefinition<&str, &[u8]>; 5] = [
    MASTER,
    SUBARRAYS,
    SCHEDULING_BLOCKS,
    PROCESSING_BLOCKS,
    PROCESSING_BLOCK_STATES,
];
