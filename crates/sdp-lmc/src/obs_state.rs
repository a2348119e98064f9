//! Derivation of the published obsState.
//!
//! obsState is never stored. The subarray entry only records the state an
//! in-flight transition is heading for; the published value is computed from
//! that target, the last command and, while resources are being assigned,
//! whether the receive processing block has published its addresses.

use crate::attributes::ObsState;
use crate::subarray_config::SubarraySnapshot;

/// Command whose IDLE target waits on receive addresses.
pub const ASSIGN_RESOURCES: &str = "AssignResources";

/// Compute the published obsState.
///
/// After `AssignResources` the subarray reports `RESOURCING` until the
/// receive addresses resolve, then `IDLE`. Everything else publishes the
/// stored target unchanged.
pub fn derive(
    target: Option<ObsState>,
    last_command: Option<&str>,
    receive_addresses_resolved: bool,
) -> Option<ObsState> {
    match (target, last_command) {
        (Some(ObsState::Idle), Some(ASSIGN_RESOURCES)) if !receive_addresses_resolved => {
            Some(ObsState::Resourcing)
        }
        _ => target,
    }
}

pub fn derive_obs_state(snapshot: &SubarraySnapshot) -> Option<ObsState> {
    derive(
        snapshot.obs_state_target,
        snapshot.command.as_deref(),
        snapshot.receive_addresses.is_some(),
    )
}
