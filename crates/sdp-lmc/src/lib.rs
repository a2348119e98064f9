//! sdp-lmc: local monitoring and control devices for the SDP.
//!
//! Provides the master device (overall on/off/standby lifecycle) and the
//! subarray device (resource assignment, scan configuration, scanning,
//! abort and reset) on top of the [`sdp_config`] configuration database.
//!
//! # Architecture
//!
//! A device never sets its published attributes from a command. Commands
//! check a guard against the published state, then write their intent into
//! the database in one transaction. A [`Scheduler`](event_loop::Scheduler)
//! re-derives the published attributes from the database: in watch mode a
//! worker thread does so after every committed change and the command waits
//! for that pass before returning; in poll-once mode the pass only runs on
//! [`Device::update_attributes`](device::Device::update_attributes).
//!
//! The subarray's `obsState` is never stored. It is derived from the stored
//! target, the last command and the receive addresses published by the
//! receive processing block (see [`obs_state`]).

pub mod attributes;
pub mod commands;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod master;
pub mod master_config;
pub mod obs_state;
pub mod observability;
pub mod settings;
pub mod subarray;
pub mod subarray_config;
pub mod validation;

pub use attributes::{AdminMode, AttributeValue, DevState, HealthState, ObsState};
pub use device::{Device, DeviceKind, VERSION};
pub use error::{AttributeError, CommandError, CommandResult, LmcError, Reason};
pub use event_loop::{LoopState, Scheduler};
pub use events::ChangeEvent;
pub use master::MasterDevice;
pub use settings::{LmcSettings, StoreBackend};
pub use subarray::SubarrayDevice;
