//! The SDP subarray device.
//!
//! Drives the observation lifecycle of one subarray: resource assignment,
//! scan configuration, scanning, abort and reset. Commands write intent into
//! the subarray entry (and its SBI); the published `State`, `obsState` and
//! scan attributes are re-derived from the database by the reconciliation
//! pass.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sdp_config::{ConfigDb, Txn};
use serde_json::Value;
use tracing::{info, warn};

use crate::attributes::{AdminMode, AttributeValue, DevState, HealthState, ObsState};
use crate::commands::{CommandParams, CommandRunner};
use crate::device::{Attribute, Device, DeviceKind, VERSION, command_allowed};
use crate::error::{AttributeError, CommandResult, LmcError};
use crate::event_loop::{Reconcile, new_scheduler};
use crate::events::{ChangeEvent, EventQueue};
use crate::obs_state::derive_obs_state;
use crate::observability::reconcile_span;
use crate::settings::LmcSettings;
use crate::subarray_config::SubarrayView;
use crate::validation::{validate_assign_resources, validate_configure, validate_scan};

const DEVICE_CLASS: &str = "SDPSubarray";
const COMMANDS: &[&str] = &[
    "On",
    "Off",
    "AssignResources",
    "ReleaseResources",
    "Configure",
    "Scan",
    "EndScan",
    "End",
    "Abort",
    "ObsReset",
    "Restart",
];

/// Published `scanType` when none is selected.
const NO_SCAN_TYPE: &str = "null";

/// Subarray id from a device name such as `test_sdp/elt/subarray_1`: the
/// number after the underscore in the member part, zero-padded to two digits.
pub fn subarray_id_from_name(name: &str) -> Result<String, LmcError> {
    let number = name
        .split('/')
        .nth(2)
        .and_then(|member| member.split('_').nth(1))
        .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| LmcError::DeviceName(name.to_string()))?;
    Ok(format!("{number:0>2}"))
}

fn dump_json(value: &Option<Value>) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

struct SubarrayAttributes {
    state: Attribute<Option<DevState>>,
    obs_state: Attribute<Option<ObsState>>,
    admin_mode: Attribute<Option<AdminMode>>,
    health_state: Attribute<Option<HealthState>>,
    receive_addresses: Attribute<String>,
    scan_type: Attribute<String>,
    scan_id: Attribute<i64>,
}

struct SubarrayCore {
    name: String,
    subarray_id: String,
    events: Arc<EventQueue>,
    attributes: Mutex<SubarrayAttributes>,
}

impl SubarrayCore {
    fn attributes(&self) -> MutexGuard<'_, SubarrayAttributes> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allowed_state(&self, command: &str, allowed: &[DevState]) -> CommandResult<()> {
        let state = self.attributes().state.get();
        command_allowed(DEVICE_CLASS, command, "device state", state, allowed)
    }

    fn allowed_obs_state(&self, command: &str, allowed: &[ObsState]) -> CommandResult<()> {
        let obs_state = self.attributes().obs_state.get();
        command_allowed(DEVICE_CLASS, command, "obsState", obs_state, allowed)
    }

    /// Guard for commands that need the device ON and one of `allowed`.
    fn allowed_on(&self, command: &str, allowed: &[ObsState]) -> CommandResult<()> {
        self.allowed_state(command, &[DevState::On])?;
        self.allowed_obs_state(command, allowed)
    }
}

impl Reconcile for SubarrayCore {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn set_attributes_from_config(&self, txn: &Txn) -> Result<(), LmcError> {
        let snapshot = SubarrayView::new(txn, &self.subarray_id).snapshot()?;
        let span = reconcile_span(&self.name, snapshot.transaction_id.as_deref());
        let _enter = span.enter();

        let obs_state = derive_obs_state(&snapshot);
        let device = self.name.as_str();
        let events = self.events.as_ref();
        let mut attrs = self.attributes();

        match snapshot.state {
            Some(state) => {
                attrs.state.set(Some(state), device, events);
            }
            None => warn!("stored device state is missing or invalid"),
        }
        attrs
            .receive_addresses
            .set(dump_json(&snapshot.receive_addresses), device, events);
        attrs.scan_type.set(
            snapshot.scan_type.unwrap_or_else(|| NO_SCAN_TYPE.to_string()),
            device,
            events,
        );
        attrs.scan_id.set(snapshot.scan_id.unwrap_or(0), device, events);
        match obs_state {
            Some(obs_state) => {
                attrs.obs_state.set(Some(obs_state), device, events);
            }
            None => warn!("stored obsState target is missing or invalid"),
        }
        Ok(())
    }
}

/// SDP subarray device.
pub struct SubarrayDevice {
    core: Arc<SubarrayCore>,
    store: ConfigDb,
    runner: CommandRunner,
}

impl SubarrayDevice {
    /// Create the device, initialise its database entry and start
    /// reconciling.
    pub fn new(name: &str, settings: &LmcSettings, store: ConfigDb) -> Result<Self, LmcError> {
        info!(device = name, "SDP subarray initialising");
        let subarray_id = subarray_id_from_name(name)?;
        let events = Arc::new(EventQueue::new());
        let core = Arc::new(SubarrayCore {
            name: name.to_string(),
            subarray_id,
            events: Arc::clone(&events),
            attributes: Mutex::new(SubarrayAttributes {
                state: Attribute::new("State", Some(DevState::Init)),
                obs_state: Attribute::new("obsState", None),
                admin_mode: Attribute::new("adminMode", None),
                health_state: Attribute::new("healthState", None),
                receive_addresses: Attribute::new("receiveAddresses", dump_json(&None)),
                scan_type: Attribute::new("scanType", NO_SCAN_TYPE.to_string()),
                scan_id: Attribute::new("scanID", 0),
            }),
        });
        {
            let mut attrs = core.attributes();
            attrs.admin_mode.set(Some(AdminMode::Online), name, &events);
            attrs.health_state.set(Some(HealthState::Ok), name, &events);
        }

        store.transaction(|txn| {
            SubarrayView::new(txn, &core.subarray_id)
                .create_if_not_present(DevState::Off, ObsState::Empty)
        })?;

        let scheduler = new_scheduler(&settings.event_loop, store.clone(), core.clone());
        let runner = CommandRunner::new(name, scheduler, events);
        runner.scheduler().start()?;

        info!(device = name, subarray_id = %core.subarray_id, "SDP subarray initialised");
        Ok(Self {
            core,
            store,
            runner,
        })
    }

    pub fn subarray_id(&self) -> &str {
        &self.core.subarray_id
    }

    pub fn state(&self) -> Option<DevState> {
        self.core.attributes().state.get()
    }

    pub fn obs_state(&self) -> Option<ObsState> {
        self.core.attributes().obs_state.get()
    }

    pub fn admin_mode(&self) -> Option<AdminMode> {
        self.core.attributes().admin_mode.get()
    }

    pub fn set_admin_mode(&self, admin_mode: AdminMode) {
        self.core
            .attributes()
            .admin_mode
            .set(Some(admin_mode), &self.core.name, &self.core.events);
    }

    pub fn health_state(&self) -> Option<HealthState> {
        self.core.attributes().health_state.get()
    }

    /// Receive addresses as a JSON string; `"null"` when there are none.
    pub fn receive_addresses(&self) -> String {
        self.core.attributes().receive_addresses.get()
    }

    /// Current scan type; `"null"` when none is selected.
    pub fn scan_type(&self) -> String {
        self.core.attributes().scan_type.get()
    }

    /// Current scan id; 0 when not scanning.
    pub fn scan_id(&self) -> i64 {
        self.core.attributes().scan_id.get()
    }

    /// Run `write` against the subarray entry in one transaction, after
    /// stamping the command name and transaction id.
    fn write(
        &self,
        command: &str,
        params: &CommandParams,
        write: impl Fn(&SubarrayView<'_>) -> CommandResult<()>,
    ) -> CommandResult<()> {
        self.store.transaction(|txn| {
            let subarray = SubarrayView::new(txn, &self.core.subarray_id);
            subarray.set_command(command)?;
            subarray.set_transaction_id(&params.transaction_id)?;
            write(&subarray)
        })
    }

    /// Turn the subarray on.
    pub fn on(&self, params_json: &str) -> CommandResult<()> {
        let command = "On";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_state(command, &[DevState::Off]),
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_state(DevState::On)?;
                    subarray.set_obs_state_target(ObsState::Empty)?;
                    Ok(())
                })
            },
        )
    }

    /// Turn the subarray off. A subarray that is not EMPTY also has its
    /// scheduling block instance cancelled.
    pub fn off(&self, params_json: &str) -> CommandResult<()> {
        let command = "Off";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_state(command, &[DevState::On]),
            |params: &CommandParams| {
                let empty = self.obs_state() == Some(ObsState::Empty);
                if !empty {
                    info!("obsState is not EMPTY, cancelling the scheduling block instance");
                }
                self.write(command, params, |subarray| {
                    subarray.set_state(DevState::Off)?;
                    if !empty {
                        subarray.set_obs_state_target(ObsState::Empty)?;
                        subarray.cancel_sbi()?;
                    }
                    Ok(())
                })
            },
        )
    }

    /// Assign resources: create the scheduling block instance and its
    /// processing blocks.
    pub fn assign_resources(&self, params_json: &str) -> CommandResult<()> {
        let command = "AssignResources";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Empty]),
            |params: &CommandParams| {
                let (sbi, pbs) = validate_assign_resources(&params.raw)?;
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Idle)?;
                    subarray.create_sbi_and_pbs(sbi.clone(), &pbs)
                })
            },
        )
    }

    /// Release resources: finish the scheduling block instance.
    pub fn release_resources(&self, params_json: &str) -> CommandResult<()> {
        let command = "ReleaseResources";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Idle]),
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Empty)?;
                    subarray.finish_sbi()
                })
            },
        )
    }

    /// Configure the scan type, adding any new scan types first.
    pub fn configure(&self, params_json: &str) -> CommandResult<()> {
        let command = "Configure";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Idle, ObsState::Ready]),
            |params: &CommandParams| {
                let (new_scan_types, scan_type) = validate_configure(&params.raw)?;
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Ready)?;
                    subarray.add_scan_types(new_scan_types.clone())?;
                    subarray.set_scan_type(Some(scan_type.as_str()))
                })
            },
        )
    }

    /// Start a scan.
    pub fn scan(&self, params_json: &str) -> CommandResult<()> {
        let command = "Scan";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Ready]),
            |params: &CommandParams| {
                let scan_id = validate_scan(&params.raw)?;
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Scanning)?;
                    subarray.set_scan_id(Some(scan_id))
                })
            },
        )
    }

    /// End the scan.
    pub fn end_scan(&self, params_json: &str) -> CommandResult<()> {
        let command = "EndScan";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Scanning]),
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Ready)?;
                    subarray.set_scan_id(None)
                })
            },
        )
    }

    /// End the scan block: clear the scan type.
    pub fn end(&self, params_json: &str) -> CommandResult<()> {
        let command = "End";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Ready]),
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Idle)?;
                    subarray.set_scan_type(None)
                })
            },
        )
    }

    /// Abort the current activity.
    pub fn abort(&self, params_json: &str) -> CommandResult<()> {
        let command = "Abort";
        self.runner.run(
            command,
            params_json,
            || {
                self.core.allowed_on(
                    command,
                    &[
                        ObsState::Idle,
                        ObsState::Configuring,
                        ObsState::Ready,
                        ObsState::Scanning,
                        ObsState::Resetting,
                    ],
                )
            },
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Aborted)?;
                    Ok(())
                })
            },
        )
    }

    /// Reset to IDLE, keeping the scheduling block instance.
    pub fn obs_reset(&self, params_json: &str) -> CommandResult<()> {
        let command = "ObsReset";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Aborted, ObsState::Fault]),
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Idle)?;
                    subarray.set_scan_type(None)?;
                    subarray.set_scan_id(None)
                })
            },
        )
    }

    /// Restart in EMPTY, cancelling the scheduling block instance.
    pub fn restart(&self, params_json: &str) -> CommandResult<()> {
        let command = "Restart";
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_on(command, &[ObsState::Aborted, ObsState::Fault]),
            |params: &CommandParams| {
                self.write(command, params, |subarray| {
                    subarray.set_obs_state_target(ObsState::Empty)?;
                    subarray.cancel_sbi()
                })
            },
        )
    }
}

impl Device for SubarrayDevice {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Subarray
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    fn command_inout(&self, command: &str, argument: &str) -> Option<CommandResult<()>> {
        let result = match command {
            "On" => self.on(argument),
            "Off" => self.off(argument),
            "AssignResources" => self.assign_resources(argument),
            "ReleaseResources" => self.release_resources(argument),
            "Configure" => self.configure(argument),
            "Scan" => self.scan(argument),
            "EndScan" => self.end_scan(argument),
            "End" => self.end(argument),
            "Abort" => self.abort(argument),
            "ObsReset" => self.obs_reset(argument),
            "Restart" => self.restart(argument),
            _ => return None,
        };
        Some(result)
    }

    fn attributes(&self) -> Vec<(&'static str, AttributeValue)> {
        let attrs = self.core.attributes();
        vec![
            (attrs.state.name(), attrs.state.value()),
            ("version", AttributeValue::Text(VERSION.to_string())),
            (attrs.obs_state.name(), attrs.obs_state.value()),
            (attrs.admin_mode.name(), attrs.admin_mode.value()),
            (attrs.health_state.name(), attrs.health_state.value()),
            (attrs.receive_addresses.name(), attrs.receive_addresses.value()),
            (attrs.scan_type.name(), attrs.scan_type.value()),
            (attrs.scan_id.name(), attrs.scan_id.value()),
        ]
    }

    fn write_attribute(&self, name: &str, value: &str) -> Result<(), AttributeError> {
        match name {
            "adminMode" => {
                let mode = AdminMode::from_name(value).ok_or_else(|| AttributeError::InvalidValue {
                    attribute: name.to_string(),
                    value: value.to_string(),
                })?;
                self.set_admin_mode(mode);
                Ok(())
            }
            "State" | "version" | "obsState" | "healthState" | "receiveAddresses" | "scanType"
            | "scanID" => Err(AttributeError::ReadOnly(name.to_string())),
            _ => Err(AttributeError::NotFound(name.to_string())),
        }
    }

    fn update_attributes(&self) -> Result<(), LmcError> {
        info!(device = %self.core.name, "updating attributes");
        self.runner.scheduler().update_attributes()
    }

    fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.core.events.subscribe()
    }

    fn shutdown(&self) {
        info!(device = %self.core.name, "deleting subarray device");
        self.runner.scheduler().stop();
    }
}
