//! The SDP master device.
//!
//! Controls the overall on/off/standby/disable lifecycle. Commands write the
//! requested state into the master entry; the published `State` follows once
//! the reconciliation pass has read it back.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sdp_config::{ConfigDb, Txn};
use tracing::info;

use crate::attributes::{AttributeValue, DevState, HealthState};
use crate::commands::{CommandParams, CommandRunner};
use crate::device::{Attribute, Device, DeviceKind, VERSION, command_allowed};
use crate::error::{AttributeError, CommandResult, LmcError};
use crate::event_loop::{Reconcile, new_scheduler};
use crate::events::{ChangeEvent, EventQueue};
use crate::master_config::MasterView;
use crate::observability::reconcile_span;
use crate::settings::LmcSettings;

const DEVICE_CLASS: &str = "SDPMaster";
const COMMANDS: &[&str] = &["On", "Off", "Standby", "Disable"];

struct MasterAttributes {
    state: Attribute<Option<DevState>>,
    health_state: Attribute<Option<HealthState>>,
}

/// Published state of the master, shared with the reconciliation worker.
struct MasterCore {
    name: String,
    events: Arc<EventQueue>,
    attributes: Mutex<MasterAttributes>,
}

impl MasterCore {
    fn attributes(&self) -> MutexGuard<'_, MasterAttributes> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> Option<DevState> {
        self.attributes().state.get()
    }

    fn set_health_state(&self, value: HealthState) {
        self.attributes()
            .health_state
            .set(Some(value), &self.name, &self.events);
    }

    fn allowed_state(&self, command: &str, allowed: &[DevState]) -> CommandResult<()> {
        command_allowed(DEVICE_CLASS, command, "device state", self.state(), allowed)
    }
}

impl Reconcile for MasterCore {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn set_attributes_from_config(&self, txn: &Txn) -> Result<(), LmcError> {
        let master = MasterView::new(txn);
        let transaction_id = master.transaction_id()?;
        let span = reconcile_span(&self.name, transaction_id.as_deref());
        let _enter = span.enter();

        // An unreadable state leaves the published one alone.
        if let Some(state) = master.state()? {
            self.attributes().state.set(Some(state), &self.name, &self.events);
        }
        Ok(())
    }
}

/// SDP master device.
pub struct MasterDevice {
    core: Arc<MasterCore>,
    store: ConfigDb,
    runner: CommandRunner,
}

impl MasterDevice {
    /// Create the device, initialise its database entry and start
    /// reconciling.
    pub fn new(name: &str, settings: &LmcSettings, store: ConfigDb) -> Result<Self, LmcError> {
        info!(device = name, "SDP master initialising");
        let events = Arc::new(EventQueue::new());
        let core = Arc::new(MasterCore {
            name: name.to_string(),
            events: Arc::clone(&events),
            attributes: Mutex::new(MasterAttributes {
                state: Attribute::new("State", Some(DevState::Init)),
                health_state: Attribute::new("healthState", None),
            }),
        });
        core.set_health_state(HealthState::Ok);

        store.transaction(|txn| MasterView::new(txn).create_if_not_present(DevState::Standby))?;

        let scheduler = new_scheduler(&settings.event_loop, store.clone(), core.clone());
        let runner = CommandRunner::new(name, scheduler, events);
        runner.scheduler().start()?;

        info!(device = name, "SDP master initialised");
        Ok(Self {
            core,
            store,
            runner,
        })
    }

    pub fn state(&self) -> Option<DevState> {
        self.core.state()
    }

    pub fn health_state(&self) -> Option<HealthState> {
        self.core.attributes().health_state.get()
    }

    fn set_state(&self, command: &str, params_json: &str, allowed: &[DevState], target: DevState) -> CommandResult<()> {
        self.runner.run(
            command,
            params_json,
            || self.core.allowed_state(command, allowed),
            |params: &CommandParams| {
                self.store.transaction(|txn| {
                    let master = MasterView::new(txn);
                    master.set_transaction_id(&params.transaction_id)?;
                    master.set_state(target)?;
                    Ok(())
                })
            },
        )
    }

    /// Turn the SDP on.
    pub fn on(&self, params_json: &str) -> CommandResult<()> {
        self.set_state(
            "On",
            params_json,
            &[DevState::Off, DevState::Standby, DevState::Disable],
            DevState::On,
        )
    }

    /// Set the SDP to disable.
    pub fn disable(&self, params_json: &str) -> CommandResult<()> {
        self.set_state(
            "Disable",
            params_json,
            &[DevState::Off, DevState::Standby, DevState::On],
            DevState::Disable,
        )
    }

    /// Set the SDP to standby.
    pub fn standby(&self, params_json: &str) -> CommandResult<()> {
        self.set_state(
            "Standby",
            params_json,
            &[DevState::Off, DevState::Disable, DevState::On],
            DevState::Standby,
        )
    }

    /// Turn the SDP off.
    pub fn off(&self, params_json: &str) -> CommandResult<()> {
        self.set_state(
            "Off",
            params_json,
            &[DevState::Standby, DevState::Disable, DevState::On],
            DevState::Off,
        )
    }
}

impl Device for MasterDevice {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Master
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    fn command_inout(&self, command: &str, argument: &str) -> Option<CommandResult<()>> {
        let result = match command {
            "On" => self.on(argument),
            "Off" => self.off(argument),
            "Standby" => self.standby(argument),
            "Disable" => self.disable(argument),
            _ => return None,
        };
        Some(result)
    }

    fn attributes(&self) -> Vec<(&'static str, AttributeValue)> {
        let attrs = self.core.attributes();
        vec![
            (attrs.state.name(), attrs.state.value()),
            ("version", AttributeValue::Text(VERSION.to_string())),
            (attrs.health_state.name(), attrs.health_state.value()),
        ]
    }

    fn write_attribute(&self, name: &str, _value: &str) -> Result<(), AttributeError> {
        match name {
            "State" | "version" | "healthState" => Err(AttributeError::ReadOnly(name.to_string())),
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
        info!(device = %self.core.name, "deleting master device");
        self.runner.scheduler().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Reason;

    fn device(event_loop: bool) -> (MasterDevice, ConfigDb) {
        let store = ConfigDb::open_in_memory().unwrap();
        let settings = LmcSettings::in_memory(event_loop);
        let device = MasterDevice::new("test_sdp/elt/master", &settings, store.clone()).unwrap();
        (device, store)
    }

    #[test]
    fn test_init_publishes_standby() {
        let (device, _store) = device(true);
        assert_eq!(device.state(), Some(DevState::Standby));
        assert_eq!(device.health_state(), Some(HealthState::Ok));
        assert_eq!(
            device.attribute("version"),
            Some(AttributeValue::Text(VERSION.to_string()))
        );
    }

    #[test]
    fn test_state_is_init_until_first_pass() {
        let (device, _store) = device(false);
        assert_eq!(device.state(), Some(DevState::Init));
        device.update_attributes().unwrap();
        assert_eq!(device.state(), Some(DevState::Standby));
    }

    #[test]
    fn test_command_stamps_transaction_id() {
        let (device, store) = device(true);
        device.on(r#"{"transaction_id": "txn-test-1"}"#).unwrap();
        let record = store.transaction(|txn| txn.get_master()).unwrap().unwrap();
        assert_eq!(record.transaction_id.as_deref(), Some("txn-test-1"));
        assert_eq!(record.state.as_deref(), Some("ON"));
    }

    #[test]
    fn test_unknown_command_and_read_only_attributes() {
        let (device, _store) = device(false);
        assert!(device.command_inout("Scan", "{}").is_none());
        assert_eq!(
            device.write_attribute("healthState", "OK"),
            Err(AttributeError::ReadOnly("healthState".into()))
        );
        assert_eq!(
            device.write_attribute("bogus", "1"),
            Err(AttributeError::NotFound("bogus".into()))
        );
    }

    #[test]
    fn test_rejected_command_reports_state() {
        let (device, _store) = device(false);
        // Published state is still INIT before the first pass.
        let err = device.on("{}").unwrap_err();
        assert_eq!(err.reason(), Reason::CommandNotAllowed);
        assert_eq!(err.description(), "Command On not allowed when device state is INIT");
        assert_eq!(err.origin(), "SDPMaster.is_On_allowed()");
    }
}
