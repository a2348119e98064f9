//! Pieces shared by the master and subarray devices: the device interface
//! the API layer talks to, published attribute slots and command guards.

use std::fmt::Display;
use std::sync::mpsc::Receiver;

use serde::Serialize;
use tracing::info;

use crate::attributes::AttributeValue;
use crate::error::{AttributeError, CommandError, CommandResult, LmcError};
use crate::events::{ChangeEvent, EventQueue};

/// Version reported by the `version` attribute.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Master,
    Subarray,
}

/// A device as seen from outside: named attributes and named commands that
/// take a JSON string argument.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    fn version(&self) -> &'static str {
        VERSION
    }

    /// Names of the commands [`Device::command_inout`] accepts.
    fn commands(&self) -> &'static [&'static str];

    /// Invoke a command by name. Returns `None` for an unknown command.
    fn command_inout(&self, command: &str, argument: &str) -> Option<CommandResult<()>>;

    /// Every published attribute, in a stable order.
    fn attributes(&self) -> Vec<(&'static str, AttributeValue)>;

    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Write a writable attribute from its string form.
    fn write_attribute(&self, name: &str, value: &str) -> Result<(), AttributeError>;

    /// Run one reconciliation pass immediately.
    fn update_attributes(&self) -> Result<(), LmcError>;

    /// Receive a [`ChangeEvent`] for every published attribute change.
    fn subscribe(&self) -> Receiver<ChangeEvent>;

    /// Stop the reconciliation worker.
    fn shutdown(&self);
}

/// A published attribute value that announces its changes.
#[derive(Debug, Clone)]
pub struct Attribute<T> {
    name: &'static str,
    value: T,
}

impl<T> Attribute<T>
where
    T: Clone + PartialEq + Into<AttributeValue>,
{
    pub fn new(name: &'static str, value: T) -> Self {
        Self { name, value }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> T {
        self.value.clone()
    }

    pub fn value(&self) -> AttributeValue {
        self.value.clone().into()
    }

    /// Store `value` and push a change event if it differs from the current
    /// one. Returns whether it changed.
    pub fn set(&mut self, value: T, device: &str, events: &EventQueue) -> bool {
        if self.value == value {
            return false;
        }
        let before = std::mem::replace(&mut self.value, value);
        let event = ChangeEvent {
            device: device.to_string(),
            attribute: self.name,
            before: before.into(),
            after: self.value(),
        };
        info!(device, attribute = self.name, before = %event.before, after = %event.after, "attribute changed");
        events.push(event);
        true
    }
}

/// Check that a command is allowed while `attribute` has `value`.
///
/// The failure names the command, the attribute and its offending value,
/// and gives `<device_class>.is_<command>_allowed()` as the origin.
pub fn command_allowed<T>(
    device_class: &str,
    command: &str,
    attribute: &str,
    value: Option<T>,
    allowed: &[T],
) -> CommandResult<()>
where
    T: Display + PartialEq,
{
    match &value {
        Some(v) if allowed.contains(v) => Ok(()),
        _ => {
            let shown = value.as_ref().map_or_else(|| "None".to_string(), |v| v.to_string());
            Err(CommandError::not_allowed(
                format!("Command {command} not allowed when {attribute} is {shown}"),
                format!("{device_class}.is_{command}_allowed()"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{DevState, ObsState};
    use crate::error::Reason;

    #[test]
    fn test_attribute_set_pushes_only_on_change() {
        let events = EventQueue::new();
        let rx = events.subscribe();
        let mut attr = Attribute::new("obsState", None::<ObsState>);

        assert!(attr.set(Some(ObsState::Empty), "dev", &events));
        assert!(!attr.set(Some(ObsState::Empty), "dev", &events));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.attribute, "obsState");
        assert_eq!(event.before, AttributeValue::ObsState(None));
        assert_eq!(event.after, AttributeValue::ObsState(Some(ObsState::Empty)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_command_allowed_message() {
        assert!(command_allowed("SDPMaster", "On", "device state", Some(DevState::Off), &[DevState::Off]).is_ok());

        let err = command_allowed(
            "SDPSubarray",
            "Scan",
            "obsState",
            Some(ObsState::Idle),
            &[ObsState::Ready],
        )
        .unwrap_err();
        assert_eq!(err.reason(), Reason::CommandNotAllowed);
        assert_eq!(err.description(), "Command Scan not allowed when obsState is IDLE");
        assert_eq!(err.origin(), "SDPSubarray.is_Scan_allowed()");

        let err = command_allowed::<ObsState>("SDPSubarray", "End", "obsState", None, &[ObsState::Ready])
            .unwrap_err();
        assert_eq!(err.description(), "Command End not allowed when obsState is None");
    }
}
