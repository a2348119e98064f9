//! Command execution: serialization, guards, transaction ids and the
//! handshake with the scheduler.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::info;

use crate::error::{CommandError, CommandResult};
use crate::event_loop::Scheduler;
use crate::events::EventQueue;
use crate::observability::command_span;

/// Parsed command parameters.
#[derive(Debug, Clone)]
pub struct CommandParams {
    /// The raw JSON argument, handed to payload validators unchanged.
    pub raw: String,
    pub transaction_id: String,
}

impl CommandParams {
    /// Parse a command argument. An empty argument is treated as `{}`.
    pub fn parse(params_json: &str) -> CommandResult<Self> {
        let raw = if params_json.trim().is_empty() {
            "{}".to_string()
        } else {
            params_json.to_string()
        };
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            CommandError::failed(
                format!("Unable to parse command argument as JSON: {e}"),
                module_path!(),
            )
        })?;
        let Value::Object(map) = value else {
            return Err(CommandError::failed(
                "Command argument must be a JSON object",
                module_path!(),
            ));
        };
        let transaction_id = transaction_id(&map).unwrap_or_else(new_transaction_id);
        Ok(Self {
            raw,
            transaction_id,
        })
    }
}

fn transaction_id(params: &Map<String, Value>) -> Option<String> {
    params
        .get("transaction_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// A locally generated transaction id.
pub fn new_transaction_id() -> String {
    format!("txn-local-{}", uuid::Uuid::new_v4().simple())
}

/// Runs a device's commands one at a time.
pub struct CommandRunner {
    device: String,
    scheduler: Box<dyn Scheduler>,
    events: Arc<EventQueue>,
    serial: Mutex<()>,
}

impl CommandRunner {
    pub fn new(device: impl Into<String>, scheduler: Box<dyn Scheduler>, events: Arc<EventQueue>) -> Self {
        Self {
            device: device.into(),
            scheduler,
            events,
            serial: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Execute a command.
    ///
    /// `guard` is checked first and is the only veto: it runs before the
    /// argument is parsed and before anything is written. `body` receives the
    /// parsed parameters and performs the database write; the call returns
    /// once the scheduler reports the write as published. Change events
    /// raised meanwhile are delivered after the hold lock is released.
    pub fn run(
        &self,
        command: &str,
        params_json: &str,
        guard: impl FnOnce() -> CommandResult<()>,
        mut body: impl FnMut(&CommandParams) -> CommandResult<()>,
    ) -> CommandResult<()> {
        let _serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        info!(device = %self.device, command, "command received");
        guard()?;
        let params = CommandParams::parse(params_json)?;

        let span = command_span(&self.device, command, &params.transaction_id);
        let _enter = span.enter();
        info!(command, params = %params.raw, "transaction enter");

        self.events.defer();
        let result = self.scheduler.execute(command, &mut || body(&params));
        self.events.flush();

        match &result {
            Ok(()) => info!(command, "transaction exit"),
            Err(e) => info!(command, reason = %e.reason(), error = %e, "transaction exit"),
        }
        result
    }
}
