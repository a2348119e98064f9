//! Span constructors shared by the command path and the reconciliation
//! worker, so every log line carries the device and transaction id.

use tracing::Span;

/// Span for one command invocation.
#[must_use]
pub fn command_span(device: &str, command: &str, transaction_id: &str) -> Span {
    tracing::info_span!(
        "command",
        device = device,
        command = command,
        transaction_id = transaction_id,
    )
}

/// Span for one reconciliation pass. `transaction_id` is the id stamped on
/// the entry being applied, if any.
#[must_use]
pub fn reconcile_span(device: &str, transaction_id: Option<&str>) -> Span {
    tracing::info_span!(
        "reconcile",
        device = device,
        transaction_id = transaction_id.unwrap_or("none"),
    )
}
