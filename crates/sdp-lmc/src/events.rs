//! Attribute change notifications.
//!
//! Subscribers receive a [`ChangeEvent`] over a channel each time a
//! published attribute changes value. While a command is in progress,
//! events are held back and delivered once the command has released the
//! hold lock.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::attributes::AttributeValue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub device: String,
    pub attribute: &'static str,
    pub before: AttributeValue,
    pub after: AttributeValue,
}

#[derive(Default)]
struct Deferral {
    active: bool,
    queue: Vec<ChangeEvent>,
}

/// Fan-out of change events to subscribers, with optional deferral.
#[derive(Default)]
pub struct EventQueue {
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
    deferral: Mutex<Deferral>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver an event now, or queue it if delivery is deferred.
    pub fn push(&self, event: ChangeEvent) {
        {
            let mut deferral = lock(&self.deferral);
            if deferral.active {
                deferral.queue.push(event);
                return;
            }
        }
        self.deliver(vec![event]);
    }

    /// Start holding events back until the next [`EventQueue::flush`].
    pub fn defer(&self) {
        lock(&self.deferral).active = true;
    }

    /// Stop deferring and deliver everything queued so far, in order.
    pub fn flush(&self) {
        let queued = {
            let mut deferral = lock(&self.deferral);
            deferral.active = false;
            std::mem::take(&mut deferral.queue)
        };
        if !queued.is_empty() {
            debug!(count = queued.len(), "flushing deferred change events");
            self.deliver(queued);
        }
    }

    fn deliver(&self, events: Vec<ChangeEvent>) {
        let mut subscribers = lock(&self.subscribers);
        for event in events {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
