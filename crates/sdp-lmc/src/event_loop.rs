//! Reconciliation of published attributes with the configuration database.
//!
//! A device's published attributes are derived from the database, never set
//! directly by commands. Two [`Scheduler`] strategies drive that derivation:
//!
//! - [`WatchLoop`] runs a worker thread that re-derives the attributes after
//!   every committed change. A command writes its intent while holding the
//!   hold lock, then waits on a condition variable until the worker has
//!   applied a pass that includes the write.
//! - [`ManualLoop`] has no worker. Commands return as soon as their write
//!   commits and attributes only change on [`Scheduler::update_attributes`].
//!
//! The hold lock is shared by the worker's apply phase and a command's
//! write-then-wait phase, so a waiting command cannot miss the pass that
//! picks up its own write.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sdp_config::{ConfigDb, Txn, WatchHandle, Watcher};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{CommandResult, LmcError};
use crate::settings::EventLoopSettings;

/// Derives a device's published attributes from one transaction.
pub trait Reconcile: Send + Sync + 'static {
    fn device_name(&self) -> &str;

    /// Read the device's entries and publish every attribute that changed.
    fn set_attributes_from_config(&self, txn: &Txn) -> Result<(), LmcError>;
}

/// Strategy that decides when reconciliation passes run.
pub trait Scheduler: Send + Sync {
    /// Start reconciling. Calling it again while running does nothing.
    fn start(&self) -> Result<(), LmcError>;

    /// Run a command body that writes to the database, then return once
    /// the result has been published.
    fn execute(
        &self,
        command: &str,
        body: &mut dyn FnMut() -> CommandResult<()>,
    ) -> CommandResult<()>;

    /// Run one reconciliation pass now.
    fn update_attributes(&self) -> Result<(), LmcError>;

    /// Stop reconciling and release the worker, if any.
    fn stop(&self);

    fn state(&self) -> LoopState;
}

/// Lifecycle of the reconciliation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    /// Not watching; passes only run on request.
    Idle,
    /// Blocked on the database watcher.
    Watching,
    /// Applying a pass under the hold lock.
    Applying,
    Stopping,
    Stopped,
}

/// Build the scheduler the settings ask for.
pub fn new_scheduler(
    settings: &EventLoopSettings,
    store: ConfigDb,
    reconciler: Arc<dyn Reconcile>,
) -> Box<dyn Scheduler> {
    if settings.enabled {
        Box::new(WatchLoop::new(settings, store, reconciler))
    } else {
        Box::new(ManualLoop::new(store, reconciler))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One reconciliation pass in its own transaction. A panic inside the pass
/// is contained and reported as an error.
fn apply_pass(store: &ConfigDb, reconciler: &dyn Reconcile) -> Result<(), LmcError> {
    match catch_unwind(AssertUnwindSafe(|| {
        store.transaction(|txn| reconciler.set_attributes_from_config(txn))
    })) {
        Ok(result) => result,
        Err(panic) => Err(LmcError::Panicked(panic_message(panic.as_ref()))),
    }
}

// ── Poll-once mode ────────────────────────────────────────────────

/// Scheduler without a worker thread.
pub struct ManualLoop {
    store: ConfigDb,
    reconciler: Arc<dyn Reconcile>,
}

impl ManualLoop {
    pub fn new(store: ConfigDb, reconciler: Arc<dyn Reconcile>) -> Self {
        Self { store, reconciler }
    }
}

impl Scheduler for ManualLoop {
    fn start(&self) -> Result<(), LmcError> {
        debug!(device = self.reconciler.device_name(), "event loop disabled");
        Ok(())
    }

    fn execute(
        &self,
        command: &str,
        body: &mut dyn FnMut() -> CommandResult<()>,
    ) -> CommandResult<()> {
        debug!(command, "executing without event loop");
        body()
    }

    fn update_attributes(&self) -> Result<(), LmcError> {
        apply_pass(&self.store, self.reconciler.as_ref())
    }

    fn stop(&self) {}

    fn state(&self) -> LoopState {
        LoopState::Idle
    }
}

// ── Watch mode ────────────────────────────────────────────────────

/// State guarded by the hold lock.
#[derive(Default)]
struct Hold {
    /// Set once at shutdown; the worker exits when it sees it.
    deleting: bool,
    /// Whether a worker is alive to publish passes.
    running: bool,
    /// Passes attempted, successful or not.
    passes: u64,
    /// Passes that published successfully.
    generation: u64,
}

struct Shared {
    store: ConfigDb,
    reconciler: Arc<dyn Reconcile>,
    hold: Mutex<Hold>,
    applied: Condvar,
    watch: Mutex<Option<WatchHandle>>,
    state: Mutex<LoopState>,
    wait_timeout: Option<Duration>,
}

impl Shared {
    fn device(&self) -> &str {
        self.reconciler.device_name()
    }

    fn set_state(&self, state: LoopState) {
        *lock(&self.state) = state;
    }

    /// Apply one pass while the caller holds the hold lock, then wake every
    /// waiter.
    fn apply_locked(&self, hold: &mut Hold) -> Result<(), LmcError> {
        self.set_state(LoopState::Applying);
        let result = apply_pass(&self.store, self.reconciler.as_ref());
        hold.passes += 1;
        if result.is_ok() {
            hold.generation += 1;
        }
        self.applied.notify_all();
        result
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Scheduler backed by a worker thread watching the database.
pub struct WatchLoop {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    join_timeout: Duration,
}

impl WatchLoop {
    pub fn new(settings: &EventLoopSettings, store: ConfigDb, reconciler: Arc<dyn Reconcile>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                reconciler,
                hold: Mutex::new(Hold::default()),
                applied: Condvar::new(),
                watch: Mutex::new(None),
                state: Mutex::new(LoopState::Idle),
                wait_timeout: settings.command_wait_timeout(),
            }),
            worker: Mutex::new(None),
            join_timeout: settings.join_timeout(),
        }
    }

    /// Number of passes that have published successfully.
    pub fn generation(&self) -> u64 {
        lock(&self.shared.hold).generation
    }

    fn run(shared: Arc<Shared>, mut watcher: Watcher, done: Sender<()>) {
        info!(device = shared.device(), "event loop started");
        loop {
            {
                let mut hold = lock(&shared.hold);
                if hold.deleting {
                    break;
                }
                if let Err(e) = shared.apply_locked(&mut hold) {
                    error!(device = shared.device(), error = %e, "reconciliation pass failed");
                }
            }

            shared.set_state(LoopState::Watching);
            match watcher.next() {
                Some(wake) => debug!(device = shared.device(), ?wake, "watcher woke"),
                None => break,
            }
        }

        shared.set_state(LoopState::Stopping);
        lock(&shared.hold).running = false;
        shared.applied.notify_all();
        *lock(&shared.watch) = None;
        shared.set_state(LoopState::Stopped);
        info!(device = shared.device(), "event loop stopped");
        // The receiver is gone if stop() already gave up on us.
        let _ = done.send(());
    }

    /// Block until `done` returns true or the worker has gone away.
    fn wait_until<'a>(
        &'a self,
        hold: MutexGuard<'a, Hold>,
        timeout: Option<Duration>,
        mut pending: impl FnMut(&Hold) -> bool,
    ) -> (MutexGuard<'a, Hold>, bool) {
        let applied = &self.shared.applied;
        match timeout {
            None => {
                let guard = applied
                    .wait_while(hold, |h| h.running && pending(h))
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
            Some(timeout) => {
                let (guard, result) = applied
                    .wait_timeout_while(hold, timeout, |h| h.running && pending(h))
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, result.timed_out())
            }
        }
    }
}

impl Scheduler for WatchLoop {
    fn start(&self) -> Result<(), LmcError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            debug!(device = self.shared.device(), "event loop already running");
            return Ok(());
        }

        // Watch from before the first pass so no change can slip in between.
        let watcher = self.shared.store.watcher();
        *lock(&self.shared.watch) = Some(watcher.handle());
        {
            let mut hold = lock(&self.shared.hold);
            hold.deleting = false;
            hold.running = true;
        }

        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("event-loop:{}", self.shared.device()))
            .spawn(move || Self::run(shared, watcher, done_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                lock(&self.shared.hold).running = false;
                *lock(&self.shared.watch) = None;
                return Err(LmcError::Spawn(e));
            }
        };
        *worker = Some(Worker {
            handle,
            done: done_rx,
        });
        drop(worker);

        // Make the initial pass visible before returning.
        let hold = lock(&self.shared.hold);
        let (_hold, _) = self.wait_until(hold, None, |h| h.passes == 0);
        Ok(())
    }

    fn execute(
        &self,
        command: &str,
        body: &mut dyn FnMut() -> CommandResult<()>,
    ) -> CommandResult<()> {
        let hold = lock(&self.shared.hold);
        if !hold.running {
            drop(hold);
            warn!(command, "event loop not running, not waiting for update");
            return body();
        }

        let revision = self.shared.store.revision();
        let seen = hold.generation;
        debug!(command, "executing");
        body()?;
        if self.shared.store.revision() == revision {
            debug!(command, "nothing committed, not waiting for update");
            return Ok(());
        }

        debug!(command, "waiting for update");
        let (hold, timed_out) =
            self.wait_until(hold, self.shared.wait_timeout, |h| h.generation == seen);
        if timed_out {
            warn!(command, "timed out waiting for update");
        } else if hold.generation == seen {
            warn!(command, "event loop stopped before the update was applied");
        } else {
            debug!(command, "update received");
        }
        Ok(())
    }

    fn update_attributes(&self) -> Result<(), LmcError> {
        let mut hold = lock(&self.shared.hold);
        let result = self.shared.apply_locked(&mut hold);
        if hold.running {
            self.shared.set_state(LoopState::Watching);
        }
        result
    }

    fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        info!(device = self.shared.device(), "stopping event loop");
        lock(&self.shared.hold).deleting = true;
        self.shared.applied.notify_all();
        if let Some(handle) = lock(&self.shared.watch).as_ref() {
            handle.trigger();
        }

        match worker.done.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!(device = self.shared.device(), "event loop thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    device = self.shared.device(),
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "event loop did not stop in time, abandoning it"
                );
            }
        }
    }

    fn state(&self) -> LoopState {
        *lock(&self.shared.state)
    }
}

impl Drop for WatchLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
