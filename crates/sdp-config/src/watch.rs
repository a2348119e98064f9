//! Watching the configuration database for committed changes.
//!
//! A [`Watcher`] is a blocking iterator: each call to `next()` parks the
//! calling thread until a transaction that wrote something has committed
//! since the previous item, or until its [`WatchHandle`] is triggered.
//! Cancelling the handle ends the iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Revision counter shared by a database and all of its watchers.
#[derive(Default)]
pub(crate) struct ChangeFeed {
    revision: Mutex<u64>,
    changed: Condvar,
}

impl ChangeFeed {
    /// Record a committed change and wake every watcher.
    pub(crate) fn publish(&self) -> u64 {
        let mut revision = lock(&self.revision);
        *revision += 1;
        self.changed.notify_all();
        *revision
    }

    pub(crate) fn current(&self) -> u64 {
        *lock(&self.revision)
    }
}

#[derive(Default)]
struct WatchControl {
    triggered: AtomicBool,
    cancelled: AtomicBool,
}

/// Why a watcher woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// At least one transaction committed; `revision` is the latest.
    Changed { revision: u64 },
    /// The watcher was triggered without a store change.
    Triggered,
}

/// Blocking iterator over database changes.
pub struct Watcher {
    feed: Arc<ChangeFeed>,
    control: Arc<WatchControl>,
    seen: u64,
}

impl Watcher {
    pub(crate) fn new(feed: Arc<ChangeFeed>) -> Self {
        let seen = feed.current();
        Self {
            feed,
            control: Arc::new(WatchControl::default()),
            seen,
        }
    }

    /// A handle other threads can use to trigger or cancel this watcher.
    pub fn handle(&self) -> WatchHandle {
        WatchHandle {
            feed: Arc::clone(&self.feed),
            control: Arc::clone(&self.control),
        }
    }

    /// Like `next()`, but gives up after `timeout` and returns `None`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Wake> {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&mut self, deadline: Option<Instant>) -> Option<Wake> {
        let mut revision = lock(&self.feed.revision);
        loop {
            if self.control.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            if *revision != self.seen {
                self.seen = *revision;
                // A change subsumes any pending trigger.
                self.control.triggered.store(false, Ordering::SeqCst);
                return Some(Wake::Changed {
                    revision: self.seen,
                });
            }
            if self.control.triggered.swap(false, Ordering::SeqCst) {
                return Some(Wake::Triggered);
            }
            match deadline {
                None => {
                    revision = self
                        .feed
                        .changed
                        .wait(revision)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .feed
                        .changed
                        .wait_timeout(revision, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    revision = guard;
                }
            }
        }
    }
}

impl Iterator for Watcher {
    type Item = Wake;

    fn next(&mut self) -> Option<Wake> {
        self.wait(None)
    }
}

/// Remote control for a [`Watcher`].
#[derive(Clone)]
pub struct WatchHandle {
    feed: Arc<ChangeFeed>,
    control: Arc<WatchControl>,
}

impl WatchHandle {
    /// Force the watcher to yield its next item even if nothing changed.
    pub fn trigger(&self) {
        self.control.triggered.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// End the watcher's iteration. A blocked `next()` returns `None`.
    pub fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        // Taking the lock orders this wake-up after any in-progress check.
        let _revision = lock(&self.feed.revision);
        self.feed.changed.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
