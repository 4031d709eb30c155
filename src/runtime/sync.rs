//! Small blocking primitives shared by the worker threads.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Counting semaphore used to wake the send thread.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Add one permit and wake a waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

}

/// Cooperative stop flag that periodic threads can sleep on.
///
/// `trigger` wakes every sleeper immediately so they observe the flag
/// without waiting out their polling interval.
pub struct Shutdown {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Set the flag. Returns `false` if it was already set.
    pub fn trigger(&self) -> bool {
        let _guard = self.lock.lock();
        let first = !self.flag.swap(true, Ordering::AcqRel);
        self.cond.notify_all();
        first
    }

    /// Sleep for `interval` or until triggered. Returns `true` once triggered.
    pub fn sleep(&self, interval: Duration) -> bool {
        let mut guard = self.lock.lock();
        if !self.is_triggered() {
            self.cond.wait_for(&mut guard, interval);
        }
        self.is_triggered()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
