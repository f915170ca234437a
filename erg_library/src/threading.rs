use crate::clock::now;
use crate::transaction::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::thread::JoinHandle as OsHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Time left in the current period, zero if it already passed
pub fn sleep_time(period: Duration, start_t: Instant) -> Duration {
    period.saturating_sub(start_t.elapsed())
}

/// Run `function` on a new OS thread named after `tid`.
/// For code that must not share a scheduler with the caller, e.g. reading sensors at a fixed period.
pub fn os_thread<T, F>(tid: TransactionId, function: F) -> anyhow::Result<OsHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(TransactionId) -> T + Send + 'static,
{
    let handle = std::thread::Builder::new().name(tid.clone()).spawn(move || {
        debug!(tid=tid, "OS worker thread started");
        function(tid)
    })?;
    Ok(handle)
}

/// A one-way flag threads can block on.
/// Once set it stays set.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}
impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut f = self.flag.lock();
        *f = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    pub fn wait(&self) {
        let mut f = self.flag.lock();
        while !*f {
            self.cond.wait(&mut f);
        }
    }

    /// Block until set or `timeout` passes. Returns whether the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = now() + timeout;
        let mut f = self.flag.lock();
        while !*f {
            if self.cond.wait_until(&mut f, deadline).timed_out() {
                return *f;
            }
        }
        true
    }
}
