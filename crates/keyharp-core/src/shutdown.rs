// Cancellation signal shared by every blocking wait in the pipeline.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot teardown signal. Cloning shares the signal.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    /// Trigger teardown and wake everything sleeping on this signal.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap()
    }

    /// Sleep for `duration`, waking early on teardown. Returns whether
    /// teardown was triggered.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut triggered = lock.lock().unwrap();
        loop {
            if *triggered {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(triggered, deadline - now).unwrap();
            triggered = guard;
        }
    }
}
