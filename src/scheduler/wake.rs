use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Settable-until-reset wake signal with a bounded wait.
///
/// A signal raised with nobody waiting is remembered until [`reset`](Self::reset),
/// so a producer racing the scheduling loop's sleep is never lost.
#[derive(Debug, Default)]
pub struct WakeGate {
    set: Mutex<bool>,
    notify: Notify,
}

impl WakeGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the signal and wake every current waiter.
    pub fn signal(&self) {
        *self.lock() = true;
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    /// Wait until the signal is raised or `max` elapses. Returns whether the
    /// signal is set.
    pub async fn wait(&self, max: Duration) -> bool {
        let deadline = Instant::now() + max;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent signal
            // between the check and the await still wakes us.
            notified.as_mut().enable();
            if *self.lock() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return *self.lock();
            }
        }
    }

    /// Wait, then clear the signal for the next round.
    pub async fn wait_and_reset(&self, max: Duration) -> bool {
        let signalled = self.wait(max).await;
        self.reset();
        signalled
    }
}
