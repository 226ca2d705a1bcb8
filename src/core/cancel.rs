// Shared cancellation signal with a wait that wakes as soon as cancel is requested.
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    canceled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut canceled = self
            .inner
            .canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *canceled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        *self
            .inner
            .canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for up to `timeout`; returns `true` if the token was (or became) canceled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut canceled = self
            .inner
            .canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*canceled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(canceled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            canceled = guard;
        }
        true
    }
}
