//! Cooperative statement cancellation.
//!
//! A `CancelToken` is shared between a backend and whoever may cancel its
//! current statement. The backend polls it at wait points (lock waits,
//! shared snapshot polling); `sleep` returns early as soon as the token fires.
//!
//! # Usage
//! ```ignore
//! let token = CancelToken::new();
//! let remote = token.clone();
//!
//! // In the backend:
//! loop {
//!     token.check()?;            // Err(Canceled) once fired
//!     if try_acquire() { break }
//!     token.sleep(Duration::from_millis(100));
//! }
//!
//! // From another thread:
//! remote.cancel(CancelReason::UserRequest);
//! ```

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CancelReason, MeridianError, MeridianResult};

const NOT_CANCELED: u8 = 0;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    reason: AtomicU8,
    holdoff: AtomicU32,
    deadline: Mutex<Option<(Instant, CancelReason)>>,
    mutex: Mutex<()>,
    condvar: Condvar,
}

fn encode_reason(reason: CancelReason) -> u8 {
    match reason {
        CancelReason::UserRequest => 1,
        CancelReason::StatementTimeout => 2,
        CancelReason::LockTimeout => 3,
    }
}

fn decode_reason(v: u8) -> Option<CancelReason> {
    match v {
        1 => Some(CancelReason::UserRequest),
        2 => Some(CancelReason::StatementTimeout),
        3 => Some(CancelReason::LockTimeout),
        _ => None,
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                reason: AtomicU8::new(NOT_CANCELED),
                holdoff: AtomicU32::new(0),
                deadline: Mutex::new(None),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. Wakes all sleepers immediately.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.inner.reason.compare_exchange(
            NOT_CANCELED,
            encode_reason(reason),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.condvar.notify_all();
    }

    /// Clear a delivered cancel and any deadline; called when a new statement starts.
    pub fn reset(&self) {
        self.inner.reason.store(NOT_CANCELED, Ordering::SeqCst);
        *self.inner.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Arm a deadline; `check` fails with `reason` once it passes.
    pub fn set_deadline(&self, after: Duration, reason: CancelReason) {
        *self.inner.deadline.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((Instant::now() + after, reason));
    }

    pub fn clear_deadline(&self) {
        *self.inner.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Pending cancel reason, including an expired deadline.
    pub fn pending(&self) -> Option<CancelReason> {
        if let Some(reason) = decode_reason(self.inner.reason.load(Ordering::SeqCst)) {
            return Some(reason);
        }
        let deadline = *self.inner.deadline.lock().unwrap_or_else(|e| e.into_inner());
        match deadline {
            Some((at, reason)) if Instant::now() >= at => Some(reason),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.pending().is_some()
    }

    /// Fail with `Canceled` if a cancel is pending and interrupts are not held off.
    pub fn check(&self) -> MeridianResult<()> {
        if self.inner.holdoff.load(Ordering::SeqCst) > 0 {
            return Ok(());
        }
        match self.pending() {
            Some(reason) => Err(MeridianError::Canceled(reason)),
            None => Ok(()),
        }
    }

    /// Defer cancellation until the matching `resume_interrupts`.
    pub fn hold_interrupts(&self) {
        self.inner.holdoff.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume_interrupts(&self) {
        let _ = self
            .inner
            .holdoff
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn interrupts_held(&self) -> bool {
        self.inner.holdoff.load(Ordering::SeqCst) > 0
    }

    /// Sleep for at most `duration`, waking early on cancel. Returns `true`
    /// if a cancel is pending on return.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_canceled() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_canceled() {
            return true;
        }
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_canceled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("pending", &self.pending())
            .field("holdoff", &self.inner.holdoff.load(Ordering::SeqCst))
            .finish()
    }
}
