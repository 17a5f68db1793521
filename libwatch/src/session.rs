use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::kv::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Polling,
    Scheduled,
    Cancelled,
}

/// Handle to one watched path.
///
/// The poll loop owning the session is the only writer of its index; the
/// handle can be cloned freely to observe or cancel it.
#[derive(Debug, Clone)]
pub struct LongPollSession {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    path: String,
    last_seen_index: AtomicU64,
    responded: AtomicBool,
    state: Mutex<SessionState>,
    token: CancellationToken,
}

impl LongPollSession {
    pub(crate) fn new(path: String) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                path,
                last_seen_index: AtomicU64::new(0),
                responded: AtomicBool::new(false),
                state: Mutex::new(SessionState::Idle),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn last_seen_index(&self) -> u64 {
        self.inner.last_seen_index.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops the session. Safe to call any number of times.
    pub fn cancel(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = SessionState::Cancelled;
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn same_session(&self, other: &LongPollSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Moves to `next` unless the session was cancelled; returns whether the
    /// loop may continue.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == SessionState::Cancelled {
            return false;
        }
        *state = next;
        true
    }

    /// Records a successful response and decides whether it is delivered.
    ///
    /// The index only ever moves forward. With `fire_on_first` the first
    /// response is delivered whatever its index.
    pub(crate) fn accept(&self, snapshot: &Snapshot, fire_on_first: bool) -> bool {
        let first = !self.inner.responded.swap(true, Ordering::AcqRel);
        let previous = self
            .inner
            .last_seen_index
            .fetch_max(snapshot.index(), Ordering::AcqRel);
        let advanced = snapshot.index() > previous;
        (fire_on_first && first) || advanced
    }
}
