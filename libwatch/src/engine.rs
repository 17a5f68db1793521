use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::time::sleep;

use crate::backoff::BackoffPolicy;
use crate::kv::{KvClient, Snapshot};
use crate::session::{LongPollSession, SessionState};

const MIN_ERROR_DELAY: Duration = Duration::from_millis(1);

/// Receives delivered snapshots. Errors are logged and never stop the loop.
pub type SnapshotCallback = Arc<dyn Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Deliver the first successful response even if its index did not move.
    pub fire_on_first_success: bool,
    /// Retry delay policy after a failed poll. Falls back to the engine's
    /// fixed error delay when unset.
    pub backoff: Option<BackoffPolicy>,
}

/// Drives one poll loop per watched path against a [`KvClient`].
#[derive(Clone)]
pub struct LongPollEngine {
    client: Arc<dyn KvClient>,
    wait: Duration,
    error_delay: Duration,
}

impl LongPollEngine {
    pub fn new(client: Arc<dyn KvClient>, wait: Duration, error_delay: Duration) -> Self {
        Self {
            client,
            wait,
            error_delay: error_delay.max(MIN_ERROR_DELAY),
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Starts watching `path` and returns the session handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(
        &self,
        path: impl Into<String>,
        options: WatchOptions,
        callback: SnapshotCallback,
    ) -> LongPollSession {
        let session = LongPollSession::new(path.into());
        let poll_loop = PollLoop {
            client: self.client.clone(),
            wait: self.wait,
            error_delay: self.error_delay,
            options,
            callback,
            session: session.clone(),
        };
        tokio::spawn(poll_loop.run());
        session
    }
}

struct PollLoop {
    client: Arc<dyn KvClient>,
    wait: Duration,
    error_delay: Duration,
    options: WatchOptions,
    callback: SnapshotCallback,
    session: LongPollSession,
}

impl PollLoop {
    async fn run(self) {
        let path = self.session.path().to_string();
        let mut retry_delay = Duration::ZERO;

        loop {
            if !self.session.transition(SessionState::Polling) {
                break;
            }
            let since = self.session.last_seen_index();
            let result = tokio::select! {
                biased;
                _ = self.session.cancelled() => break,
                res = self.client.await_changes(&path, since, self.wait) => res,
            };
            // a response that raced with cancel() is dropped here
            if self.session.is_cancelled() {
                debug!("watch {path}: discarding response received after cancel");
                break;
            }

            let delay = match result {
                Ok(snapshot) => {
                    retry_delay = Duration::ZERO;
                    if self
                        .session
                        .accept(&snapshot, self.options.fire_on_first_success)
                    {
                        debug!("watch {path}: delivering index {}", snapshot.index());
                        if let Err(e) = (self.callback)(&snapshot) {
                            error!("watch {path}: snapshot handler failed: {e:?}");
                        }
                    }
                    Duration::ZERO
                }
                Err(e) => {
                    let delay = match self.options.backoff {
                        Some(policy) => {
                            retry_delay = policy.next(retry_delay);
                            retry_delay
                        }
                        None => self.error_delay,
                    };
                    warn!("watch {path}: poll from index {since} failed, retrying in {delay:?}: {e}");
                    delay
                }
            };

            if delay.is_zero() {
                continue;
            }
            if !self.session.transition(SessionState::Scheduled) {
                break;
            }
            tokio::select! {
                biased;
                _ = self.session.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!("watch {path}: stopped");
    }
}
