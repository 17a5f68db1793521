use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::TopologyPayload;
use libwatch::BackoffPolicy;
use log::{debug, error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Destination of topology payloads. `apply` is an upsert.
#[async_trait]
pub trait ResourceWriteClient: Send + Sync {
    async fn apply(
        &self,
        target_id: &str,
        namespace: &str,
        payload: &TopologyPayload,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct WriterPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for WriterPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            backoff: BackoffPolicy {
                min: INITIAL_RETRY_DELAY,
                max: MAX_RETRY_DELAY,
            },
        }
    }
}

/// Pushes the latest requested payload to a [`ResourceWriteClient`].
///
/// A new request supersedes anything still queued, and applies never run
/// concurrently, so the destination never goes back to an older payload.
pub struct RetryingWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    client: Arc<dyn ResourceWriteClient>,
    namespace: String,
    policy: WriterPolicy,
    generation: AtomicU64,
    apply_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl RetryingWriter {
    pub fn new(
        client: Arc<dyn ResourceWriteClient>,
        namespace: impl Into<String>,
        policy: WriterPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                client,
                namespace: namespace.into(),
                policy,
                generation: AtomicU64::new(0),
                apply_lock: tokio::sync::Mutex::new(()),
                pending: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Queues `payload` for `target_id`, replacing any queued write.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_update(&self, target_id: &str, payload: &TopologyPayload) {
        if self.inner.shutdown.is_cancelled() {
            warn!("writer for {target_id} is shut down, dropping update");
            return;
        }
        let payload = Arc::new(payload.clone());
        let token = self.inner.shutdown.child_token();
        let generation = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = pending.replace(token.clone()) {
                previous.cancel();
            }
            self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        let inner = self.inner.clone();
        let target_id = target_id.to_string();
        tokio::spawn(async move {
            inner.run_attempts(generation, token, target_id, payload).await;
        });
    }

    /// Cancels queued attempts. An apply already running is left to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for RetryingWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WriterInner {
    fn is_current(&self, generation: u64, token: &CancellationToken) -> bool {
        !token.is_cancelled() && self.generation.load(Ordering::Acquire) == generation
    }

    async fn run_attempts(
        &self,
        generation: u64,
        token: CancellationToken,
        target_id: String,
        payload: Arc<TopologyPayload>,
    ) {
        let mut attempt = 1;
        let mut delay = Duration::ZERO;
        loop {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
            let _guard = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                guard = self.apply_lock.lock() => guard,
            };
            if !self.is_current(generation, &token) {
                debug!("update of {target_id} superseded before attempt {attempt}");
                return;
            }

            match self
                .client
                .apply(&target_id, &self.namespace, &payload)
                .await
            {
                Ok(()) => {
                    if attempt > 1 {
                        info!("applied topology {target_id} after {attempt} attempts");
                    } else {
                        debug!("applied topology {target_id}");
                    }
                    return;
                }
                Err(e) if attempt >= self.policy.max_attempts => {
                    error!("giving up on topology {target_id} after {attempt} attempts: {e:?}");
                    return;
                }
                Err(e) => {
                    delay = self.policy.backoff.next(delay);
                    warn!(
                        "applying topology {target_id} failed (attempt {attempt}/{}), retrying in {delay:?}: {e:?}",
                        self.policy.max_attempts
                    );
                    attempt += 1;
                }
            }
        }
    }
}
