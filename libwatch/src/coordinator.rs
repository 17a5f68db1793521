//! Two-level watch: a reference watch on a pointer key and a data watch on the
//! prefix the pointer currently names.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info};

use crate::backoff::BackoffPolicy;
use crate::engine::{LongPollEngine, SnapshotCallback, WatchOptions};
use crate::kv::Snapshot;
use crate::session::LongPollSession;

/// Consumer of data-watch snapshots. Called under the coordinator lock, so it
/// should hand off (e.g. to a channel) rather than do the work inline.
pub type SnapshotSink = Arc<dyn Fn(Snapshot) -> anyhow::Result<()> + Send + Sync>;

pub struct TopologyWatchCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    engine: LongPollEngine,
    reference_key: String,
    data_backoff: BackoffPolicy,
    sink: SnapshotSink,
    state: Mutex<CoordinatorState>,
}

#[derive(Default)]
struct CoordinatorState {
    running: bool,
    /// Bumped on every start/stop so callbacks from older sessions are ignored.
    epoch: u64,
    data_epoch: u64,
    reference: Option<LongPollSession>,
    data: Option<LongPollSession>,
    active_prefix: Option<String>,
}

impl TopologyWatchCoordinator {
    pub fn new(
        engine: LongPollEngine,
        reference_key: impl Into<String>,
        data_backoff: BackoffPolicy,
        sink: SnapshotSink,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                reference_key: reference_key.into(),
                data_backoff,
                sink,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn reference_key(&self) -> &str {
        &self.inner.reference_key
    }

    /// Starts the reference watch. No-op while already running.
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.running {
            return;
        }
        state.running = true;
        state.epoch += 1;
        let epoch = state.epoch;

        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        let callback: SnapshotCallback = Arc::new(move |snapshot: &Snapshot| {
            if let Some(inner) = weak.upgrade() {
                inner.on_reference(epoch, snapshot);
            }
            Ok(())
        });
        let options = WatchOptions {
            fire_on_first_success: true,
            backoff: None,
        };
        info!("watching composite reference {}", self.inner.reference_key);
        state.reference = Some(
            self.inner
                .engine
                .watch(self.inner.reference_key.clone(), options, callback),
        );
    }

    /// Cancels both watches. Late events from them are ignored.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if !state.running {
            return;
        }
        state.running = false;
        state.epoch += 1;
        if let Some(reference) = state.reference.take() {
            reference.cancel();
        }
        if let Some(data) = state.data.take() {
            data.cancel();
        }
        state.active_prefix = None;
        info!("stopped watching composite reference {}", self.inner.reference_key);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn active_prefix(&self) -> Option<String> {
        self.inner.lock().active_prefix.clone()
    }
}

impl Drop for TopologyWatchCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CoordinatorInner {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_reference(self: &Arc<Self>, epoch: u64, snapshot: &Snapshot) {
        let mut state = self.lock();
        if !state.running || state.epoch != epoch {
            debug!("ignoring reference event from a stopped watch");
            return;
        }

        let prefix = snapshot
            .get(&self.reference_key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        if prefix == state.active_prefix {
            return;
        }

        if let Some(data) = state.data.take() {
            info!("composite prefix changed, closing data watch on {}", data.path());
            data.cancel();
        }
        state.active_prefix = prefix.clone();
        state.data_epoch += 1;

        let Some(prefix) = prefix else {
            info!(
                "{} is unset, composite structure sync paused",
                self.reference_key
            );
            return;
        };

        let data_epoch = state.data_epoch;
        let weak = Arc::downgrade(self);
        let callback: SnapshotCallback = Arc::new(move |snapshot: &Snapshot| match weak.upgrade() {
            Some(inner) => inner.on_data(data_epoch, snapshot),
            None => Ok(()),
        });
        let options = WatchOptions {
            fire_on_first_success: true,
            backoff: Some(self.data_backoff),
        };
        info!("watching composite structure under {prefix}");
        state.data = Some(self.engine.watch(prefix, options, callback));
    }

    fn on_data(&self, data_epoch: u64, snapshot: &Snapshot) -> anyhow::Result<()> {
        let state = self.lock();
        if !state.running || state.data_epoch != data_epoch {
            debug!("ignoring snapshot from a closed data watch");
            return Ok(());
        }
        (self.sink)(snapshot.clone())
    }
}
