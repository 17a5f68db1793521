use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{CompositeResource, Phase, ResourceStatus};
use libwatch::BackoffPolicy;
use log::{debug, info, warn};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Interrupted, ReconciliationStepMachine};

/// Where composite resources and their status live.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list(&self) -> Result<Vec<CompositeResource>>;

    async fn update_status(&self, name: &str, status: &ResourceStatus) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Requeue {
    delay: Duration,
    not_before: Instant,
}

// roughly 30 years, for delays past what `Instant` can represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn requeue_deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Periodically runs the step machine over every composite resource.
///
/// Resources are processed one at a time, so a resource never has two passes
/// in flight.
pub struct ReconcileController {
    store: Arc<dyn ResourceStore>,
    machine: ReconciliationStepMachine,
    interval: Duration,
    backoff: BackoffPolicy,
    requeues: HashMap<String, Requeue>,
}

impl ReconcileController {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        machine: ReconciliationStepMachine,
        interval: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            machine,
            interval,
            backoff,
            requeues: HashMap::new(),
        }
    }

    /// Delay before `name` is looked at again, if it is backing off.
    pub fn requeue_delay(&self, name: &str) -> Option<Duration> {
        self.requeues.get(name).map(|r| r.delay)
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!("reconcile controller started, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pass = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                pass = self.reconcile_all() => pass,
            };
            if pass.is_err() {
                info!("reconciliation interrupted, stopping controller");
                break;
            }
        }
        debug!("reconcile controller stopped");
        Ok(())
    }

    /// One sweep over all resources that are not waiting out a backoff.
    pub async fn reconcile_all(&mut self) -> Result<(), Interrupted> {
        let resources = match self.store.list().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!("failed to list composites: {e:#}");
                return Ok(());
            }
        };
        self.requeues
            .retain(|name, _| resources.iter().any(|r| &r.metadata.name == name));

        let now = Instant::now();
        for mut resource in resources {
            let name = resource.metadata.name.clone();
            if let Some(requeue) = self.requeues.get(&name)
                && requeue.not_before > now
            {
                debug!("composite {name}: backing off until {:?}", requeue.not_before);
                continue;
            }

            let outcome = self.machine.reconcile(&mut resource).await?;
            if outcome.status_changed
                && let Err(e) = self.store.update_status(&name, &resource.status).await
            {
                warn!("composite {name}: failed to persist status: {e:#}");
            }

            if outcome.phase == Phase::BackingOff {
                let previous = self.requeues.get(&name).map_or(Duration::ZERO, |r| r.delay);
                let delay = self.backoff.next(previous);
                debug!("composite {name}: requeued in {delay:?}");
                self.requeues.insert(
                    name,
                    Requeue {
                        delay,
                        not_before: requeue_deadline(delay),
                    },
                );
            } else {
                self.requeues.remove(&name);
            }
        }
        Ok(())
    }
}
