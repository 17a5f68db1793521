//! Step-based reconciliation of `CompositeResource`s.
//!
//! Each pass walks the steps in order and records one condition per step on
//! the resource status. Completed steps are skipped on later passes, so a pass
//! interrupted anywhere resumes where it stopped.

pub mod controller;
pub mod registry;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CompositeResource, CompositeSpec, Condition, Phase, ResourceStatus};
use log::{debug, info, warn};

pub const VALIDATE_STEP: &str = "validate";
pub const REGISTER_STEP: &str = "register-structure";

pub fn notify_step(notifier: &str) -> String {
    format!("notify-{notifier}")
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The integration is switched off; nothing more can be done.
    #[error("integration disabled: {0}")]
    Disabled(String),
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reconciliation interrupted")]
pub struct Interrupted;

/// Registers composite structure in the KV store.
#[async_trait]
pub trait ResourceUpdater: Send + Sync {
    async fn register_or_update(&self, spec: &CompositeSpec) -> Result<(), UpdateError>;

    async fn members_of(&self, composite_id: &str) -> Result<BTreeSet<String>, UpdateError>;
}

/// A consumer told about the member namespaces of a composite.
#[async_trait]
pub trait DownstreamNotifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(
        &self,
        composite_id: &str,
        members: &BTreeSet<String>,
    ) -> Result<(), UpdateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    pub phase: Phase,
    pub status_changed: bool,
}

pub struct ReconciliationStepMachine {
    updater: Arc<dyn ResourceUpdater>,
    notifiers: Vec<Arc<dyn DownstreamNotifier>>,
}

impl ReconciliationStepMachine {
    pub fn new(
        updater: Arc<dyn ResourceUpdater>,
        notifiers: Vec<Arc<dyn DownstreamNotifier>>,
    ) -> Self {
        Self { updater, notifiers }
    }

    /// Runs one pass over `resource`, updating its status in place.
    ///
    /// Every failure except interruption is recorded on the status; only
    /// interruption is returned as an error.
    pub async fn reconcile(
        &self,
        resource: &mut CompositeResource,
    ) -> Result<PassOutcome, Interrupted> {
        let before = resource.status.clone();
        let name = resource.metadata.name.as_str();
        let spec = &resource.spec;
        let status = &mut resource.status;

        let spec_changed = status
            .observed_spec
            .as_ref()
            .is_some_and(|observed| observed != spec);
        if spec_changed {
            info!("composite {name}: spec changed, restarting from the first step");
            status.conditions.clear();
            status.phase = Phase::Pending;
        }
        if spec_changed || status.observed_spec.is_none() {
            status.observed_spec = Some(spec.clone());
        }

        let phase = self.run_steps(name, spec, status).await?;
        status.phase = phase;
        debug!("composite {name}: pass finished in phase {phase:?}");

        Ok(PassOutcome {
            phase,
            status_changed: resource.status != before,
        })
    }

    async fn run_steps(
        &self,
        name: &str,
        spec: &CompositeSpec,
        status: &mut ResourceStatus,
    ) -> Result<Phase, Interrupted> {
        if !status.is_step_completed(VALIDATE_STEP) {
            if let Err(e) = spec.validate() {
                warn!("composite {name}: invalid spec: {e}");
                status.record(
                    VALIDATE_STEP,
                    Condition::failed("InvalidConfiguration", e.to_string()),
                );
                return Ok(Phase::InvalidConfiguration);
            }
            status.record(VALIDATE_STEP, Condition::completed("Validated"));
        }

        if !status.is_step_completed(REGISTER_STEP) {
            match self.updater.register_or_update(spec).await {
                Ok(()) => {
                    info!("composite {name}: structure registered");
                    status.record(REGISTER_STEP, Condition::completed("StructureRegistered"));
                }
                Err(UpdateError::Interrupted) => return Err(Interrupted),
                Err(UpdateError::Disabled(msg)) => {
                    info!("composite {name}: registration skipped, {msg}");
                    status.record(REGISTER_STEP, Condition::failed("IntegrationDisabled", msg));
                    return Ok(Phase::Updated);
                }
                Err(e) => {
                    warn!("composite {name}: registering structure failed: {e:#}");
                    status.record(
                        REGISTER_STEP,
                        Condition::failed("RegistrationFailed", format!("{e:#}")),
                    );
                    return Ok(Phase::BackingOff);
                }
            }
        }

        self.notify_all(name, spec, status).await
    }

    async fn notify_all(
        &self,
        name: &str,
        spec: &CompositeSpec,
        status: &mut ResourceStatus,
    ) -> Result<Phase, Interrupted> {
        let pending: Vec<(String, &Arc<dyn DownstreamNotifier>)> = self
            .notifiers
            .iter()
            .map(|n| (notify_step(n.name()), n))
            .filter(|(step, _)| !status.is_step_completed(step))
            .collect();
        if pending.is_empty() {
            return Ok(Phase::Updated);
        }

        let composite_id = spec.composite_id();
        let members = match self.updater.members_of(composite_id).await {
            Ok(members) => members,
            Err(UpdateError::Interrupted) => return Err(Interrupted),
            Err(e) => {
                warn!("composite {name}: listing members of {composite_id} failed: {e:#}");
                let message = format!("{e:#}");
                for (step, _) in &pending {
                    status.record(step, Condition::failed("MembersUnavailable", message.clone()));
                }
                return Ok(Phase::BackingOff);
            }
        };

        let mut failed = false;
        for (step, notifier) in pending {
            match notifier.notify(composite_id, &members).await {
                Ok(()) => {
                    debug!("composite {name}: notified {}", notifier.name());
                    status.record(&step, Condition::completed("Notified"));
                }
                Err(UpdateError::Interrupted) => return Err(Interrupted),
                Err(UpdateError::Disabled(msg)) => {
                    info!("composite {name}: {} skipped, {msg}", notifier.name());
                    status.record(&step, Condition::failed("IntegrationDisabled", msg));
                }
                Err(e) => {
                    warn!("composite {name}: notifying {} failed: {e:#}", notifier.name());
                    status.record(
                        &step,
                        Condition::failed("NotificationFailed", format!("{e:#}")),
                    );
                    failed = true;
                }
            }
        }

        Ok(if failed { Phase::BackingOff } else { Phase::Updated })
    }
}
