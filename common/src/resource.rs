use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::composite::CompositeSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    InvalidConfiguration,
    BackingOff,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn completed(reason: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::Completed,
            reason: reason.into(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::Failed,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ConditionStatus::Completed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub phase: Phase,
    /// Keyed by step name.
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
    /// Spec the recorded conditions were produced for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_spec: Option<CompositeSpec>,
}

impl ResourceStatus {
    pub fn is_step_completed(&self, step: &str) -> bool {
        self.conditions.get(step).is_some_and(Condition::is_completed)
    }

    pub fn record(&mut self, step: &str, condition: Condition) {
        // keep the original transition time when nothing changed
        if let Some(prev) = self.conditions.get(step)
            && prev.status == condition.status
            && prev.reason == condition.reason
            && prev.message == condition.message
        {
            return;
        }
        self.conditions.insert(step.to_string(), condition);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Persistent resource a composite is declared with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeResource {
    pub metadata: ObjectMeta,
    pub spec: CompositeSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}
