use serde::{Deserialize, Serialize};

/// Declared shape of a composite, as carried by a `CompositeResource`.
///
/// A spec without `baseline` describes a baseline itself; a spec with one
/// describes a satellite attached to that baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_namespace: Option<String>,
    #[serde(default)]
    pub origin_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_namespace: Option<String>,
    #[serde(default)]
    pub origin_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositeSpecError {
    #[error("{scope}: originNamespace is required")]
    MissingOrigin { scope: &'static str },
    #[error("{scope}: controllerNamespace and peerNamespace must be set together")]
    UnpairedBlueGreen { scope: &'static str },
}

impl CompositeSpec {
    pub fn validate(&self) -> Result<(), CompositeSpecError> {
        check_group(
            "spec",
            &self.origin_namespace,
            self.controller_namespace.as_deref(),
            self.peer_namespace.as_deref(),
        )?;
        if let Some(baseline) = &self.baseline {
            check_group(
                "spec.baseline",
                &baseline.origin_namespace,
                baseline.controller_namespace.as_deref(),
                baseline.peer_namespace.as_deref(),
            )?;
        }
        Ok(())
    }

    pub fn is_baseline(&self) -> bool {
        self.baseline.is_none()
    }

    /// Identity of the composite this spec belongs to.
    pub fn composite_id(&self) -> &str {
        match &self.baseline {
            Some(baseline) => &baseline.origin_namespace,
            None => &self.origin_namespace,
        }
    }
}

fn check_group(
    scope: &'static str,
    origin: &str,
    controller: Option<&str>,
    peer: Option<&str>,
) -> Result<(), CompositeSpecError> {
    if origin.trim().is_empty() {
        return Err(CompositeSpecError::MissingOrigin { scope });
    }
    let controller_set = controller.is_some_and(|s| !s.trim().is_empty());
    let peer_set = peer.is_some_and(|s| !s.trim().is_empty());
    if controller_set != peer_set {
        return Err(CompositeSpecError::UnpairedBlueGreen { scope });
    }
    Ok(())
}
