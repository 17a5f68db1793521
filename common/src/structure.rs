use serde::{Deserialize, Serialize};

/// Blue-green roles resolved for one namespace group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRoles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

impl NamespaceRoles {
    pub fn is_empty(&self) -> bool {
        self.controller.is_none() && self.origin.is_none() && self.peer.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeStructure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<NamespaceRoles>,
    /// Ordered by satellite key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub satellites: Vec<NamespaceRoles>,
}

/// Document pushed to the destination store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyPayload {
    #[serde(rename = "cloudProvider", skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
    #[serde(rename = "cloudOIDCProxyUrl", skip_serializing_if = "Option::is_none")]
    pub cloud_oidc_proxy_url: Option<String>,
    pub composite: CompositeStructure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_roles_are_omitted() {
        let s = CompositeStructure {
            baseline: Some(NamespaceRoles {
                origin: Some("bs".into()),
                ..Default::default()
            }),
            satellites: vec![],
        };
        assert_eq!(
            serde_json::to_string(&s).unwrap(),
            r#"{"baseline":{"origin":"bs"}}"#
        );
    }

    #[test]
    fn test_payload_field_names() {
        let p = TopologyPayload {
            cloud_provider: Some("aws".into()),
            cloud_oidc_proxy_url: None,
            composite: CompositeStructure {
                baseline: None,
                satellites: vec![NamespaceRoles {
                    controller: Some("st".into()),
                    ..Default::default()
                }],
            },
        };
        assert_eq!(
            serde_json::to_string(&p).unwrap(),
            r#"{"cloudProvider":"aws","composite":{"satellites":[{"controller":"st"}]}}"#
        );
    }
}
