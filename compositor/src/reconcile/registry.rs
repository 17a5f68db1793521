use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::CompositeSpec;
use libtopology::keys::{
    BLUE_GREEN_ROLE, COMPOSITE_ROLE, CONTROLLER_NAMESPACE, composite_prefix, structure_key,
    structure_ref_key,
};
use log::debug;

use super::{DownstreamNotifier, ResourceUpdater, UpdateError};
use crate::api::xlinestore::XlineStore;

/// Structure facts and `structureRef` pointers describing `spec`.
///
/// A baseline spec places its namespaces in the baseline role. A satellite
/// spec places its own namespaces in the satellite role and re-asserts the
/// baseline it is attached to.
pub fn structure_facts(spec: &CompositeSpec) -> Vec<(String, String)> {
    let id = spec.composite_id();
    let mut facts = Vec::new();
    match &spec.baseline {
        None => push_group(
            &mut facts,
            id,
            "baseline",
            &spec.origin_namespace,
            spec.controller_namespace.as_deref(),
            spec.peer_namespace.as_deref(),
        ),
        Some(baseline) => {
            push_group(
                &mut facts,
                id,
                "baseline",
                &baseline.origin_namespace,
                baseline.controller_namespace.as_deref(),
                baseline.peer_namespace.as_deref(),
            );
            push_group(
                &mut facts,
                id,
                "satellite",
                &spec.origin_namespace,
                spec.controller_namespace.as_deref(),
                spec.peer_namespace.as_deref(),
            );
        }
    }
    facts
}

fn push_group(
    facts: &mut Vec<(String, String)>,
    id: &str,
    role: &str,
    origin: &str,
    controller: Option<&str>,
    peer: Option<&str>,
) {
    let mut fact = |ns: &str, attribute: &str, value: &str| {
        facts.push((structure_key(id, ns, attribute), value.to_string()));
    };
    // blank names count as unset, as in validation
    let controller = controller.filter(|s| !s.trim().is_empty());
    let peer = peer.filter(|s| !s.trim().is_empty());
    let members: Vec<&str> = match (controller, peer) {
        (Some(controller), Some(peer)) => {
            for (ns, bg) in [(controller, "controller"), (origin, "origin"), (peer, "peer")] {
                fact(ns, COMPOSITE_ROLE, role);
                fact(ns, BLUE_GREEN_ROLE, bg);
                if ns != controller {
                    fact(ns, CONTROLLER_NAMESPACE, controller);
                }
            }
            vec![controller, origin, peer]
        }
        _ => {
            fact(origin, COMPOSITE_ROLE, role);
            vec![origin]
        }
    };
    for ns in members {
        facts.push((structure_ref_key(ns), composite_prefix(id)));
    }
}

/// Registers composite structure facts in xline.
pub struct XlineStructureRegistry {
    store: Arc<XlineStore>,
    enabled: bool,
}

impl XlineStructureRegistry {
    pub fn new(store: Arc<XlineStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }
}

#[async_trait]
impl ResourceUpdater for XlineStructureRegistry {
    async fn register_or_update(&self, spec: &CompositeSpec) -> Result<(), UpdateError> {
        if !self.enabled {
            return Err(UpdateError::Disabled(
                "structure registration is turned off".to_string(),
            ));
        }
        let facts = structure_facts(spec);
        debug!(
            "writing {} structure facts for composite {}",
            facts.len(),
            spec.composite_id()
        );
        self.store.put_facts(&facts).await?;
        Ok(())
    }

    async fn members_of(&self, composite_id: &str) -> Result<BTreeSet<String>, UpdateError> {
        Ok(self.store.structure_namespaces(composite_id).await?)
    }
}

/// Publishes the member namespaces of each composite under
/// `/registry/composite-members/<id>`.
pub struct MembershipNotifier {
    store: Arc<XlineStore>,
}

impl MembershipNotifier {
    pub fn new(store: Arc<XlineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DownstreamNotifier for MembershipNotifier {
    fn name(&self) -> &str {
        "membership"
    }

    async fn notify(
        &self,
        composite_id: &str,
        members: &BTreeSet<String>,
    ) -> Result<(), UpdateError> {
        self.store.put_members(composite_id, members).await?;
        Ok(())
    }
}
