//! Turns the flat `composite/<id>/structure/<namespace>/<attribute>` facts into
//! the nested baseline/satellite topology.

use std::collections::BTreeMap;

use common::{CompositeStructure, NamespaceRoles};

use crate::keys::{self, parse_structure_key};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {field} value {value:?} on namespace {namespace}")]
pub struct StructureParseError {
    pub field: &'static str,
    pub value: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompositeRole {
    Baseline,
    Satellite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlueGreenRole {
    Controller,
    Origin,
    Peer,
}

#[derive(Debug)]
struct NamespaceEntry<'a> {
    name: &'a str,
    composite_role: Option<CompositeRole>,
    blue_green_role: Option<BlueGreenRole>,
    controller_namespace: Option<&'a str>,
}

impl NamespaceEntry<'_> {
    /// Grouping key for satellites: own name for controllers, then the
    /// declared controller, then own name.
    fn satellite_key(&self) -> &str {
        if self.blue_green_role == Some(BlueGreenRole::Controller) {
            return self.name;
        }
        self.controller_namespace.unwrap_or(self.name)
    }
}

/// Builds the composite structure from `(key, value)` pairs.
///
/// Keys outside the structure layout are ignored. Output depends only on the
/// set of pairs, not on their order.
pub fn transform<'a, I>(entries: I) -> Result<CompositeStructure, StructureParseError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let namespaces = parse_namespaces(group_attributes(entries))?;

    let mut baseline = Vec::new();
    let mut satellites: BTreeMap<&str, Vec<&NamespaceEntry<'_>>> = BTreeMap::new();
    for entry in &namespaces {
        match entry.composite_role {
            Some(CompositeRole::Baseline) => baseline.push(entry),
            Some(CompositeRole::Satellite) => satellites
                .entry(entry.satellite_key())
                .or_default()
                .push(entry),
            None => {}
        }
    }

    Ok(CompositeStructure {
        baseline: resolve_roles(&baseline),
        satellites: satellites
            .values()
            .filter_map(|group| resolve_roles(group))
            .collect(),
    })
}

type AttributeMap<'a> = BTreeMap<&'a str, BTreeMap<String, &'a str>>;

fn group_attributes<'a, I>(entries: I) -> AttributeMap<'a>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut matching: Vec<(&str, &str, &str, &str)> = entries
        .into_iter()
        .filter_map(|(key, value)| {
            parse_structure_key(key).map(|k| (key, k.namespace, k.attribute, value))
        })
        .collect();
    // ascending keys: on attribute collision the largest key is written last
    matching.sort_by(|a, b| a.0.cmp(b.0));

    let mut grouped = AttributeMap::new();
    for (_, namespace, attribute, value) in matching {
        grouped
            .entry(namespace)
            .or_default()
            .insert(attribute.to_ascii_lowercase(), value);
    }
    grouped
}

fn parse_namespaces<'a>(
    grouped: AttributeMap<'a>,
) -> Result<Vec<NamespaceEntry<'a>>, StructureParseError> {
    let composite_role_attr = keys::COMPOSITE_ROLE.to_ascii_lowercase();
    let blue_green_role_attr = keys::BLUE_GREEN_ROLE.to_ascii_lowercase();
    let controller_attr = keys::CONTROLLER_NAMESPACE.to_ascii_lowercase();

    grouped
        .into_iter()
        .map(|(name, attrs)| {
            let composite_role = match non_blank(attrs.get(&composite_role_attr)) {
                Some(v) => Some(parse_composite_role(v).ok_or_else(|| StructureParseError {
                    field: keys::COMPOSITE_ROLE,
                    value: v.to_string(),
                    namespace: name.to_string(),
                })?),
                None => None,
            };
            let blue_green_role = match non_blank(attrs.get(&blue_green_role_attr)) {
                Some(v) => Some(parse_blue_green_role(v).ok_or_else(|| StructureParseError {
                    field: keys::BLUE_GREEN_ROLE,
                    value: v.to_string(),
                    namespace: name.to_string(),
                })?),
                None => None,
            };
            Ok(NamespaceEntry {
                name,
                composite_role,
                blue_green_role,
                controller_namespace: non_blank(attrs.get(&controller_attr)),
            })
        })
        .collect()
}

fn non_blank<'a>(value: Option<&&'a str>) -> Option<&'a str> {
    value.map(|v| (*v).trim()).filter(|v| !v.is_empty())
}

fn parse_composite_role(value: &str) -> Option<CompositeRole> {
    if value.eq_ignore_ascii_case("baseline") {
        Some(CompositeRole::Baseline)
    } else if value.eq_ignore_ascii_case("satellite") {
        Some(CompositeRole::Satellite)
    } else {
        None
    }
}

fn parse_blue_green_role(value: &str) -> Option<BlueGreenRole> {
    if value.eq_ignore_ascii_case("controller") {
        Some(BlueGreenRole::Controller)
    } else if value.eq_ignore_ascii_case("origin") {
        Some(BlueGreenRole::Origin)
    } else if value.eq_ignore_ascii_case("peer") {
        Some(BlueGreenRole::Peer)
    } else {
        None
    }
}

/// Group members arrive sorted by name, so the first match is the smallest.
fn resolve_roles(group: &[&NamespaceEntry<'_>]) -> Option<NamespaceRoles> {
    let with_role = |role: BlueGreenRole| {
        group
            .iter()
            .find(|e| e.blue_green_role == Some(role))
            .map(|e| e.name.to_string())
    };
    let roles = NamespaceRoles {
        controller: with_role(BlueGreenRole::Controller),
        origin: with_role(BlueGreenRole::Origin).or_else(|| {
            group
                .iter()
                .find(|e| e.blue_green_role.is_none())
                .map(|e| e.name.to_string())
        }),
        peer: with_role(BlueGreenRole::Peer),
    };
    (!roles.is_empty()).then_some(roles)
}
