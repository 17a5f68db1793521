//! KV key layout shared by the structure registry and the watchers.
//!
//! k:composite/<id>/structure/<namespace>/<attribute>  v:attribute value
//! k:config/<namespace>/application/composite/structureRef  v:composite/<id>/

use once_cell::sync::Lazy;
use regex::Regex;

pub const COMPOSITE_ROLE: &str = "compositeRole";
pub const BLUE_GREEN_ROLE: &str = "bluegreenRole";
pub const CONTROLLER_NAMESPACE: &str = "controllerNamespace";

static STRUCTURE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^composite/([^/]+)/structure/([^/]+)/([^/]+)$").expect("valid structure key regex")
});

/// Parts of a structure key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureKey<'a> {
    pub composite_id: &'a str,
    pub namespace: &'a str,
    pub attribute: &'a str,
}

pub fn parse_structure_key(key: &str) -> Option<StructureKey<'_>> {
    let caps = STRUCTURE_KEY.captures(key)?;
    Some(StructureKey {
        composite_id: caps.get(1)?.as_str(),
        namespace: caps.get(2)?.as_str(),
        attribute: caps.get(3)?.as_str(),
    })
}

pub fn composite_prefix(composite_id: &str) -> String {
    format!("composite/{composite_id}/")
}

pub fn structure_prefix(composite_id: &str) -> String {
    format!("composite/{composite_id}/structure/")
}

pub fn structure_key(composite_id: &str, namespace: &str, attribute: &str) -> String {
    format!("composite/{composite_id}/structure/{namespace}/{attribute}")
}

pub fn structure_ref_key(namespace: &str) -> String {
    format!("config/{namespace}/application/composite/structureRef")
}
