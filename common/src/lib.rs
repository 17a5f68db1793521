pub mod composite;
pub mod resource;
pub mod structure;

pub use composite::{BaselineSpec, CompositeSpec, CompositeSpecError};
pub use resource::{
    CompositeResource, Condition, ConditionStatus, ObjectMeta, Phase, ResourceStatus,
};
pub use structure::{CompositeStructure, NamespaceRoles, TopologyPayload};
