//! Resource registry of the twin gateway: the providers registered by
//! southbound bindings, their services and resources, and access-filtered
//! views over them.

pub mod ldap;
pub mod model;
pub mod registry;
pub mod view;

pub use ldap::LdapFilter;
pub use model::{
    AccessRequirements, ActionResource, DataResource, LifecycleStatus, ProviderHandle,
    ProviderModel, Resource, ResourceModel, ResourceType, ServiceModel,
};
pub use registry::{Reading, RegistryConfig, ResourceRegistry};
pub use view::{ProviderView, ResourceView, ServiceView};
