//! Service provider models registered by southbound bindings.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use twin_protocol::{AccessLevel, AccessMethod, ActionHandler, SubscriptionId};

/// Levels a model element requires per method. Unset methods inherit from
/// the enclosing element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessRequirements {
    levels: BTreeMap<AccessMethod, AccessLevel>,
}

impl AccessRequirements {
    /// `level` for every method.
    pub fn all(level: AccessLevel) -> Self {
        let mut requirements = Self::default();
        requirements.set_all(level);
        requirements
    }

    pub fn get(&self, method: AccessMethod) -> Option<AccessLevel> {
        self.levels.get(&method).copied()
    }

    pub fn set(&mut self, method: AccessMethod, level: AccessLevel) {
        self.levels.insert(method, level);
    }

    pub fn set_all(&mut self, level: AccessLevel) {
        for method in AccessMethod::ALL {
            self.levels.insert(method, level);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleStatus {
    Active,
    Inactive,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Data,
    Action,
}

/// Current state of a DATA resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DataResource {
    pub value: Value,
    pub timestamp: Option<DateTime<Utc>>,
    pub attributes: IndexMap<String, Value>,
    pub subscriptions: IndexSet<SubscriptionId>,
}

impl DataResource {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
            attributes: IndexMap::new(),
            subscriptions: IndexSet::new(),
        }
    }
}

#[derive(Clone)]
pub struct ActionResource {
    pub handler: Arc<dyn ActionHandler>,
}

impl fmt::Debug for ActionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionResource").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Resource {
    Data(DataResource),
    Action(ActionResource),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Data(_) => ResourceType::Data,
            Self::Action(_) => ResourceType::Action,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceModel {
    pub name: String,
    pub requirements: AccessRequirements,
    pub resource: Resource,
}

impl ResourceModel {
    pub fn data(name: impl Into<String>, initial: Value) -> Self {
        Self {
            name: name.into(),
            requirements: AccessRequirements::default(),
            resource: Resource::Data(DataResource::new(initial)),
        }
    }

    pub fn action(name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            requirements: AccessRequirements::default(),
            resource: Resource::Action(ActionResource { handler }),
        }
    }

    /// Extra named attribute of a DATA resource. Ignored for actions.
    pub fn attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        if let Resource::Data(data) = &mut self.resource {
            data.attributes.insert(name.into(), value);
        }
        self
    }

    pub fn require(mut self, method: AccessMethod, level: AccessLevel) -> Self {
        self.requirements.set(method, level);
        self
    }

    pub fn require_all(mut self, level: AccessLevel) -> Self {
        self.requirements.set_all(level);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServiceModel {
    pub name: String,
    pub requirements: AccessRequirements,
    pub resources: Vec<ResourceModel>,
}

impl ServiceModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements: AccessRequirements::default(),
            resources: Vec::new(),
        }
    }

    pub fn resource(mut self, resource: ResourceModel) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn require(mut self, method: AccessMethod, level: AccessLevel) -> Self {
        self.requirements.set(method, level);
        self
    }

    pub fn require_all(mut self, level: AccessLevel) -> Self {
        self.requirements.set_all(level);
        self
    }
}

/// Provider description. New providers carry an anonymous profile: every
/// method requires `Anonymous` unless a service or resource says otherwise.
#[derive(Debug, Clone)]
pub struct ProviderModel {
    pub name: String,
    pub location: Option<String>,
    pub requirements: AccessRequirements,
    pub services: Vec<ServiceModel>,
}

impl ProviderModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
            requirements: AccessRequirements::all(AccessLevel::Anonymous),
            services: Vec::new(),
        }
    }

    /// Drop the anonymous profile; methods no element sets fall back to the
    /// gateway's default required level.
    pub fn without_default_profile(mut self) -> Self {
        self.requirements = AccessRequirements::default();
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn service(mut self, service: ServiceModel) -> Self {
        self.services.push(service);
        self
    }

    pub fn require(mut self, method: AccessMethod, level: AccessLevel) -> Self {
        self.requirements.set(method, level);
        self
    }

    pub fn require_all(mut self, level: AccessLevel) -> Self {
        self.requirements.set_all(level);
        self
    }
}

/// Handle returned by provider registration; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderHandle {
    name: String,
}

impl ProviderHandle {
    pub(crate) fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
