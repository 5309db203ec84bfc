//! Access-filtered, immutable projections of registered providers.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Value, json};
use twin_policy::AccessTree;
use twin_protocol::{AccessLevel, AccessMethod, uri};

use crate::model::{LifecycleStatus, Resource, ResourceType};
use crate::registry::{ProviderEntry, ResourceEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceView {
    pub provider: String,
    pub service: String,
    pub name: String,
    pub resource_type: ResourceType,
    pub value: Option<Value>,
    pub timestamp: Option<DateTime<Utc>>,
    pub attributes: IndexMap<String, Value>,
    /// Methods both supported by the resource and granted to the viewer.
    pub methods: Vec<AccessMethod>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceView {
    pub name: String,
    pub resources: Vec<ResourceView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderView {
    pub name: String,
    pub location: String,
    pub status: LifecycleStatus,
    pub services: Vec<ServiceView>,
}

fn supported_methods(resource_type: ResourceType) -> &'static [AccessMethod] {
    match resource_type {
        ResourceType::Data => &[
            AccessMethod::Get,
            AccessMethod::Set,
            AccessMethod::Subscribe,
            AccessMethod::Unsubscribe,
            AccessMethod::Describe,
        ],
        ResourceType::Action => &[AccessMethod::Act, AccessMethod::Describe],
    }
}

/// Project `entry` as seen through `tree`. Elements whose DESCRIBE level is
/// not granted are left out; `None` when the provider itself is hidden.
pub(crate) fn project(
    entry: &ProviderEntry,
    tree: &AccessTree,
    default_level: AccessLevel,
) -> Option<ProviderView> {
    let provider_uri = uri::uri([entry.name.as_str()]);
    let describe = |path: &str, service: Option<&str>, resource: Option<&str>| {
        tree.is_accessible(
            path,
            AccessMethod::Describe,
            entry.required(service, resource, AccessMethod::Describe, default_level),
        )
    };
    if !describe(&provider_uri, None, None) {
        return None;
    }

    let services = entry
        .services
        .iter()
        .filter(|(service, _)| {
            describe(
                &uri::uri([entry.name.as_str(), service.as_str()]),
                Some(service.as_str()),
                None,
            )
        })
        .map(|(service, service_entry)| ServiceView {
            name: service.clone(),
            resources: service_entry
                .resources
                .iter()
                .filter_map(|(resource, resource_entry)| {
                    let path = uri::uri([entry.name.as_str(), service.as_str(), resource.as_str()]);
                    if !describe(&path, Some(service.as_str()), Some(resource.as_str())) {
                        return None;
                    }
                    Some(project_resource(
                        entry,
                        service,
                        resource,
                        resource_entry,
                        |method| {
                            tree.is_accessible(
                                &path,
                                method,
                                entry.required(
                                    Some(service.as_str()),
                                    Some(resource.as_str()),
                                    method,
                                    default_level,
                                ),
                            )
                        },
                    ))
                })
                .collect(),
        })
        .collect();

    Some(ProviderView {
        name: entry.name.clone(),
        location: entry.location.clone(),
        status: entry.status,
        services,
    })
}

fn project_resource(
    entry: &ProviderEntry,
    service: &str,
    name: &str,
    resource: &ResourceEntry,
    granted: impl Fn(AccessMethod) -> bool,
) -> ResourceView {
    let resource_type = resource.resource.resource_type();
    let methods = supported_methods(resource_type)
        .iter()
        .copied()
        .filter(|method| granted(*method))
        .collect();
    let (value, timestamp, attributes) = match &resource.resource {
        Resource::Data(data) => (
            Some(data.value.clone()),
            data.timestamp,
            data.attributes.clone(),
        ),
        Resource::Action(_) => (None, None, IndexMap::new()),
    };
    ResourceView {
        provider: entry.name.clone(),
        service: service.to_owned(),
        name: name.to_owned(),
        resource_type,
        value,
        timestamp,
        attributes,
        methods,
    }
}

impl ProviderView {
    pub fn service(&self, name: &str) -> Option<&ServiceView> {
        self.services.iter().find(|service| service.name == name)
    }

    pub fn resource(&self, service: &str, resource: &str) -> Option<&ResourceView> {
        self.service(service)?.resource(resource)
    }

    /// Same view with the provider name prefixed by `namespace`.
    pub fn qualified(mut self, namespace: &str) -> Self {
        self.name = uri::qualify(namespace, &self.name);
        for resource in self
            .services
            .iter_mut()
            .flat_map(|service| service.resources.iter_mut())
        {
            resource.provider = self.name.clone();
        }
        self
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|service| service.name.clone()).collect()
    }

    /// Entry of the complete listing.
    pub fn complete_json(&self) -> Value {
        json!({
            "name": self.name,
            "location": self.location,
            "services": self.services.iter().map(ServiceView::complete_json).collect::<Vec<_>>(),
        })
    }

    pub fn describe_json(&self) -> Value {
        json!({
            "name": self.name,
            "location": self.location,
            "status": self.status.as_str(),
            "services": self.service_names(),
        })
    }
}

impl ServiceView {
    pub fn resource(&self, name: &str) -> Option<&ResourceView> {
        self.resources.iter().find(|resource| resource.name == name)
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.resources.iter().map(|resource| resource.name.clone()).collect()
    }

    fn complete_json(&self) -> Value {
        json!({
            "name": self.name,
            "resources": self
                .resources
                .iter()
                .map(|resource| json!({"name": resource.name, "type": resource.resource_type}))
                .collect::<Vec<_>>(),
        })
    }

    pub fn describe_json(&self) -> Value {
        self.complete_json()
    }
}

impl ResourceView {
    pub fn uri(&self) -> String {
        uri::uri([self.provider.as_str(), self.service.as_str(), self.name.as_str()])
    }

    pub fn allows(&self, method: AccessMethod) -> bool {
        self.methods.contains(&method)
    }

    pub fn describe_json(&self) -> Value {
        let mut description = json!({
            "name": self.name,
            "type": self.resource_type,
            "accessMethods": self.methods,
        });
        if let Some(value) = &self.value {
            description["value"] = value.clone();
            description["timestamp"] = json!(self.timestamp);
            description["attributes"] = json!(self.attributes);
        }
        description
    }
}
