use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};
use twin_policy::AccessTree;
use twin_protocol::{
    AccessLevel, AccessMethod, GatewayError, GatewayResult, LifecycleEvent, MessageKind,
    MessageSink, MethodAccessibility, ResourcePath, SnaMessage, SubscriptionId, uri,
};

use crate::ldap::LdapFilter;
use crate::model::{
    AccessRequirements, LifecycleStatus, ProviderHandle, ProviderModel, Resource,
};
use crate::view::{self, ProviderView, ResourceView};

const ACTIVE_FILTER: &str = "(lifecycle.status=ACTIVE)";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Location reported for providers registered without one.
    pub default_location: String,
    /// Level required for a method when no enclosing element declares one.
    pub default_required_level: AccessLevel,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_location: "45.2:5.7".to_owned(),
            default_required_level: AccessLevel::Owner,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ResourceEntry {
    pub(crate) requirements: AccessRequirements,
    pub(crate) resource: Resource,
}

#[derive(Debug)]
pub(crate) struct ServiceEntry {
    pub(crate) requirements: AccessRequirements,
    pub(crate) resources: IndexMap<String, ResourceEntry>,
}

#[derive(Debug)]
pub(crate) struct ProviderEntry {
    pub(crate) name: String,
    pub(crate) location: String,
    pub(crate) status: LifecycleStatus,
    pub(crate) requirements: AccessRequirements,
    pub(crate) services: IndexMap<String, ServiceEntry>,
}

impl ProviderEntry {
    /// Level `method` requires on the named element: the resource's own
    /// requirement, else its service's, else the provider's, else `default`.
    pub(crate) fn required(
        &self,
        service: Option<&str>,
        resource: Option<&str>,
        method: AccessMethod,
        default: AccessLevel,
    ) -> AccessLevel {
        let service_entry = service.and_then(|name| self.services.get(name));
        let resource_entry = service_entry
            .zip(resource)
            .and_then(|(entry, name)| entry.resources.get(name));
        resource_entry
            .and_then(|entry| entry.requirements.get(method))
            .or_else(|| service_entry.and_then(|entry| entry.requirements.get(method)))
            .or_else(|| self.requirements.get(method))
            .unwrap_or(default)
    }

    fn attribute_values(&self, attribute: &str) -> Vec<String> {
        match attribute {
            "name" => vec![self.name.clone()],
            "location" => vec![self.location.clone()],
            "lifecycle.status" => vec![self.status.as_str().to_owned()],
            "services" => self.services.keys().cloned().collect(),
            other => other
                .split_once('.')
                .and_then(|(service, resource)| self.services.get(service)?.resources.get(resource))
                .and_then(|entry| match &entry.resource {
                    Resource::Data(data) => Some(vec![match &data.value {
                        Value::String(text) => text.clone(),
                        value => value.to_string(),
                    }]),
                    Resource::Action(_) => None,
                })
                .unwrap_or_default(),
        }
    }
}

/// Value and timestamp read from a DATA resource or one of its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub name: String,
    pub value: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Reading {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "value": self.value,
            "timestamp": self.timestamp,
        })
    }
}

/// Authoritative collection of service providers.
///
/// Registration, unregistration and writes push their LIFECYCLE or UPDATE
/// messages while the write lock is held, so queue order is write order.
pub struct ResourceRegistry {
    providers: RwLock<IndexMap<String, ProviderEntry>>,
    sink: Arc<dyn MessageSink>,
    config: RegistryConfig,
}

impl ResourceRegistry {
    pub fn new(config: RegistryConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            providers: RwLock::new(IndexMap::new()),
            sink,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[instrument(skip(self, model), fields(provider = %model.name))]
    pub fn register_provider(&self, model: ProviderModel) -> GatewayResult<ProviderHandle> {
        if model.name.is_empty()
            || model.name.contains(uri::SEPARATOR)
            || model.name.contains(uri::NAMESPACE_SEPARATOR)
        {
            return Err(GatewayError::InvalidProviderId(model.name));
        }

        let provider_uri = uri::uri([model.name.as_str()]);
        let mut messages = vec![SnaMessage::lifecycle(
            LifecycleEvent::ProviderAppearing,
            provider_uri.clone(),
        )];
        let mut services = IndexMap::new();
        for service in model.services {
            messages.push(SnaMessage::lifecycle(
                LifecycleEvent::ServiceAppearing,
                uri::uri([model.name.as_str(), service.name.as_str()]),
            ));
            let mut resources = IndexMap::new();
            for resource in service.resources {
                messages.push(SnaMessage::lifecycle(
                    LifecycleEvent::ResourceAppearing,
                    uri::uri([
                        model.name.as_str(),
                        service.name.as_str(),
                        resource.name.as_str(),
                    ]),
                ));
                resources.insert(
                    resource.name,
                    ResourceEntry {
                        requirements: resource.requirements,
                        resource: resource.resource,
                    },
                );
            }
            services.insert(
                service.name,
                ServiceEntry {
                    requirements: service.requirements,
                    resources,
                },
            );
        }

        let mut providers = self.providers.write();
        if providers.contains_key(&model.name) {
            return Err(GatewayError::ProviderExists(model.name));
        }
        providers.insert(
            model.name.clone(),
            ProviderEntry {
                name: model.name.clone(),
                location: model
                    .location
                    .unwrap_or_else(|| self.config.default_location.clone()),
                status: LifecycleStatus::Active,
                requirements: model.requirements,
                services,
            },
        );
        info!(lifecycle_messages = messages.len(), "service provider registered");
        for message in messages {
            self.sink.push(message);
        }
        Ok(ProviderHandle::new(model.name))
    }

    pub fn unregister(&self, handle: &ProviderHandle) -> GatewayResult<Vec<SubscriptionId>> {
        self.unregister_provider(handle.name())
    }

    /// Remove a provider, returning the subscriptions its resources held.
    ///
    /// The DISAPPEARING messages record the level their elements required,
    /// since the entry is gone by the time they are dispatched.
    #[instrument(skip(self))]
    pub fn unregister_provider(&self, provider: &str) -> GatewayResult<Vec<SubscriptionId>> {
        let mut providers = self.providers.write();
        let entry = providers
            .shift_remove(provider)
            .ok_or_else(|| GatewayError::NotFound(uri::uri([provider])))?;

        let default = self.config.default_required_level;
        let method = MessageKind::Lifecycle(LifecycleEvent::ProviderDisappearing).agent_method();
        let mut subscriptions = Vec::new();
        let mut messages = Vec::new();
        for (service, service_entry) in &entry.services {
            let service = service.as_str();
            for (resource, resource_entry) in &service_entry.resources {
                let resource = resource.as_str();
                if let Resource::Data(data) = &resource_entry.resource {
                    subscriptions.extend(data.subscriptions.iter().cloned());
                }
                let required = entry.required(Some(service), Some(resource), method, default);
                messages.push(
                    SnaMessage::lifecycle(
                        LifecycleEvent::ResourceDisappearing,
                        uri::uri([provider, service, resource]),
                    )
                    .with_required_level(required),
                );
            }
            let required = entry.required(Some(service), None, method, default);
            messages.push(
                SnaMessage::lifecycle(
                    LifecycleEvent::ServiceDisappearing,
                    uri::uri([provider, service]),
                )
                .with_required_level(required),
            );
        }
        messages.push(
            SnaMessage::lifecycle(LifecycleEvent::ProviderDisappearing, uri::uri([provider]))
                .with_required_level(entry.required(None, None, method, default)),
        );

        info!(subscriptions = subscriptions.len(), "service provider unregistered");
        for message in messages {
            self.sink.push(message);
        }
        drop(providers);
        Ok(subscriptions)
    }

    pub fn set_status(&self, provider: &str, status: LifecycleStatus) -> GatewayResult<()> {
        let mut providers = self.providers.write();
        let entry = providers
            .get_mut(provider)
            .ok_or_else(|| GatewayError::NotFound(uri::uri([provider])))?;
        entry.status = status;
        debug!(provider, status = status.as_str(), "provider status changed");
        Ok(())
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    /// Level `method` requires on `path` (any depth of the hierarchy).
    pub fn required_level(&self, path: &str, method: AccessMethod) -> AccessLevel {
        let default = self.config.default_required_level;
        let segments = uri::segments(path);
        let Some(provider) = segments.first() else {
            return default;
        };
        match self.providers.read().get(*provider) {
            Some(entry) => entry.required(
                segments.get(1).copied(),
                segments.get(2).copied(),
                method,
                default,
            ),
            None => default,
        }
    }

    /// Accessibility of every method on `path` for the identity owning `tree`.
    pub fn accessibility(&self, tree: &AccessTree, path: &str) -> Vec<MethodAccessibility> {
        tree.accessibility(path, |method| self.required_level(path, method))
    }

    /// Active provider visible through `tree`.
    pub fn provider(&self, tree: &AccessTree, provider: &str) -> Option<ProviderView> {
        let providers = self.providers.read();
        let entry = providers.get(provider)?;
        if entry.status != LifecycleStatus::Active {
            return None;
        }
        view::project(entry, tree, self.config.default_required_level)
    }

    /// Resource visible through `tree`; hidden elements resolve to `None`.
    pub fn resolve(&self, tree: &AccessTree, path: &ResourcePath) -> Option<ResourceView> {
        self.provider(tree, &path.provider)?
            .resource(&path.service, &path.resource)
            .cloned()
    }

    /// Active providers visible through `tree` and matching `filter`.
    pub fn providers(
        &self,
        tree: &AccessTree,
        filter: Option<&str>,
    ) -> GatewayResult<Vec<ProviderView>> {
        let active = LdapFilter::parse(ACTIVE_FILTER)?;
        let filter = match filter.map(str::trim).filter(|f| !f.is_empty()) {
            Some(filter) => LdapFilter::parse(filter)?.and(active),
            None => active,
        };
        let providers = self.providers.read();
        Ok(providers
            .values()
            .filter(|entry| filter.matches(&|attribute| entry.attribute_values(attribute)))
            .filter_map(|entry| view::project(entry, tree, self.config.default_required_level))
            .collect())
    }

    pub fn get(&self, path: &ResourcePath, attribute: Option<&str>) -> GatewayResult<Reading> {
        let providers = self.providers.read();
        let resource = Self::entry(&providers, path)?;
        let Resource::Data(data) = &resource.resource else {
            return Err(GatewayError::NotData(path.uri()));
        };
        match attribute {
            None => Ok(Reading {
                name: path.resource.clone(),
                value: data.value.clone(),
                timestamp: data.timestamp,
            }),
            Some(name) => data
                .attributes
                .get(name)
                .map(|value| Reading {
                    name: name.to_owned(),
                    value: value.clone(),
                    timestamp: data.timestamp,
                })
                .ok_or_else(|| GatewayError::NotFound(format!("{}/{name}", path.uri()))),
        }
    }

    /// Client-side SET. Emits one UPDATE message on success.
    #[instrument(skip_all, fields(path = %path))]
    pub fn set(
        &self,
        path: &ResourcePath,
        attribute: Option<&str>,
        value: Value,
    ) -> GatewayResult<Reading> {
        self.write_value(path, attribute, value, Utc::now())
    }

    /// Southbound data push. Emits one UPDATE message on success.
    #[instrument(skip_all, fields(path = %path))]
    pub fn push_update(
        &self,
        path: &ResourcePath,
        value: Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> GatewayResult<()> {
        self.write_value(path, None, value, timestamp.unwrap_or_else(Utc::now))
            .map(|_| ())
    }

    fn write_value(
        &self,
        path: &ResourcePath,
        attribute: Option<&str>,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> GatewayResult<Reading> {
        let mut providers = self.providers.write();
        let resource = Self::entry_mut(&mut providers, path)?;
        let Resource::Data(data) = &mut resource.resource else {
            return Err(GatewayError::NotData(path.uri()));
        };
        let reading = match attribute {
            None => {
                data.value = value.clone();
                Reading {
                    name: path.resource.clone(),
                    value,
                    timestamp: Some(timestamp),
                }
            }
            Some(name) => {
                let slot = data
                    .attributes
                    .get_mut(name)
                    .ok_or_else(|| GatewayError::NotFound(format!("{}/{name}", path.uri())))?;
                *slot = value.clone();
                Reading {
                    name: name.to_owned(),
                    value,
                    timestamp: Some(timestamp),
                }
            }
        };
        data.timestamp = Some(timestamp);

        let payload = match attribute {
            None => json!({ "value": reading.value }),
            Some(name) => json!({ "attribute": name, "value": reading.value }),
        };
        self.sink
            .push(SnaMessage::new(MessageKind::Update, path.uri(), payload));
        drop(providers);
        debug!("resource value updated");
        Ok(reading)
    }

    /// Invoke an ACTION resource. Emits one ACT RESPONSE message on success.
    ///
    /// The handler runs without the registry lock; responses are queued in
    /// completion order.
    #[instrument(skip_all, fields(path = %path))]
    pub fn act(&self, path: &ResourcePath, arguments: &[Value]) -> GatewayResult<Value> {
        let handler = {
            let providers = self.providers.read();
            let resource = Self::entry(&providers, path)?;
            match &resource.resource {
                Resource::Action(action) => action.handler.clone(),
                Resource::Data(_) => return Err(GatewayError::NotAction(path.uri())),
            }
        };
        let result = handler
            .act(arguments)
            .map_err(|error| GatewayError::ActionFailed(format!("{error:#}")))?;
        self.sink.push(SnaMessage::response(
            AccessMethod::Act,
            path.uri(),
            result.clone(),
        ));
        Ok(result)
    }

    pub fn add_subscription(&self, path: &ResourcePath, id: SubscriptionId) -> GatewayResult<()> {
        let mut providers = self.providers.write();
        match &mut Self::entry_mut(&mut providers, path)?.resource {
            Resource::Data(data) => {
                data.subscriptions.insert(id);
                Ok(())
            }
            Resource::Action(_) => Err(GatewayError::NotData(path.uri())),
        }
    }

    pub fn remove_subscription(&self, path: &ResourcePath, id: &SubscriptionId) -> bool {
        let mut providers = self.providers.write();
        match Self::entry_mut(&mut providers, path).map(|entry| &mut entry.resource) {
            Ok(Resource::Data(data)) => data.subscriptions.shift_remove(id),
            _ => false,
        }
    }

    /// Drop `ids` from whichever DATA resources still list them.
    pub fn forget_subscriptions(&self, ids: &[SubscriptionId]) -> usize {
        let mut providers = self.providers.write();
        let mut forgotten = 0;
        for provider in providers.values_mut() {
            for service in provider.services.values_mut() {
                for entry in service.resources.values_mut() {
                    if let Resource::Data(data) = &mut entry.resource {
                        let before = data.subscriptions.len();
                        data.subscriptions.retain(|id| !ids.contains(id));
                        forgotten += before - data.subscriptions.len();
                    }
                }
            }
        }
        debug!(forgotten, "subscriptions forgotten");
        forgotten
    }

    pub fn subscriptions(&self, path: &ResourcePath) -> Vec<SubscriptionId> {
        let providers = self.providers.read();
        match Self::entry(&providers, path).map(|entry| &entry.resource) {
            Ok(Resource::Data(data)) => data.subscriptions.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn entry<'a>(
        providers: &'a IndexMap<String, ProviderEntry>,
        path: &ResourcePath,
    ) -> GatewayResult<&'a ResourceEntry> {
        providers
            .get(&path.provider)
            .and_then(|provider| provider.services.get(&path.service))
            .and_then(|service| service.resources.get(&path.resource))
            .ok_or_else(|| GatewayError::NotFound(path.uri()))
    }

    fn entry_mut<'a>(
        providers: &'a mut IndexMap<String, ProviderEntry>,
        path: &ResourcePath,
    ) -> GatewayResult<&'a mut ResourceEntry> {
        providers
            .get_mut(&path.provider)
            .and_then(|provider| provider.services.get_mut(&path.service))
            .and_then(|service| service.resources.get_mut(&path.resource))
            .ok_or_else(|| GatewayError::NotFound(path.uri()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use parking_lot::Mutex;
    use twin_protocol::{ActionHandler, MessageType};

    use super::*;
    use crate::model::{ResourceModel, ServiceModel};

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<SnaMessage>>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<MessageKind> {
            self.messages.lock().iter().map(|m| m.kind.clone()).collect()
        }
    }

    impl MessageSink for RecordingSink {
        fn push(&self, message: SnaMessage) {
            self.messages.lock().push(message);
        }
    }

    struct Doubler;

    impl ActionHandler for Doubler {
        fn act(&self, arguments: &[Value]) -> Result<Value> {
            let input = arguments
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("missing argument"))?;
            Ok(json!(input * 2))
        }
    }

    fn foo() -> ProviderModel {
        ProviderModel::new("Foo")
            .service(
                ServiceModel::new("data").resource(
                    ResourceModel::data("value", json!(10)).attribute("unit", json!("C")),
                ),
            )
            .service(
                ServiceModel::new("control")
                    .resource(ResourceModel::action("double", Arc::new(Doubler))),
            )
    }

    fn registry() -> (ResourceRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            ResourceRegistry::new(RegistryConfig::default(), sink.clone()),
            sink,
        )
    }

    fn value_path() -> ResourcePath {
        ResourcePath::new("Foo", "data", "value")
    }

    #[test]
    fn registration_emits_lifecycle_messages_and_rejects_duplicates() -> Result<()> {
        let (registry, sink) = registry();
        let handle = registry.register_provider(foo())?;
        assert_eq!(handle.name(), "Foo");
        assert_eq!(
            sink.kinds(),
            vec![
                MessageKind::Lifecycle(LifecycleEvent::ProviderAppearing),
                MessageKind::Lifecycle(LifecycleEvent::ServiceAppearing),
                MessageKind::Lifecycle(LifecycleEvent::ResourceAppearing),
                MessageKind::Lifecycle(LifecycleEvent::ServiceAppearing),
                MessageKind::Lifecycle(LifecycleEvent::ResourceAppearing),
            ]
        );
        assert!(matches!(
            registry.register_provider(foo()),
            Err(GatewayError::ProviderExists(_))
        ));
        assert!(matches!(
            registry.register_provider(ProviderModel::new("peer:Foo")),
            Err(GatewayError::InvalidProviderId(_))
        ));
        Ok(())
    }

    #[test]
    fn set_and_push_update_emit_one_update_each() -> Result<()> {
        let (registry, sink) = registry();
        registry.register_provider(foo())?;
        sink.messages.lock().clear();

        let reading = registry.set(&value_path(), None, json!(42))?;
        assert_eq!(reading.value, json!(42));
        registry.push_update(&value_path(), json!(43), None)?;
        registry.set(&value_path(), Some("unit"), json!("F"))?;

        let messages = sink.messages.lock().clone();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.message_type() == MessageType::Update));
        assert_eq!(messages[0].value(), Some(&json!(42)));
        assert_eq!(messages[2].payload["attribute"], "unit");

        assert_eq!(registry.get(&value_path(), None)?.value, json!(43));
        assert_eq!(registry.get(&value_path(), Some("unit"))?.value, json!("F"));
        assert!(registry.get(&value_path(), Some("missing")).is_err());
        Ok(())
    }

    #[test]
    fn actions_run_their_handler_and_emit_a_response() -> Result<()> {
        let (registry, sink) = registry();
        registry.register_provider(foo())?;
        sink.messages.lock().clear();

        let path = ResourcePath::new("Foo", "control", "double");
        assert_eq!(registry.act(&path, &[json!(21)])?, json!(42));
        assert_eq!(sink.kinds(), vec![MessageKind::Response(AccessMethod::Act)]);
        assert!(matches!(registry.act(&path, &[]), Err(GatewayError::ActionFailed(_))));
        assert!(matches!(registry.get(&path, None), Err(GatewayError::NotData(_))));
        assert!(matches!(
            registry.act(&value_path(), &[]),
            Err(GatewayError::NotAction(_))
        ));
        Ok(())
    }

    #[test]
    fn hidden_elements_do_not_resolve() -> Result<()> {
        let (registry, _) = registry();
        registry.register_provider(
            foo().service(
                ServiceModel::new("secret")
                    .require(AccessMethod::Describe, AccessLevel::Admin)
                    .resource(ResourceModel::data("pin", json!(1234))),
            ),
        )?;
        let anonymous = AccessTree::anonymous();
        let admin = AccessTree::new(AccessLevel::Admin);
        let secret = ResourcePath::new("Foo", "secret", "pin");

        assert!(registry.resolve(&anonymous, &value_path()).is_some());
        assert!(registry.resolve(&anonymous, &secret).is_none());
        assert!(registry.resolve(&admin, &secret).is_some());

        let view = registry.provider(&anonymous, "Foo").expect("visible provider");
        assert_eq!(view.service_names(), vec!["data", "control"]);
        Ok(())
    }

    #[test]
    fn enumeration_applies_filters_and_lifecycle() -> Result<()> {
        let (registry, _) = registry();
        registry.register_provider(foo())?;
        registry.register_provider(ProviderModel::new("Bar").location("1:1"))?;
        let tree = AccessTree::anonymous();

        let names = |filter: Option<&str>| -> Result<Vec<String>> {
            Ok(registry
                .providers(&tree, filter)?
                .into_iter()
                .map(|view| view.name)
                .collect())
        };
        assert_eq!(names(None)?, vec!["Foo", "Bar"]);
        assert_eq!(names(Some("(services=data)"))?, vec!["Foo"]);
        assert_eq!(names(Some("(data.value>=10)"))?, vec!["Foo"]);
        assert_eq!(names(Some("(location=1:1)"))?, vec!["Bar"]);

        registry.set_status("Bar", LifecycleStatus::Inactive)?;
        assert_eq!(names(None)?, vec!["Foo"]);
        assert!(registry.provider(&tree, "Bar").is_none());
        assert!(registry.providers(&tree, Some("(name=")).is_err());
        Ok(())
    }

    #[test]
    fn required_levels_inherit_down_the_hierarchy() -> Result<()> {
        let (registry, _) = registry();
        registry.register_provider(
            ProviderModel::new("Foo")
                .require(AccessMethod::Set, AccessLevel::Admin)
                .service(
                    ServiceModel::new("data")
                        .require(AccessMethod::Get, AccessLevel::Authenticated)
                        .resource(
                            ResourceModel::data("value", json!(1))
                                .require(AccessMethod::Get, AccessLevel::Owner),
                        )
                        .resource(ResourceModel::data("other", json!(2))),
                ),
        )?;

        assert_eq!(
            registry.required_level("/Foo/data/value", AccessMethod::Get),
            AccessLevel::Owner
        );
        assert_eq!(
            registry.required_level("/Foo/data/other", AccessMethod::Get),
            AccessLevel::Authenticated
        );
        assert_eq!(
            registry.required_level("/Foo/data/other", AccessMethod::Set),
            AccessLevel::Admin
        );
        assert_eq!(registry.required_level("/Foo", AccessMethod::Act), AccessLevel::Anonymous);
        assert_eq!(registry.required_level("/Nope", AccessMethod::Get), AccessLevel::Owner);

        let authenticated = AccessTree::new(AccessLevel::Authenticated);
        let accessibility = registry.accessibility(&authenticated, "/Foo/data/other");
        assert!(MethodAccessibility::lookup(&accessibility, AccessMethod::Get));
        assert!(!MethodAccessibility::lookup(&accessibility, AccessMethod::Set));
        Ok(())
    }

    #[test]
    fn unset_levels_fall_back_to_owner_without_the_default_profile() -> Result<()> {
        let (registry, _) = registry();
        registry.register_provider(
            ProviderModel::new("Bare")
                .without_default_profile()
                .service(ServiceModel::new("data").resource(ResourceModel::data("v", json!(1)))),
        )?;
        let path = ResourcePath::new("Bare", "data", "v");

        assert_eq!(
            registry.required_level(&path.uri(), AccessMethod::Describe),
            AccessLevel::Owner
        );
        assert!(registry.resolve(&AccessTree::anonymous(), &path).is_none());
        assert!(registry.provider(&AccessTree::new(AccessLevel::Admin), "Bare").is_none());
        assert!(registry.resolve(&AccessTree::new(AccessLevel::Owner), &path).is_some());
        Ok(())
    }

    #[test]
    fn disappearing_messages_record_the_level_of_the_removed_element() -> Result<()> {
        let (registry, sink) = registry();
        registry.register_provider(
            ProviderModel::new("Vault")
                .service(
                    ServiceModel::new("data")
                        .require(AccessMethod::Describe, AccessLevel::Admin)
                        .resource(ResourceModel::data("pin", json!(1))),
                )
                .service(ServiceModel::new("info").resource(ResourceModel::data("v", json!(2)))),
        )?;
        assert!(sink.messages.lock().iter().all(|m| m.required_level.is_none()));
        sink.messages.lock().clear();

        registry.unregister_provider("Vault")?;
        let levels: Vec<(String, Option<AccessLevel>)> = sink
            .messages
            .lock()
            .iter()
            .map(|m| (m.path.clone(), m.required_level))
            .collect();
        assert_eq!(
            levels,
            vec![
                ("/Vault/data/pin".to_owned(), Some(AccessLevel::Admin)),
                ("/Vault/data".to_owned(), Some(AccessLevel::Admin)),
                ("/Vault/info/v".to_owned(), Some(AccessLevel::Anonymous)),
                ("/Vault/info".to_owned(), Some(AccessLevel::Anonymous)),
                ("/Vault".to_owned(), Some(AccessLevel::Anonymous)),
            ]
        );
        Ok(())
    }

    #[test]
    fn concurrent_writes_queue_updates_in_write_order() -> Result<()> {
        let (registry, sink) = registry();
        let registry = Arc::new(registry);
        registry.register_provider(foo())?;
        sink.messages.lock().clear();

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let registry = registry.clone();
                std::thread::spawn(move || -> GatewayResult<()> {
                    for step in 0..200 {
                        registry.set(&value_path(), None, json!(writer * 1000 + step))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer finishes")?;
        }

        let messages = sink.messages.lock().clone();
        assert_eq!(messages.len(), 1600);
        let stored = registry.get(&value_path(), None)?.value;
        assert_eq!(messages.last().and_then(|m| m.value()), Some(&stored));
        Ok(())
    }

    #[test]
    fn evicted_subscriptions_are_forgotten() -> Result<()> {
        let (registry, _) = registry();
        registry.register_provider(foo())?;
        let (kept, evicted) = (SubscriptionId::generate(), SubscriptionId::generate());
        registry.add_subscription(&value_path(), kept.clone())?;
        registry.add_subscription(&value_path(), evicted.clone())?;

        assert_eq!(registry.forget_subscriptions(std::slice::from_ref(&evicted)), 1);
        assert_eq!(registry.subscriptions(&value_path()), vec![kept]);
        assert_eq!(registry.forget_subscriptions(&[evicted]), 0);
        Ok(())
    }

    #[test]
    fn unregistration_returns_subscriptions_and_emits_disappearing() -> Result<()> {
        let (registry, sink) = registry();
        let handle = registry.register_provider(foo())?;
        let id = SubscriptionId::generate();
        registry.add_subscription(&value_path(), id.clone())?;
        assert_eq!(registry.subscriptions(&value_path()), vec![id.clone()]);
        sink.messages.lock().clear();

        assert_eq!(registry.unregister(&handle)?, vec![id]);
        assert_eq!(
            sink.kinds().last(),
            Some(&MessageKind::Lifecycle(LifecycleEvent::ProviderDisappearing))
        );
        assert!(registry.provider_names().is_empty());
        assert!(matches!(registry.unregister(&handle), Err(GatewayError::NotFound(_))));
        Ok(())
    }
}
