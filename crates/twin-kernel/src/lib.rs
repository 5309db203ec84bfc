use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};
use twin_events::{Clock, SystemClock};
use twin_policy::{AccessTree, AuthenticationService, SecuredAccess, StaticSecuredAccess};
use twin_protocol::{
    AccessLevel, AccessMethodResponse, AgentCallback, AgentId, Credentials, DescribeRequest,
    FilteringDefinition, GatewayResult, Invocation, MethodCall, PostFilter, PublicKey,
    RemoteEndpoint, ResourcePath, SessionToken, SnaFilter, SubscribeRequest, SubscriptionId,
};
use twin_registry::{LifecycleStatus, ProviderHandle, ProviderModel, RegistryConfig};
use twin_runtime::{
    GatewayRuntime, PostFilterRegistry, RandomTokens, RuntimeConfig, RuntimeServices, Session,
    TokenGenerator,
};

/// Serializable part of the gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Namespace of this instance; generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub default_location: String,
    pub default_required_level: AccessLevel,
    pub anonymous_tree: AccessTree,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            namespace: None,
            default_location: registry.default_location,
            default_required_level: registry.default_required_level,
            anonymous_tree: AccessTree::anonymous(),
        }
    }
}

/// `sNa` followed by eight hex characters.
pub fn generate_namespace() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sNa{}", &id[..8])
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenGenerator>,
    security: Option<(Arc<dyn SecuredAccess>, Arc<dyn AuthenticationService>)>,
    post_filters: Vec<Arc<dyn PostFilter>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::from_config(GatewayConfig::default())
    }

    pub fn from_config(config: GatewayConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            tokens: Arc::new(RandomTokens),
            security: None,
            post_filters: Vec::new(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    pub fn default_location(mut self, location: impl Into<String>) -> Self {
        self.config.default_location = location.into();
        self
    }

    pub fn default_required_level(mut self, level: AccessLevel) -> Self {
        self.config.default_required_level = level;
        self
    }

    /// Tree given to anonymous identities when no security subsystem is set.
    pub fn anonymous_tree(mut self, tree: AccessTree) -> Self {
        self.config.anonymous_tree = tree;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn token_generator(mut self, tokens: Arc<dyn TokenGenerator>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn security<S>(mut self, security: Arc<S>) -> Self
    where
        S: SecuredAccess + AuthenticationService + 'static,
    {
        let secured: Arc<dyn SecuredAccess> = security.clone();
        let authentication: Arc<dyn AuthenticationService> = security;
        self.security = Some((secured, authentication));
        self
    }

    pub fn post_filter(mut self, filter: Arc<dyn PostFilter>) -> Self {
        self.post_filters.push(filter);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let namespace = self.config.namespace.unwrap_or_else(generate_namespace);
        let (security, authentication) = self.security.unwrap_or_else(|| {
            let security = Arc::new(StaticSecuredAccess::new(self.config.anonymous_tree));
            (
                security.clone() as Arc<dyn SecuredAccess>,
                security as Arc<dyn AuthenticationService>,
            )
        });
        let post_filters = PostFilterRegistry::default();
        for filter in self.post_filters {
            post_filters.register(filter);
        }

        let runtime = GatewayRuntime::new(
            RuntimeConfig {
                namespace,
                registry: RegistryConfig {
                    default_location: self.config.default_location,
                    default_required_level: self.config.default_required_level,
                },
            },
            RuntimeServices {
                security,
                authentication,
                tokens: self.tokens,
                clock: self.clock,
                post_filters,
            },
        )?;
        info!(namespace = runtime.namespace(), "gateway built");
        Ok(Gateway { runtime })
    }
}

/// Entry point of the twin gateway.
#[derive(Clone)]
pub struct Gateway {
    runtime: GatewayRuntime,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn namespace(&self) -> &str {
        self.runtime.namespace()
    }

    pub fn runtime(&self) -> &GatewayRuntime {
        &self.runtime
    }

    pub fn session(&self, token: &SessionToken) -> Option<Arc<Session>> {
        self.runtime.session(token)
    }

    pub fn open_session(&self, credentials: &Credentials) -> GatewayResult<Arc<Session>> {
        self.runtime.open_session(credentials)
    }

    pub fn anonymous_session(&self) -> Arc<Session> {
        self.runtime.anonymous_session()
    }

    pub fn application_session(&self, private_key: &str) -> Arc<Session> {
        self.runtime.application_session(private_key)
    }

    pub async fn close_session(&self, token: &SessionToken) -> bool {
        self.runtime.close_session(token).await
    }

    pub fn update_access_tree(&self, key: &PublicKey, tree: AccessTree) -> bool {
        self.runtime.update_access_tree(key, tree)
    }

    // --- Access methods ---

    pub async fn execute(&self, session: &Session, invocation: Invocation) -> AccessMethodResponse {
        self.runtime.execute(session, invocation).await
    }

    #[instrument(skip(self, session), fields(token = %session.token()))]
    pub async fn get(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
        attribute: Option<&str>,
    ) -> AccessMethodResponse {
        let call = MethodCall::Get {
            attribute: attribute.map(str::to_owned),
        };
        self.invoke(session, provider, service, resource, call).await
    }

    #[instrument(skip(self, session, value), fields(token = %session.token()))]
    pub async fn set(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
        attribute: Option<&str>,
        value: Value,
    ) -> AccessMethodResponse {
        let call = MethodCall::Set {
            attribute: attribute.map(str::to_owned),
            value,
        };
        self.invoke(session, provider, service, resource, call).await
    }

    #[instrument(skip(self, session, arguments), fields(token = %session.token()))]
    pub async fn act(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
        arguments: Vec<Value>,
    ) -> AccessMethodResponse {
        let call = MethodCall::Act { arguments };
        self.invoke(session, provider, service, resource, call).await
    }

    #[instrument(skip(self, session, request), fields(token = %session.token()))]
    pub async fn subscribe(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
        request: SubscribeRequest,
    ) -> AccessMethodResponse {
        let call = MethodCall::Subscribe(request);
        self.invoke(session, provider, service, resource, call).await
    }

    #[instrument(skip(self, session), fields(token = %session.token()))]
    pub async fn unsubscribe(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
        subscription_id: &SubscriptionId,
    ) -> AccessMethodResponse {
        let call = MethodCall::Unsubscribe {
            subscription_id: subscription_id.clone(),
        };
        self.invoke(session, provider, service, resource, call).await
    }

    async fn invoke(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
        call: MethodCall,
    ) -> AccessMethodResponse {
        let invocation = Invocation::new(ResourcePath::new(provider, service, resource), call);
        self.runtime.execute(session, invocation).await
    }

    // --- Descriptions and listings ---

    #[instrument(skip(self, session, filtering), fields(token = %session.token()))]
    pub async fn providers(
        &self,
        session: &Session,
        filtering: Option<FilteringDefinition>,
    ) -> AccessMethodResponse {
        self.runtime
            .describe(session, DescribeRequest::Providers { filter: None }, filtering)
            .await
    }

    #[instrument(skip(self, session, filtering), fields(token = %session.token()))]
    pub async fn all(
        &self,
        session: &Session,
        filtering: Option<FilteringDefinition>,
    ) -> AccessMethodResponse {
        self.runtime
            .describe(session, DescribeRequest::All { filter: None }, filtering)
            .await
    }

    pub async fn describe_provider(
        &self,
        session: &Session,
        provider: &str,
    ) -> AccessMethodResponse {
        let request = DescribeRequest::Provider {
            provider: provider.to_owned(),
        };
        self.runtime.describe(session, request, None).await
    }

    pub async fn describe_service(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
    ) -> AccessMethodResponse {
        let request = DescribeRequest::Service {
            provider: provider.to_owned(),
            service: service.to_owned(),
        };
        self.runtime.describe(session, request, None).await
    }

    pub async fn describe_resource(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> AccessMethodResponse {
        let request = DescribeRequest::Resource {
            provider: provider.to_owned(),
            service: service.to_owned(),
            resource: resource.to_owned(),
        };
        self.runtime.describe(session, request, None).await
    }

    pub async fn list_services(
        &self,
        session: &Session,
        provider: &str,
        filtering: Option<FilteringDefinition>,
    ) -> AccessMethodResponse {
        let request = DescribeRequest::Services {
            provider: provider.to_owned(),
        };
        self.runtime.describe(session, request, filtering).await
    }

    pub async fn list_resources(
        &self,
        session: &Session,
        provider: &str,
        service: &str,
        filtering: Option<FilteringDefinition>,
    ) -> AccessMethodResponse {
        let request = DescribeRequest::Resources {
            provider: provider.to_owned(),
            service: service.to_owned(),
        };
        self.runtime.describe(session, request, filtering).await
    }

    // --- Southbound ---

    pub fn register_provider(&self, model: ProviderModel) -> GatewayResult<ProviderHandle> {
        self.runtime.register_provider(model)
    }

    pub fn unregister_provider(&self, handle: &ProviderHandle) -> GatewayResult<()> {
        self.runtime.unregister_provider(handle)
    }

    #[instrument(skip(self, value, timestamp))]
    pub fn push_update(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
        value: Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> GatewayResult<()> {
        self.runtime
            .push_update(&ResourcePath::new(provider, service, resource), value, timestamp)
    }

    pub fn set_provider_status(
        &self,
        provider: &str,
        status: LifecycleStatus,
    ) -> GatewayResult<()> {
        self.runtime.set_provider_status(provider, status)
    }

    // --- Agents ---

    pub async fn register_agent(
        &self,
        identity: &str,
        callback: Arc<dyn AgentCallback>,
        filter: SnaFilter,
    ) -> GatewayResult<AgentId> {
        self.runtime.register_agent(identity, callback, filter).await
    }

    pub async fn unregister_agent(&self, id: &AgentId) -> bool {
        self.runtime.unregister_agent(id).await
    }

    pub async fn register_session_agent(
        &self,
        token: &SessionToken,
        callback: Arc<dyn AgentCallback>,
        filter: SnaFilter,
    ) -> AccessMethodResponse {
        self.runtime
            .register_session_agent(token, callback, filter)
            .await
    }

    pub async fn unregister_session_agent(
        &self,
        token: &SessionToken,
        id: &AgentId,
    ) -> AccessMethodResponse {
        self.runtime.unregister_session_agent(token, id).await
    }

    // --- Federation ---

    pub async fn create_remote_core(&self, endpoint: Arc<dyn RemoteEndpoint>) -> Option<u32> {
        self.runtime.create_remote_core(endpoint).await
    }

    pub async fn disconnect_remote_core(&self, local_id: u32) -> bool {
        self.runtime.disconnect_remote_core(local_id).await
    }

    pub fn remote_namespaces(&self) -> Vec<String> {
        self.runtime.remote_namespaces()
    }

    // --- Engine ---

    pub fn count(&self, uri: &str) -> usize {
        self.runtime.count(uri)
    }

    pub async fn flush(&self) {
        self.runtime.flush().await;
    }

    pub async fn close(&self) {
        self.runtime.close().await;
    }
}
