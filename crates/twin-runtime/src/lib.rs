//! Runtime of the twin gateway: sessions, access method dispatch, merged
//! enumeration and remote core federation over one resource registry and
//! one dispatch engine.

pub mod dispatch;
pub mod enumeration;
pub mod federation;
pub mod sessions;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use twin_events::{AccessibilityResolver, Clock, DispatchEngine, EvictionListener};
use twin_policy::{AccessTree, AuthenticationService, SecuredAccess};
use twin_protocol::{
    AccessLevel, AccessMethod, AccessMethodResponse, AgentCallback, AgentId, Credentials,
    GatewayError, GatewayResult, LocalEndpointPort, MethodAccessibility, PublicKey,
    RemoteEndpoint, ResourcePath, SessionToken, SnaFilter, SubscriptionId, status, uri,
};
use twin_registry::{
    LifecycleStatus, ProviderHandle, ProviderModel, RegistryConfig, ResourceRegistry,
};

pub use enumeration::PostFilterRegistry;
pub use federation::{Federation, LocalEndpoint, RemoteCore};
pub use sessions::{LOCAL_ID, RandomTokens, Session, SessionRegistry, TokenGenerator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Namespace peers use to address this gateway's providers.
    pub namespace: String,
    #[serde(flatten)]
    pub registry: RegistryConfig,
}

/// Collaborators the runtime is wired with.
pub struct RuntimeServices {
    pub security: Arc<dyn SecuredAccess>,
    pub authentication: Arc<dyn AuthenticationService>,
    pub tokens: Arc<dyn TokenGenerator>,
    pub clock: Arc<dyn Clock>,
    pub post_filters: PostFilterRegistry,
}

/// Accessibility of agent keys, from their access trees and the levels the
/// registry requires.
struct SecuredAccessibility {
    security: Arc<dyn SecuredAccess>,
    registry: Arc<ResourceRegistry>,
}

impl AccessibilityResolver for SecuredAccessibility {
    fn accessibility(&self, key: &PublicKey, path: &str) -> Vec<MethodAccessibility> {
        self.registry
            .accessibility(&self.security.access_tree(key), path)
    }

    fn is_granted(
        &self,
        key: &PublicKey,
        path: &str,
        method: AccessMethod,
        required: AccessLevel,
    ) -> bool {
        self.security
            .access_tree(key)
            .is_accessible(path, method, required)
    }
}

/// Keeps the registry's subscription lists in step with engine evictions.
struct RegistrySubscriptions(Arc<ResourceRegistry>);

impl EvictionListener for RegistrySubscriptions {
    fn evicted(&self, ids: &[SubscriptionId]) {
        self.0.forget_subscriptions(ids);
    }
}

/// Agent registered on this gateway, as opposed to proxies installed by peers.
struct LocalAgent {
    filter: SnaFilter,
    owner: Option<SessionToken>,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    security: Arc<dyn SecuredAccess>,
    authentication: Arc<dyn AuthenticationService>,
    sessions: SessionRegistry,
    registry: Arc<ResourceRegistry>,
    engine: DispatchEngine,
    federation: Federation,
    post_filters: PostFilterRegistry,
    agents: Mutex<IndexMap<AgentId, LocalAgent>>,
    /// Shared by anonymous identities and remote core ids.
    counter: AtomicU32,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct GatewayRuntime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl GatewayRuntime {
    pub fn new(config: RuntimeConfig, services: RuntimeServices) -> Result<Self> {
        let builder = DispatchEngine::builder();
        let registry = Arc::new(ResourceRegistry::new(
            config.registry.clone(),
            Arc::new(builder.queue()),
        ));
        let resolver = Arc::new(SecuredAccessibility {
            security: services.security.clone(),
            registry: registry.clone(),
        });
        let engine = builder
            .evictions(Arc::new(RegistrySubscriptions(registry.clone())))
            .start(resolver, services.clock)?;
        info!(namespace = %config.namespace, "gateway runtime started");
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                security: services.security,
                authentication: services.authentication,
                sessions: SessionRegistry::new(services.tokens),
                registry,
                engine,
                federation: Federation::default(),
                post_filters: services.post_filters,
                agents: Mutex::new(IndexMap::new()),
                counter: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    pub fn post_filters(&self) -> &PostFilterRegistry {
        &self.inner.post_filters
    }

    fn next_id(&self) -> u32 {
        self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    // --- Sessions ---

    pub fn session(&self, token: &SessionToken) -> Option<Arc<Session>> {
        self.inner.sessions.get(token)
    }

    /// Session of the identity proven by `credentials`, reused when one is
    /// already open.
    #[instrument(skip_all, fields(login = %credentials.login))]
    pub fn open_session(&self, credentials: &Credentials) -> GatewayResult<Arc<Session>> {
        let key = self
            .inner
            .authentication
            .build_key(credentials)
            .ok_or_else(|| GatewayError::InvalidCredentials(credentials.login.clone()))?;
        let session = self.bind_session(key);
        info!(public_key = %session.public_key(), "authenticated session ready");
        Ok(session)
    }

    /// Fresh anonymous identity with its own session.
    #[instrument(skip(self))]
    pub fn anonymous_session(&self) -> Arc<Session> {
        let key = PublicKey::anonymous(self.next_id());
        let tree = self.inner.security.anonymous_tree();
        let tree = if tree.is_mutable() {
            Arc::new(AccessTree::clone(&tree))
        } else {
            tree
        };
        let session = self.inner.sessions.open(key, LOCAL_ID, move || tree);
        info!(public_key = %session.public_key(), "anonymous session created");
        session
    }

    /// Session of the application owning `private_key`; anonymous when the
    /// key is unknown.
    #[instrument(skip_all)]
    pub fn application_session(&self, private_key: &str) -> Arc<Session> {
        match self.inner.security.application_key(private_key) {
            Some(key) => self.bind_session(key),
            None => {
                debug!("unknown application key, falling back to anonymous");
                self.anonymous_session()
            }
        }
    }

    fn bind_session(&self, key: PublicKey) -> Arc<Session> {
        let security = self.inner.security.clone();
        let tree_key = key.clone();
        self.inner
            .sessions
            .open(key, LOCAL_ID, move || security.access_tree(&tree_key))
    }

    pub(crate) fn peer_session(&self, key: PublicKey, local_id: u32) -> Arc<Session> {
        let security = self.inner.security.clone();
        let tree_key = key.clone();
        self.inner
            .sessions
            .open(key, local_id, move || security.access_tree(&tree_key))
    }

    /// Remove a session and the agents it registered.
    #[instrument(skip(self))]
    pub async fn close_session(&self, token: &SessionToken) -> bool {
        if self.inner.sessions.remove(token).is_none() {
            return false;
        }
        let owned: Vec<AgentId> = self
            .inner
            .agents
            .lock()
            .iter()
            .filter(|(_, agent)| agent.owner.as_ref() == Some(token))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &owned {
            self.unregister_agent(id).await;
        }
        info!(agents = owned.len(), "session closed");
        true
    }

    /// Replace the access tree of `key` and refresh everything derived from it.
    #[instrument(skip(self, tree), fields(public_key = %key))]
    pub fn update_access_tree(&self, key: &PublicKey, tree: AccessTree) -> bool {
        if !self.inner.security.update_access_tree(key, tree) {
            return false;
        }
        let tree = self.inner.security.access_tree(key);
        let refreshed = self.inner.sessions.refresh_tree(key, tree);
        self.inner.engine.invalidate_accessibility(key);
        info!(sessions = refreshed, "access tree replaced");
        true
    }

    // --- Southbound ---

    pub fn register_provider(&self, model: ProviderModel) -> GatewayResult<ProviderHandle> {
        self.inner.registry.register_provider(model)
    }

    /// Unregister a provider and drop the subscriptions on its resources.
    #[instrument(skip_all, fields(provider = %handle.name()))]
    pub fn unregister_provider(&self, handle: &ProviderHandle) -> GatewayResult<()> {
        let subscriptions = self.inner.registry.unregister(handle)?;
        for id in &subscriptions {
            self.inner.engine.delete_callback(id);
        }
        Ok(())
    }

    pub fn push_update(
        &self,
        path: &ResourcePath,
        value: Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> GatewayResult<()> {
        self.inner.registry.push_update(path, value, timestamp)
    }

    pub fn set_provider_status(
        &self,
        provider: &str,
        status: LifecycleStatus,
    ) -> GatewayResult<()> {
        self.inner.registry.set_status(provider, status)
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.inner.registry.provider_names()
    }

    // --- Agents ---

    /// Register an agent running under the key of plugin `identity`.
    #[instrument(skip(self, callback, filter))]
    pub async fn register_agent(
        &self,
        identity: &str,
        callback: Arc<dyn AgentCallback>,
        filter: SnaFilter,
    ) -> GatewayResult<AgentId> {
        let key = self.inner.security.agent_key(identity);
        self.install_agent(key, None, callback, filter).await
    }

    async fn install_agent(
        &self,
        key: PublicKey,
        owner: Option<SessionToken>,
        callback: Arc<dyn AgentCallback>,
        filter: SnaFilter,
    ) -> GatewayResult<AgentId> {
        if self.inner.engine.is_closed() {
            return Err(GatewayError::EngineClosed);
        }
        let id = AgentId::generate();
        self.inner
            .engine
            .register_agent(id.clone(), key, filter.clone(), callback);
        self.inner.agents.lock().insert(
            id.clone(),
            LocalAgent {
                filter: filter.clone(),
                owner,
            },
        );
        for core in self.inner.federation.connected() {
            if let Err(error) = core.endpoint().register_agent(&id, &filter).await {
                warn!(
                    local_id = core.local_id(),
                    agent_id = %id,
                    error = %error,
                    "agent not propagated"
                );
            }
        }
        info!(agent_id = %id, "agent registered");
        Ok(id)
    }

    /// Unregister an agent here and on every connected remote core.
    #[instrument(skip(self), fields(agent_id = %id))]
    pub async fn unregister_agent(&self, id: &AgentId) -> bool {
        let local = self.inner.agents.lock().shift_remove(id).is_some();
        let stopped = self.inner.engine.unregister_agent(id);
        if local {
            for core in self.inner.federation.connected() {
                if let Err(error) = core.endpoint().unregister_agent(id).await {
                    warn!(
                        local_id = core.local_id(),
                        error = %error,
                        "agent not unregistered remotely"
                    );
                }
            }
        }
        local || stopped
    }

    /// Agent running with the identity of the session `token`.
    #[instrument(skip(self, callback, filter))]
    pub async fn register_session_agent(
        &self,
        token: &SessionToken,
        callback: Arc<dyn AgentCallback>,
        filter: SnaFilter,
    ) -> AccessMethodResponse {
        let Some(session) = self.session(token) else {
            return AccessMethodResponse::internal_error(AccessMethod::Subscribe, uri::ROOT);
        };
        match self
            .install_agent(
                session.public_key().clone(),
                Some(token.clone()),
                callback,
                filter,
            )
            .await
        {
            Ok(id) => AccessMethodResponse::ok(
                AccessMethod::Subscribe,
                uri::ROOT,
                json!({ "subscriptionId": id }),
            ),
            Err(error) => {
                warn!(error = %error, "session agent not registered");
                AccessMethodResponse::internal_error(AccessMethod::Subscribe, uri::ROOT)
            }
        }
    }

    #[instrument(skip(self), fields(agent_id = %id))]
    pub async fn unregister_session_agent(
        &self,
        token: &SessionToken,
        id: &AgentId,
    ) -> AccessMethodResponse {
        let owned = self.session(token).is_some()
            && self
                .inner
                .agents
                .lock()
                .get(id)
                .is_some_and(|agent| agent.owner.as_ref() == Some(token));
        if owned && self.unregister_agent(id).await {
            AccessMethodResponse::ok(
                AccessMethod::Unsubscribe,
                uri::ROOT,
                json!({ "message": "The agent has been properly unregistered" }),
            )
        } else {
            AccessMethodResponse::error(
                AccessMethod::Unsubscribe,
                uri::ROOT,
                status::INTERNAL_ERROR,
                "Unable to unregister the agent",
            )
        }
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.inner.agents.lock().keys().cloned().collect()
    }

    // --- Federation ---

    /// Connect a peer gateway. Returns its local id, or `None` when the
    /// connection failed and nothing was registered.
    #[instrument(skip_all)]
    pub async fn create_remote_core(&self, endpoint: Arc<dyn RemoteEndpoint>) -> Option<u32> {
        let local_id = self.next_id();
        let local = Arc::new(LocalEndpoint::new(local_id, Arc::downgrade(&self.inner)));
        let core = Arc::new(RemoteCore::new(local_id, endpoint.clone(), local.clone()));
        self.inner.federation.insert(core);

        if !endpoint.connect(local.clone()).await {
            self.inner.federation.remove(local_id);
            warn!(local_id, "remote core connection failed");
            return None;
        }

        let agents: Vec<(AgentId, SnaFilter)> = self
            .inner
            .agents
            .lock()
            .iter()
            .map(|(id, agent)| (id.clone(), agent.filter.clone()))
            .collect();
        for (id, filter) in &agents {
            if let Err(error) = endpoint.register_agent(id, filter).await {
                warn!(local_id, agent_id = %id, error = %error, "agent not propagated");
            }
        }
        info!(local_id, agents = agents.len(), "remote core created");
        Some(local_id)
    }

    #[instrument(skip(self))]
    pub async fn disconnect_remote_core(&self, local_id: u32) -> bool {
        let Some(core) = self.inner.federation.get(local_id) else {
            return false;
        };
        core.endpoint().disconnect().await;
        core.local().on_disconnected();
        true
    }

    pub fn remote_namespaces(&self) -> Vec<String> {
        self.inner.federation.namespaces()
    }

    // --- Engine ---

    /// Filters registered on exactly `uri`.
    pub fn count(&self, uri: &str) -> usize {
        self.inner.engine.count(uri)
    }

    /// Resolves once every message queued so far was dispatched.
    pub async fn flush(&self) {
        self.inner.engine.flush().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Unregister every provider, disconnect every remote core, then close
    /// the engine once pending messages are dispatched.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for name in self.inner.registry.provider_names() {
            if let Err(error) = self.inner.registry.unregister_provider(&name) {
                warn!(provider = %name, error = %error, "provider not unregistered");
            }
        }
        for core in self.inner.federation.cores() {
            core.endpoint().disconnect().await;
            core.local().on_disconnected();
        }
        self.inner.agents.lock().clear();
        self.inner.engine.close(true);
        info!("gateway runtime closed");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use twin_events::ManualClock;
    use twin_policy::StaticSecuredAccess;
    use twin_protocol::{
        ActionHandler, DescribeRequest, Invocation, MessageType, MethodCall, Recipient,
        SnaMessage, SubscribeRequest,
    };
    use twin_registry::{ResourceModel, ServiceModel};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<SnaMessage>>,
        stopped: AtomicBool,
    }

    impl Recorder {
        fn values(&self) -> Vec<Value> {
            self.messages
                .lock()
                .iter()
                .filter(|m| m.message_type() == MessageType::Update)
                .filter_map(|m| m.value().cloned())
                .collect()
        }
    }

    impl Recipient for Recorder {
        fn callback(&self, _id: &SubscriptionId, message: &SnaMessage) -> anyhow::Result<()> {
            self.messages.lock().push(message.clone());
            Ok(())
        }
    }

    impl AgentCallback for Recorder {
        fn register(&self, message: &SnaMessage) -> anyhow::Result<()> {
            self.messages.lock().push(message.clone());
            Ok(())
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    struct Echo;

    impl ActionHandler for Echo {
        fn act(&self, arguments: &[Value]) -> anyhow::Result<Value> {
            Ok(json!(arguments))
        }
    }

    struct Fixture {
        runtime: GatewayRuntime,
        security: Arc<StaticSecuredAccess>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Result<Fixture> {
        let security = Arc::new(StaticSecuredAccess::default());
        let clock = Arc::new(ManualClock::default());
        let runtime = GatewayRuntime::new(
            RuntimeConfig {
                namespace: "local".to_owned(),
                registry: RegistryConfig::default(),
            },
            RuntimeServices {
                security: security.clone(),
                authentication: security.clone(),
                tokens: Arc::new(RandomTokens),
                clock: clock.clone(),
                post_filters: PostFilterRegistry::default(),
            },
        )?;
        runtime.register_provider(
            ProviderModel::new("Foo")
                .service(
                    ServiceModel::new("data").resource(
                        ResourceModel::data("value", json!(10)).attribute("unit", json!("C")),
                    ),
                )
                .service(
                    ServiceModel::new("control")
                        .resource(ResourceModel::action("echo", Arc::new(Echo)))
                        .resource(
                            ResourceModel::data("locked", json!(true))
                                .require(AccessMethod::Set, AccessLevel::Admin),
                        ),
                ),
        )?;
        Ok(Fixture {
            runtime,
            security,
            clock,
        })
    }

    fn call(provider: &str, service: &str, resource: &str, call: MethodCall) -> Invocation {
        Invocation::new(ResourcePath::new(provider, service, resource), call)
    }

    fn get(provider: &str, service: &str, resource: &str) -> Invocation {
        call(provider, service, resource, MethodCall::Get { attribute: None })
    }

    fn subscription_id(response: &AccessMethodResponse) -> SubscriptionId {
        response
            .payload()
            .and_then(|p| p["subscriptionId"].as_str())
            .map(SubscriptionId::from_string)
            .expect("subscription id")
    }

    #[tokio::test]
    async fn get_set_and_attributes() -> Result<()> {
        let Fixture { runtime, .. } = fixture()?;
        let session = runtime.anonymous_session();

        let response = runtime.execute(&session, get("Foo", "data", "value")).await;
        assert_eq!(response.status_code, status::OK);
        assert_eq!(response.payload().map(|p| p["value"].clone()), Some(json!(10)));

        let set = call(
            "Foo",
            "data",
            "value",
            MethodCall::Set {
                attribute: None,
                value: json!(42),
            },
        )
        .with_request_id("req-7");
        let response = runtime.execute(&session, set).await;
        assert_eq!(response.status_code, status::OK);
        assert_eq!(response.request_id.as_deref(), Some("req-7"));

        let unit = call(
            "Foo",
            "data",
            "value",
            MethodCall::Get {
                attribute: Some("unit".to_owned()),
            },
        );
        let response = runtime.execute(&session, unit).await;
        assert_eq!(response.uri, "/Foo/data/value/unit");
        assert_eq!(response.payload().map(|p| p["value"].clone()), Some(json!("C")));

        let missing = call(
            "Foo",
            "data",
            "value",
            MethodCall::Get {
                attribute: Some("nope".to_owned()),
            },
        );
        assert_eq!(runtime.execute(&session, missing).await.status_code, status::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn methods_are_checked_against_resource_type_and_grants() -> Result<()> {
        let Fixture { runtime, .. } = fixture()?;
        let session = runtime.anonymous_session();

        let act_on_data = call("Foo", "data", "value", MethodCall::Act { arguments: vec![] });
        assert_eq!(
            runtime.execute(&session, act_on_data).await.status_code,
            status::UNKNOWN_METHOD
        );
        let get_on_action = get("Foo", "control", "echo");
        let response = runtime.execute(&session, get_on_action).await;
        assert_eq!(response.status_code, status::UNKNOWN_METHOD);
        assert_eq!(response.error_message(), Some("Unknown method"));

        let act = call(
            "Foo",
            "control",
            "echo",
            MethodCall::Act {
                arguments: vec![json!(1), json!("two")],
            },
        );
        let response = runtime.execute(&session, act).await;
        assert_eq!(response.status_code, status::OK);
        assert_eq!(response.payload(), Some(&json!([1, "two"])));

        let set_locked = call(
            "Foo",
            "control",
            "locked",
            MethodCall::Set {
                attribute: None,
                value: json!(false),
            },
        );
        let response = runtime.execute(&session, set_locked).await;
        assert_eq!(response.status_code, status::FORBIDDEN);
        assert_eq!(response.error_message(), Some("Unaccessible object"));

        let bogus = runtime.execute(&session, get("Bogus", "data", "value")).await;
        assert_eq!(bogus.status_code, status::NOT_FOUND);
        assert_eq!(bogus.error_message(), Some("Resource /Bogus/data/value not found"));
        let unknown_peer = runtime.execute(&session, get("peer:Foo", "data", "value")).await;
        assert_eq!(unknown_peer.status_code, status::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn subscriptions_deliver_updates_and_unsubscribe_cleanly() -> Result<()> {
        let Fixture { runtime, clock, .. } = fixture()?;
        let session = runtime.anonymous_session();
        let recorder = Arc::new(Recorder::default());
        let before = runtime.count("/Foo/data/value");

        let subscribe = call(
            "Foo",
            "data",
            "value",
            MethodCall::Subscribe(
                SubscribeRequest::new(recorder.clone())
                    .constraint(json!([{"operator": ">", "operand": 20}]))
                    .expires_at(clock.now() + TimeDelta::seconds(60)),
            ),
        );
        let response = runtime.execute(&session, subscribe).await;
        assert_eq!(response.status_code, status::OK);
        let id = subscription_id(&response);
        assert_eq!(runtime.count("/Foo/data/value"), before + 1);

        let path = ResourcePath::new("Foo", "data", "value");
        runtime.push_update(&path, json!(5), None)?;
        runtime.push_update(&path, json!(25), None)?;
        runtime.flush().await;
        assert_eq!(recorder.values(), vec![json!(25)]);

        let unsubscribe = call(
            "Foo",
            "data",
            "value",
            MethodCall::Unsubscribe {
                subscription_id: id.clone(),
            },
        );
        assert!(runtime.execute(&session, unsubscribe.clone()).await.is_success());
        assert_eq!(runtime.count("/Foo/data/value"), before);
        assert!(runtime.execute(&session, unsubscribe).await.is_success());

        runtime.push_update(&path, json!(30), None)?;
        runtime.flush().await;
        assert_eq!(recorder.values(), vec![json!(25)]);
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_only_cancels_subscriptions_of_the_named_resource() -> Result<()> {
        let Fixture { runtime, .. } = fixture()?;
        let owner = runtime.anonymous_session();
        let stranger = runtime.anonymous_session();
        let recorder = Arc::new(Recorder::default());
        let value = ResourcePath::new("Foo", "data", "value");

        let subscribe = call(
            "Foo",
            "data",
            "value",
            MethodCall::Subscribe(SubscribeRequest::new(recorder.clone())),
        );
        let id = subscription_id(&runtime.execute(&owner, subscribe).await);

        let elsewhere = call(
            "Foo",
            "control",
            "locked",
            MethodCall::Unsubscribe {
                subscription_id: id.clone(),
            },
        );
        let response = runtime.execute(&stranger, elsewhere).await;
        assert_eq!(response.status_code, status::OK);
        assert_eq!(runtime.inner.registry.subscriptions(&value), vec![id.clone()]);

        runtime.push_update(&value, json!(42), None)?;
        runtime.flush().await;
        assert_eq!(recorder.values(), vec![json!(42)]);

        let unsubscribe = call(
            "Foo",
            "data",
            "value",
            MethodCall::Unsubscribe {
                subscription_id: id,
            },
        );
        assert!(runtime.execute(&owner, unsubscribe).await.is_success());
        assert!(runtime.inner.registry.subscriptions(&value).is_empty());
        assert_eq!(runtime.count("/Foo/data/value"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn expired_subscriptions_leave_the_registry() -> Result<()> {
        let Fixture { runtime, clock, .. } = fixture()?;
        let session = runtime.anonymous_session();
        let value = ResourcePath::new("Foo", "data", "value");
        for _ in 0..3 {
            let subscribe = call(
                "Foo",
                "data",
                "value",
                MethodCall::Subscribe(
                    SubscribeRequest::new(Arc::new(Recorder::default()))
                        .expires_at(clock.now() + TimeDelta::seconds(1)),
                ),
            );
            assert!(runtime.execute(&session, subscribe).await.is_success());
        }
        assert_eq!(runtime.inner.registry.subscriptions(&value).len(), 3);

        clock.advance(TimeDelta::seconds(5));
        runtime.push_update(&value, json!(1), None)?;
        runtime.flush().await;

        assert_eq!(runtime.count("/Foo/data/value"), 0);
        assert!(runtime.inner.registry.subscriptions(&value).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sessions_resolve_identities() -> Result<()> {
        let Fixture {
            runtime, security, ..
        } = fixture()?;
        let first = runtime.anonymous_session();
        let second = runtime.anonymous_session();
        assert_ne!(first.public_key(), second.public_key());
        assert!(first.public_key().is_anonymous());

        security.add_user("alice", "secret", AccessTree::new(AccessLevel::Admin));
        let alice = runtime.open_session(&Credentials::new("alice", "secret"))?;
        let again = runtime.open_session(&Credentials::new("alice", "secret"))?;
        assert_eq!(alice.token(), again.token());
        assert!(matches!(
            runtime.open_session(&Credentials::new("alice", "wrong")),
            Err(GatewayError::InvalidCredentials(_))
        ));

        let set_locked = call(
            "Foo",
            "control",
            "locked",
            MethodCall::Set {
                attribute: None,
                value: json!(false),
            },
        );
        assert!(runtime.execute(&alice, set_locked).await.is_success());

        let app_key = security.add_application("app-secret", AccessTree::anonymous());
        assert_eq!(runtime.application_session("app-secret").public_key(), &app_key);
        assert!(runtime.application_session("unknown").public_key().is_anonymous());

        assert!(runtime.session(alice.token()).is_some());
        assert!(runtime.close_session(alice.token()).await);
        assert!(runtime.session(alice.token()).is_none());
        assert!(!runtime.close_session(alice.token()).await);
        Ok(())
    }

    #[tokio::test]
    async fn describe_hides_inaccessible_elements() -> Result<()> {
        let Fixture { runtime, .. } = fixture()?;
        runtime.register_provider(
            ProviderModel::new("Vault")
                .require(AccessMethod::Describe, AccessLevel::Admin)
                .service(ServiceModel::new("data").resource(ResourceModel::data("pin", json!(1)))),
        )?;
        let session = runtime.anonymous_session();

        let hidden = call("Vault", "data", "pin", MethodCall::Describe);
        assert_eq!(runtime.execute(&session, hidden).await.status_code, status::NOT_FOUND);

        let listing = runtime
            .describe(&session, DescribeRequest::Providers { filter: None }, None)
            .await;
        assert_eq!(listing.payload(), Some(&json!(["Foo"])));

        let described = runtime
            .describe(
                &session,
                DescribeRequest::Resource {
                    provider: "Foo".to_owned(),
                    service: "data".to_owned(),
                    resource: "value".to_owned(),
                },
                None,
            )
            .await;
        assert_eq!(described.status_code, status::OK);
        assert_eq!(described.payload().map(|p| p["type"].clone()), Some(json!("DATA")));
        Ok(())
    }

    #[tokio::test]
    async fn session_agents_follow_their_session() -> Result<()> {
        let Fixture { runtime, .. } = fixture()?;
        let session = runtime.anonymous_session();
        let agent = Arc::new(Recorder::default());

        let response = runtime
            .register_session_agent(session.token(), agent.clone(), SnaFilter::new("/Foo"))
            .await;
        assert_eq!(response.status_code, status::OK);
        assert_eq!(response.uri, "/");
        let id = response
            .payload()
            .and_then(|p| p["subscriptionId"].as_str())
            .map(AgentId::from_string)
            .expect("agent id");

        runtime.push_update(&ResourcePath::new("Foo", "data", "value"), json!(11), None)?;
        runtime.flush().await;
        assert_eq!(agent.values(), vec![json!(11)]);

        let stranger = runtime.anonymous_session();
        let refused = runtime.unregister_session_agent(stranger.token(), &id).await;
        assert_eq!(refused.status_code, status::INTERNAL_ERROR);

        let response = runtime.unregister_session_agent(session.token(), &id).await;
        assert!(response.is_success());
        assert_eq!(
            response.payload().map(|p| p["message"].clone()),
            Some(json!("The agent has been properly unregistered"))
        );
        assert!(agent.stopped.load(Ordering::Acquire));

        let unknown = runtime
            .register_session_agent(
                &SessionToken::from_string("nope"),
                agent,
                SnaFilter::everything(),
            )
            .await;
        assert_eq!(unknown.status_code, status::INTERNAL_ERROR);
        Ok(())
    }

    #[tokio::test]
    async fn replaced_trees_reach_sessions_and_agents() -> Result<()> {
        let Fixture {
            runtime, security, ..
        } = fixture()?;
        runtime.register_provider(
            ProviderModel::new("Vault")
                .require_all(AccessLevel::Admin)
                .service(ServiceModel::new("data").resource(ResourceModel::data("pin", json!(1)))),
        )?;
        let key = security.add_agent_identity("rules", AccessTree::anonymous());
        let agent = Arc::new(Recorder::default());
        runtime
            .register_agent("rules", agent.clone(), SnaFilter::new("/Vault"))
            .await?;
        let pin = ResourcePath::new("Vault", "data", "pin");

        runtime.push_update(&pin, json!(2), None)?;
        runtime.flush().await;
        assert!(agent.values().is_empty());

        assert!(runtime.update_access_tree(&key, AccessTree::new(AccessLevel::Admin)));
        runtime.push_update(&pin, json!(3), None)?;
        runtime.flush().await;
        assert_eq!(agent.values(), vec![json!(3)]);
        let nobody = PublicKey::from_string("nobody");
        assert!(!runtime.update_access_tree(&nobody, AccessTree::anonymous()));
        Ok(())
    }

    #[tokio::test]
    async fn reregistered_providers_stay_hidden_from_unprivileged_agents() -> Result<()> {
        let Fixture {
            runtime, security, ..
        } = fixture()?;
        let vault = || {
            ProviderModel::new("Vault")
                .require_all(AccessLevel::Admin)
                .service(ServiceModel::new("data").resource(ResourceModel::data("pin", json!(1))))
        };
        let handle = runtime.register_provider(vault())?;
        runtime.flush().await;
        security.add_agent_identity("rules", AccessTree::anonymous());
        let agent = Arc::new(Recorder::default());
        runtime
            .register_agent("rules", agent.clone(), SnaFilter::new("/Vault"))
            .await?;

        runtime.unregister_provider(&handle)?;
        runtime.register_provider(vault())?;
        runtime.push_update(&ResourcePath::new("Vault", "data", "pin"), json!(1234), None)?;
        runtime.flush().await;

        assert!(agent.messages.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn close_unregisters_providers_and_stops_agents() -> Result<()> {
        let Fixture { runtime, .. } = fixture()?;
        let agent = Arc::new(Recorder::default());
        runtime
            .register_agent("rules", agent.clone(), SnaFilter::everything())
            .await?;
        runtime.close().await;

        assert!(runtime.is_closed());
        assert!(runtime.provider_names().is_empty());
        assert!(agent.stopped.load(Ordering::Acquire));
        assert!(matches!(
            runtime
                .register_agent("rules", agent.clone(), SnaFilter::everything())
                .await,
            Err(GatewayError::EngineClosed)
        ));
        runtime.close().await;
        Ok(())
    }
}
