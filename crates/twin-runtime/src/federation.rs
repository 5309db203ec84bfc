//! Remote core federation: peer gateways addressed by the namespace prefix
//! of provider ids, and the inbound endpoint answering their requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};
use twin_protocol::{
    AccessMethodResponse, AgentCallback, AgentId, DescribeRequest, GatewayError, GatewayResult,
    Invocation, LocalEndpointPort, PublicKey, RemoteEndpoint, SessionToken, SnaFilter, uri,
};

use crate::enumeration::Fragment;
use crate::{GatewayRuntime, RuntimeInner};

/// Handle on one peer gateway.
pub struct RemoteCore {
    local_id: u32,
    endpoint: Arc<dyn RemoteEndpoint>,
    local: Arc<LocalEndpoint>,
    namespace: RwLock<Option<String>>,
}

impl RemoteCore {
    pub(crate) fn new(
        local_id: u32,
        endpoint: Arc<dyn RemoteEndpoint>,
        local: Arc<LocalEndpoint>,
    ) -> Self {
        Self {
            local_id,
            endpoint,
            local,
            namespace: RwLock::new(None),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Namespace announced by the peer once connected.
    pub fn namespace(&self) -> Option<String> {
        self.namespace.read().clone()
    }

    pub fn endpoint(&self) -> &Arc<dyn RemoteEndpoint> {
        &self.endpoint
    }

    pub(crate) fn local(&self) -> &Arc<LocalEndpoint> {
        &self.local
    }
}

impl fmt::Debug for RemoteCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCore")
            .field("local_id", &self.local_id)
            .field("namespace", &self.namespace())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct FederationState {
    cores: IndexMap<u32, Arc<RemoteCore>>,
    namespaces: HashMap<String, u32>,
}

/// Remote cores by local id and by announced namespace.
#[derive(Default)]
pub struct Federation {
    state: RwLock<FederationState>,
}

impl Federation {
    pub(crate) fn insert(&self, core: Arc<RemoteCore>) {
        self.state.write().cores.insert(core.local_id, core);
    }

    /// Bind `namespace` to the core `local_id`. Refused when the core is
    /// unknown or the namespace already belongs to another core.
    pub(crate) fn bind(&self, local_id: u32, namespace: &str) -> bool {
        let mut state = self.state.write();
        let Some(core) = state.cores.get(&local_id).cloned() else {
            return false;
        };
        match state.namespaces.get(namespace) {
            Some(owner) if *owner != local_id => {
                warn!(namespace, local_id, owner, "namespace already bound to another remote core");
                return false;
            }
            _ => {}
        }
        if let Some(previous) = core.namespace.write().replace(namespace.to_owned())
            && previous != namespace
        {
            state.namespaces.remove(&previous);
        }
        state.namespaces.insert(namespace.to_owned(), local_id);
        true
    }

    pub(crate) fn remove(&self, local_id: u32) -> Option<Arc<RemoteCore>> {
        let mut state = self.state.write();
        let core = state.cores.shift_remove(&local_id)?;
        if let Some(namespace) = core.namespace() {
            state.namespaces.remove(&namespace);
        }
        Some(core)
    }

    pub fn get(&self, local_id: u32) -> Option<Arc<RemoteCore>> {
        self.state.read().cores.get(&local_id).cloned()
    }

    /// Core owning the namespace prefix of `provider`. Bare ids and unknown
    /// namespaces route nowhere.
    pub fn route(&self, provider: &str) -> Option<Arc<RemoteCore>> {
        let (namespace, _) = uri::split_namespace(provider)?;
        let state = self.state.read();
        let local_id = state.namespaces.get(namespace)?;
        state.cores.get(local_id).cloned()
    }

    /// Every core, connected or not.
    pub fn cores(&self) -> Vec<Arc<RemoteCore>> {
        self.state.read().cores.values().cloned().collect()
    }

    /// Cores whose peer announced its namespace.
    pub fn connected(&self) -> Vec<Arc<RemoteCore>> {
        let state = self.state.read();
        state
            .cores
            .values()
            .filter(|core| core.namespace.read().is_some())
            .cloned()
            .collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.connected()
            .iter()
            .filter_map(|core| core.namespace())
            .collect()
    }
}

/// Inbound side of a remote core: answers the peer with sessions bound to
/// its identities and hosts the proxy agents it installs.
pub struct LocalEndpoint {
    local_id: u32,
    runtime: Weak<RuntimeInner>,
    sessions: Mutex<IndexSet<SessionToken>>,
    agents: Mutex<IndexSet<AgentId>>,
}

impl LocalEndpoint {
    pub(crate) fn new(local_id: u32, runtime: Weak<RuntimeInner>) -> Self {
        Self {
            local_id,
            runtime,
            sessions: Mutex::new(IndexSet::new()),
            agents: Mutex::new(IndexSet::new()),
        }
    }

    fn runtime(&self) -> Option<GatewayRuntime> {
        self.runtime.upgrade().map(GatewayRuntime::from_inner)
    }

    /// Key under which the peer identity `key` acts on this gateway.
    fn peer_key(&self, key: &PublicKey) -> PublicKey {
        if key.is_anonymous() {
            PublicKey::remote_anonymous(self.local_id)
        } else {
            key.clone()
        }
    }

    fn session(&self, runtime: &GatewayRuntime, key: &PublicKey) -> Arc<crate::Session> {
        let session = runtime.peer_session(self.peer_key(key), self.local_id);
        self.sessions.lock().insert(session.token().clone());
        session
    }
}

#[async_trait]
impl LocalEndpointPort for LocalEndpoint {
    fn local_id(&self) -> u32 {
        self.local_id
    }

    fn on_connected(&self, namespace: &str) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        if runtime.inner.federation.bind(self.local_id, namespace) {
            info!(local_id = self.local_id, namespace, "remote core connected");
        }
    }

    fn on_disconnected(&self) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        let sessions: Vec<SessionToken> = self.sessions.lock().drain(..).collect();
        for token in &sessions {
            runtime.inner.sessions.remove(token);
        }
        let agents: Vec<AgentId> = self.agents.lock().drain(..).collect();
        for agent in &agents {
            runtime.inner.engine.unregister_agent(agent);
        }
        let removed = runtime.inner.federation.remove(self.local_id);
        info!(
            local_id = self.local_id,
            namespace = ?removed.and_then(|core| core.namespace()),
            sessions = sessions.len(),
            agents = agents.len(),
            "remote core disconnected"
        );
    }

    async fn invoke(&self, public_key: &PublicKey, invocation: Invocation) -> AccessMethodResponse {
        let Some(runtime) = self.runtime() else {
            return AccessMethodResponse::internal_error(invocation.method(), invocation.path.uri());
        };
        let session = self.session(&runtime, public_key);
        runtime.execute(&session, invocation).await
    }

    async fn describe(&self, public_key: &PublicKey, request: DescribeRequest) -> Option<Value> {
        let runtime = self.runtime()?;
        let session = self.session(&runtime, public_key);
        match runtime.fragment(&session, &request).await {
            Fragment::Found(value) => Some(value),
            Fragment::NotFound => None,
            Fragment::Failed(error) => {
                debug!(local_id = self.local_id, error = %error, "peer description failed");
                None
            }
        }
    }

    fn register_agent(
        &self,
        agent: AgentId,
        filter: SnaFilter,
        callback: Arc<dyn AgentCallback>,
    ) -> GatewayResult<()> {
        let runtime = self.runtime().ok_or(GatewayError::EngineClosed)?;
        if runtime.inner.engine.is_closed() {
            return Err(GatewayError::EngineClosed);
        }
        let key = PublicKey::remote_anonymous(self.local_id);
        runtime
            .inner
            .engine
            .register_agent(agent.clone(), key, filter, callback);
        debug!(local_id = self.local_id, agent_id = %agent, "proxy agent installed");
        self.agents.lock().insert(agent);
        Ok(())
    }

    fn unregister_agent(&self, agent: &AgentId) -> bool {
        if !self.agents.lock().shift_remove(agent) {
            return false;
        }
        self.runtime()
            .is_some_and(|runtime| runtime.inner.engine.unregister_agent(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(local_id: u32) -> Arc<RemoteCore> {
        struct Unreachable;

        #[async_trait]
        impl RemoteEndpoint for Unreachable {
            async fn connect(&self, _local: Arc<dyn LocalEndpointPort>) -> bool {
                false
            }
            async fn disconnect(&self) {}
            async fn describe(
                &self,
                _: &PublicKey,
                _: &DescribeRequest,
            ) -> GatewayResult<Option<Value>> {
                Ok(None)
            }
            async fn invoke(
                &self,
                _: &PublicKey,
                _: &Invocation,
            ) -> GatewayResult<Option<AccessMethodResponse>> {
                Ok(None)
            }
            async fn register_agent(&self, _: &AgentId, _: &SnaFilter) -> GatewayResult<()> {
                Ok(())
            }
            async fn unregister_agent(&self, _: &AgentId) -> GatewayResult<()> {
                Ok(())
            }
        }

        Arc::new(RemoteCore::new(
            local_id,
            Arc::new(Unreachable),
            Arc::new(LocalEndpoint::new(local_id, Weak::new())),
        ))
    }

    #[test]
    fn routes_follow_bound_namespaces() {
        let federation = Federation::default();
        federation.insert(core(1));
        federation.insert(core(2));
        assert!(federation.route("peer:Foo").is_none());
        assert!(federation.connected().is_empty());

        assert!(federation.bind(1, "peer"));
        assert!(!federation.bind(2, "peer"));
        assert!(!federation.bind(9, "other"));

        assert_eq!(federation.route("peer:Foo").map(|c| c.local_id()), Some(1));
        assert!(federation.route("Foo").is_none());
        assert!(federation.route("other:Foo").is_none());
        assert_eq!(federation.namespaces(), vec!["peer"]);
        assert_eq!(federation.cores().len(), 2);
    }

    #[test]
    fn removal_releases_the_namespace() {
        let federation = Federation::default();
        federation.insert(core(1));
        assert!(federation.bind(1, "peer"));

        let removed = federation.remove(1).expect("core was registered");
        assert_eq!(removed.namespace().as_deref(), Some("peer"));
        assert!(federation.route("peer:Foo").is_none());
        assert!(federation.get(1).is_none());

        federation.insert(core(2));
        assert!(federation.bind(2, "peer"));
    }

    #[test]
    fn rebinding_moves_the_namespace() {
        let federation = Federation::default();
        federation.insert(core(1));
        assert!(federation.bind(1, "old"));
        assert!(federation.bind(1, "new"));
        assert!(federation.route("old:Foo").is_none());
        assert_eq!(federation.route("new:Foo").map(|c| c.local_id()), Some(1));
    }

    #[test]
    fn detached_endpoints_refuse_agents() {
        let endpoint = LocalEndpoint::new(4, Weak::new());
        assert_eq!(endpoint.peer_key(&PublicKey::anonymous(7)).as_str(), "anonymous_R4");
        assert_eq!(endpoint.peer_key(&PublicKey::from_string("abc")).as_str(), "abc");
        assert!(matches!(
            endpoint.register_agent(
                AgentId::generate(),
                SnaFilter::everything(),
                Arc::new(NoopAgent)
            ),
            Err(GatewayError::EngineClosed)
        ));
    }

    struct NoopAgent;

    impl AgentCallback for NoopAgent {
        fn register(&self, _message: &twin_protocol::SnaMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
