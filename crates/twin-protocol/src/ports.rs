//! Runtime ports between the gateway core and its collaborators.
//!
//! Southbound bindings, subscribers, agents, result post filters and the
//! federation transport only reach the core through these traits.
//!
//! Object-safety note:
//! - Federation ports use `async-trait` for async dyn-dispatch.
//! - Message delivery ports are synchronous; they run on the dispatch worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::call::{DescribeRequest, Invocation};
use crate::error::GatewayResult;
use crate::filter::SnaFilter;
use crate::ids::{AgentId, PublicKey, SubscriptionId};
use crate::message::SnaMessage;
use crate::response::AccessMethodResponse;

/// Receives the messages matched by one subscription.
pub trait Recipient: Send + Sync {
    fn callback(&self, subscription: &SubscriptionId, message: &SnaMessage) -> anyhow::Result<()>;
}

/// Long-lived listener on the whole message stream.
pub trait AgentCallback: Send + Sync {
    fn register(&self, message: &SnaMessage) -> anyhow::Result<()>;

    /// Called once when the agent is unregistered or the gateway shuts down.
    fn stop(&self) {}
}

/// Producer side of the dispatch engine. Pushing never blocks.
pub trait MessageSink: Send + Sync {
    fn push(&self, message: SnaMessage);
}

/// Invocation handler of an ACTION resource.
pub trait ActionHandler: Send + Sync {
    fn act(&self, arguments: &[Value]) -> anyhow::Result<Value>;
}

/// Named transformation applied to a listing result.
pub trait PostFilter: Send + Sync {
    fn handles(&self, filter_type: &str) -> bool;
    fn apply(&self, definition: &str, result: Value) -> anyhow::Result<Value>;
}

/// Transport-side handle on a peer gateway.
///
/// `Ok(None)` means the peer answered but knows no such element;
/// `Err` means the peer could not answer.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Open the connection. The endpoint reports the peer namespace through
    /// [`LocalEndpointPort::on_connected`] and later disconnections through
    /// [`LocalEndpointPort::on_disconnected`].
    async fn connect(&self, local: Arc<dyn LocalEndpointPort>) -> bool;

    async fn disconnect(&self);

    async fn describe(
        &self,
        public_key: &PublicKey,
        request: &DescribeRequest,
    ) -> GatewayResult<Option<Value>>;

    async fn invoke(
        &self,
        public_key: &PublicKey,
        invocation: &Invocation,
    ) -> GatewayResult<Option<AccessMethodResponse>>;

    async fn register_agent(&self, agent: &AgentId, filter: &SnaFilter) -> GatewayResult<()>;

    async fn unregister_agent(&self, agent: &AgentId) -> GatewayResult<()>;
}

/// Gateway-side handle given to a peer transport: it answers the peer's
/// requests with sessions bound to the peer's identities.
#[async_trait]
pub trait LocalEndpointPort: Send + Sync {
    fn local_id(&self) -> u32;

    fn on_connected(&self, namespace: &str);

    fn on_disconnected(&self);

    async fn invoke(&self, public_key: &PublicKey, invocation: Invocation) -> AccessMethodResponse;

    async fn describe(&self, public_key: &PublicKey, request: DescribeRequest) -> Option<Value>;

    /// Install a proxy agent forwarding local messages to the peer.
    fn register_agent(
        &self,
        agent: AgentId,
        filter: SnaFilter,
        callback: Arc<dyn AgentCallback>,
    ) -> GatewayResult<()>;

    fn unregister_agent(&self, agent: &AgentId) -> bool;
}
