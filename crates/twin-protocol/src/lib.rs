//! # twin-protocol: digital twin gateway contract
//!
//! Shared types and trait interfaces for the gateway crates. It carries no
//! runtime dependency (no tokio, no locks) so it can be used as a pure
//! contract crate by bindings and transports.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionToken, PublicKey, SubscriptionId, AgentId)
//! - [`uri`]: Provider/service/resource URIs and namespace-qualified provider ids
//! - [`method`]: AccessMethod, AccessLevel, MethodAccessibility
//! - [`constraint`]: Subscription value constraints
//! - [`message`]: SnaMessage and its kinds
//! - [`filter`]: SnaFilter predicates over messages
//! - [`response`]: AccessMethodResponse envelope and status codes
//! - [`call`]: Invocations, describe requests, filtering definitions
//! - [`ports`]: Runtime boundary ports (recipients, agents, actions, post filters, federation)
//! - [`error`]: GatewayError, GatewayResult

pub mod call;
pub mod constraint;
pub mod error;
pub mod filter;
pub mod ids;
pub mod message;
pub mod method;
pub mod ports;
pub mod response;
pub mod uri;

pub use call::{
    DescribeRequest, ErrorPolicy, FilteringDefinition, Invocation, MethodCall, SubscribeRequest,
};
pub use constraint::{Condition, Constraint, Operator};
pub use error::{GatewayError, GatewayResult};
pub use filter::SnaFilter;
pub use ids::{AgentId, PublicKey, SessionToken, SubscriptionId};
pub use message::{LifecycleEvent, MessageKind, MessageType, SnaMessage};
pub use method::{AccessLevel, AccessMethod, MethodAccessibility};
pub use ports::{
    ActionHandler, AgentCallback, LocalEndpointPort, MessageSink, PostFilter, Recipient,
    RemoteEndpoint,
};
pub use response::{AccessMethodResponse, ResponseBody, ResponseType, status};
pub use uri::ResourcePath;

/// Credentials presented to open an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}
