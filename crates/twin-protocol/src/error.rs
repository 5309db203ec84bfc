//! Error types for the twin gateway protocol.

use thiserror::Error;

/// Errors raised by gateway operations outside the response envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid credentials for login '{0}'")]
    InvalidCredentials(String),
    #[error("service provider already registered: {0}")]
    ProviderExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid provider id: {0}")]
    InvalidProviderId(String),
    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),
    #[error("resource {0} is not a data resource")]
    NotData(String),
    #[error("resource {0} is not an action resource")]
    NotAction(String),
    #[error("action failed: {0}")]
    ActionFailed(String),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error("dispatch engine closed")]
    EngineClosed,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
