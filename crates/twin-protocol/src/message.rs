use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::method::{AccessLevel, AccessMethod};

/// Top-level family of a [`SnaMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Response,
    Update,
    Lifecycle,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    ProviderAppearing,
    ProviderDisappearing,
    ServiceAppearing,
    ServiceDisappearing,
    ResourceAppearing,
    ResourceDisappearing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "subtype", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Response(AccessMethod),
    Update,
    Lifecycle(LifecycleEvent),
    Error,
}

impl MessageKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Response(_) => MessageType::Response,
            Self::Update => MessageType::Update,
            Self::Lifecycle(_) => MessageType::Lifecycle,
            Self::Error => MessageType::Error,
        }
    }

    /// Access method an agent must be granted on the message path to
    /// receive a message of this kind.
    pub fn agent_method(&self) -> AccessMethod {
        match self {
            Self::Response(method) => *method,
            Self::Lifecycle(_) | Self::Error => AccessMethod::Describe,
            Self::Update => AccessMethod::Get,
        }
    }
}

/// Immutable event record routed by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnaMessage {
    #[serde(flatten)]
    pub kind: MessageKind,
    pub path: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Level the agent method required on `path` when the message was
    /// produced. Set on messages about elements that no longer exist.
    #[serde(skip)]
    pub required_level: Option<AccessLevel>,
}

impl SnaMessage {
    pub fn new(kind: MessageKind, path: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            path: path.into(),
            payload,
            timestamp: Utc::now(),
            required_level: None,
        }
    }

    pub fn with_required_level(mut self, level: AccessLevel) -> Self {
        self.required_level = Some(level);
        self
    }

    pub fn update(path: impl Into<String>, value: Value) -> Self {
        Self::new(MessageKind::Update, path, json!({ "value": value }))
    }

    pub fn lifecycle(event: LifecycleEvent, path: impl Into<String>) -> Self {
        Self::new(MessageKind::Lifecycle(event), path, Value::Null)
    }

    pub fn response(method: AccessMethod, path: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Response(method), path, payload)
    }

    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Error,
            path,
            json!({ "message": message.into() }),
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    /// Value carried by an UPDATE message.
    pub fn value(&self) -> Option<&Value> {
        self.payload.get("value")
    }
}
