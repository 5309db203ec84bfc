//! Uniform result envelope returned by every access method and listing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call::FilteringDefinition;
use crate::method::AccessMethod;

/// Status codes carried by [`AccessMethodResponse::status_code`].
pub mod status {
    pub const OK: u16 = 200;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const UNKNOWN_METHOD: u16 = 420;
    pub const UPSTREAM_UNAVAILABLE: u16 = 503;
    pub const INTERNAL_ERROR: u16 = 520;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    GetResponse,
    SetResponse,
    ActResponse,
    SubscribeResponse,
    UnsubscribeResponse,
    DescribeResponse,
    ProvidersList,
    ServicesList,
    ResourcesList,
    CompleteList,
}

impl From<AccessMethod> for ResponseType {
    fn from(method: AccessMethod) -> Self {
        match method {
            AccessMethod::Get => Self::GetResponse,
            AccessMethod::Set => Self::SetResponse,
            AccessMethod::Act => Self::ActResponse,
            AccessMethod::Subscribe => Self::SubscribeResponse,
            AccessMethod::Unsubscribe => Self::UnsubscribeResponse,
            AccessMethod::Describe => Self::DescribeResponse,
        }
    }
}

/// Either the successful payload or the error message of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Response(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessMethodResponse {
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    pub uri: String,
    pub status_code: u16,
    #[serde(flatten)]
    pub body: ResponseBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Filtering applied to a listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilteringDefinition>,
}

impl AccessMethodResponse {
    pub fn ok(
        response_type: impl Into<ResponseType>,
        uri: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            response_type: response_type.into(),
            uri: uri.into(),
            status_code: status::OK,
            body: ResponseBody::Response(payload),
            request_id: None,
            filter: None,
        }
    }

    pub fn error(
        response_type: impl Into<ResponseType>,
        uri: impl Into<String>,
        status_code: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            response_type: response_type.into(),
            uri: uri.into(),
            status_code,
            body: ResponseBody::Error(message.into()),
            request_id: None,
            filter: None,
        }
    }

    pub fn not_found(response_type: impl Into<ResponseType>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let message = format!("Resource {uri} not found");
        Self::error(response_type, uri, status::NOT_FOUND, message)
    }

    pub fn unknown_method(response_type: impl Into<ResponseType>, uri: impl Into<String>) -> Self {
        Self::error(response_type, uri, status::UNKNOWN_METHOD, "Unknown method")
    }

    pub fn forbidden(response_type: impl Into<ResponseType>, uri: impl Into<String>) -> Self {
        Self::error(response_type, uri, status::FORBIDDEN, "Unaccessible object")
    }

    pub fn internal_error(response_type: impl Into<ResponseType>, uri: impl Into<String>) -> Self {
        Self::error(
            response_type,
            uri,
            status::INTERNAL_ERROR,
            "Internal server error",
        )
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if request_id.is_some() {
            self.request_id = request_id;
        }
        self
    }

    pub fn with_filter(mut self, filter: Option<FilteringDefinition>) -> Self {
        self.filter = filter;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status_code == status::OK
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Response(value) => Some(value),
            ResponseBody::Error(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Response(_) => None,
            ResponseBody::Error(message) => Some(message),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
