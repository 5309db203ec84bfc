//! Access method invocations and listing requests.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SubscriptionId;
use crate::method::AccessMethod;
use crate::ports::Recipient;
use crate::response::ResponseType;
use crate::uri::{self, ResourcePath};

/// What happens to a subscription callback once its recipient failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPolicy {
    /// Log the failure and keep delivering.
    #[default]
    Log,
    /// Evict the callback on the next delivery attempt.
    Remove,
}

#[derive(Clone)]
pub struct SubscribeRequest {
    pub recipient: Arc<dyn Recipient>,
    /// Raw constraint definition, parsed when the subscription is installed.
    pub constraint: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_policy: ErrorPolicy,
}

impl SubscribeRequest {
    pub fn new(recipient: Arc<dyn Recipient>) -> Self {
        Self {
            recipient,
            constraint: None,
            expires_at: None,
            error_policy: ErrorPolicy::default(),
        }
    }

    pub fn constraint(mut self, definition: Value) -> Self {
        self.constraint = Some(definition);
        self
    }

    pub fn expires_at(mut self, deadline: DateTime<Utc>) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("constraint", &self.constraint)
            .field("expires_at", &self.expires_at)
            .field("error_policy", &self.error_policy)
            .finish_non_exhaustive()
    }
}

/// Method-specific arguments of an access method call.
#[derive(Debug, Clone)]
pub enum MethodCall {
    Get { attribute: Option<String> },
    Set { attribute: Option<String>, value: Value },
    Act { arguments: Vec<Value> },
    Subscribe(SubscribeRequest),
    Unsubscribe { subscription_id: SubscriptionId },
    Describe,
}

impl MethodCall {
    pub fn method(&self) -> AccessMethod {
        match self {
            Self::Get { .. } => AccessMethod::Get,
            Self::Set { .. } => AccessMethod::Set,
            Self::Act { .. } => AccessMethod::Act,
            Self::Subscribe(_) => AccessMethod::Subscribe,
            Self::Unsubscribe { .. } => AccessMethod::Unsubscribe,
            Self::Describe => AccessMethod::Describe,
        }
    }

    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::Get { attribute } | Self::Set { attribute, .. } => attribute.as_deref(),
            _ => None,
        }
    }
}

/// A full access method invocation against one resource.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub path: ResourcePath,
    pub call: MethodCall,
    pub request_id: Option<String>,
}

impl Invocation {
    pub fn new(path: ResourcePath, call: MethodCall) -> Self {
        Self {
            path,
            call,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn method(&self) -> AccessMethod {
        self.call.method()
    }

    /// Same invocation addressed to the provider id without its namespace.
    pub fn localized(&self) -> Self {
        Self {
            path: self.path.localized(),
            ..self.clone()
        }
    }
}

/// Enumeration and description requests over the model hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum DescribeRequest {
    Providers { filter: Option<String> },
    All { filter: Option<String> },
    Provider { provider: String },
    Services { provider: String },
    Service { provider: String, service: String },
    Resources { provider: String, service: String },
    Resource { provider: String, service: String, resource: String },
}

impl DescribeRequest {
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::Providers { .. } => ResponseType::ProvidersList,
            Self::All { .. } => ResponseType::CompleteList,
            Self::Services { .. } => ResponseType::ServicesList,
            Self::Resources { .. } => ResponseType::ResourcesList,
            Self::Provider { .. } | Self::Service { .. } | Self::Resource { .. } => {
                ResponseType::DescribeResponse
            }
        }
    }

    /// Provider targeted by the request, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Providers { .. } | Self::All { .. } => None,
            Self::Provider { provider }
            | Self::Services { provider }
            | Self::Service { provider, .. }
            | Self::Resources { provider, .. }
            | Self::Resource { provider, .. } => Some(provider),
        }
    }

    pub fn uri(&self) -> String {
        match self {
            Self::Providers { .. } | Self::All { .. } => uri::ROOT.to_owned(),
            Self::Provider { provider } | Self::Services { provider } => {
                uri::uri([provider.as_str()])
            }
            Self::Service { provider, service } | Self::Resources { provider, service } => {
                uri::uri([provider.as_str(), service.as_str()])
            }
            Self::Resource {
                provider,
                service,
                resource,
            } => uri::uri([provider.as_str(), service.as_str(), resource.as_str()]),
        }
    }

    /// Same request addressed to the provider id without its namespace.
    pub fn localized(&self) -> Self {
        let strip = |provider: &String| match uri::split_namespace(provider) {
            Some((_, local)) => local.to_owned(),
            None => provider.clone(),
        };
        match self {
            Self::Providers { .. } | Self::All { .. } => self.clone(),
            Self::Provider { provider } => Self::Provider {
                provider: strip(provider),
            },
            Self::Services { provider } => Self::Services {
                provider: strip(provider),
            },
            Self::Service { provider, service } => Self::Service {
                provider: strip(provider),
                service: service.clone(),
            },
            Self::Resources { provider, service } => Self::Resources {
                provider: strip(provider),
                service: service.clone(),
            },
            Self::Resource {
                provider,
                service,
                resource,
            } => Self::Resource {
                provider: strip(provider),
                service: service.clone(),
                resource: resource.clone(),
            },
        }
    }
}

/// Result filtering requested alongside a listing: `ldap` definitions
/// select providers, any other type names a registered post filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringDefinition {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(rename = "definition")]
    pub filter: String,
}

impl FilteringDefinition {
    pub const LDAP: &'static str = "ldap";

    pub fn new(filter_type: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            filter_type: filter_type.into(),
            filter: filter.into(),
        }
    }

    pub fn ldap(filter: impl Into<String>) -> Self {
        Self::new(Self::LDAP, filter)
    }

    pub fn is_ldap(&self) -> bool {
        self.filter_type.eq_ignore_ascii_case(Self::LDAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_requests_localize_provider_ids() {
        let request = DescribeRequest::Resources {
            provider: "peer:Bar".to_owned(),
            service: "data".to_owned(),
        };
        assert_eq!(request.provider(), Some("peer:Bar"));
        assert_eq!(request.localized().uri(), "/Bar/data");
        assert_eq!(request.response_type(), ResponseType::ResourcesList);
    }

    #[test]
    fn method_calls_expose_method_and_attribute() {
        let call = MethodCall::Get {
            attribute: Some("unit".to_owned()),
        };
        assert_eq!(call.method(), AccessMethod::Get);
        assert_eq!(call.attribute(), Some("unit"));
        assert_eq!(MethodCall::Describe.attribute(), None);
    }

    #[test]
    fn filtering_definition_detects_ldap() {
        assert!(FilteringDefinition::ldap("(name=Foo)").is_ldap());
        assert!(!FilteringDefinition::new("xfilter", "a").is_ldap());
    }
}
