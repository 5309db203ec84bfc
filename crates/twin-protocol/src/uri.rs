//! URI helpers for the provider/service/resource/attribute hierarchy.
//!
//! URIs are `/`-separated: `/provider[/service[/resource[/attribute]]]`.
//! A provider id is either bare (local) or `namespace:localId` (remote).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

pub const SEPARATOR: char = '/';
pub const NAMESPACE_SEPARATOR: char = ':';
pub const ROOT: &str = "/";

/// Build a URI from its segments, skipping empty ones.
pub fn uri<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for segment in segments {
        let segment = segment.trim_matches(SEPARATOR);
        if segment.is_empty() {
            continue;
        }
        out.push(SEPARATOR);
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push(SEPARATOR);
    }
    out
}

/// Split a URI into its non-empty segments.
pub fn segments(uri: &str) -> Vec<&str> {
    uri.split(SEPARATOR).filter(|s| !s.is_empty()).collect()
}

/// True when `prefix` designates `path` itself or one of its ancestors.
///
/// Matching is done on segment boundaries, so `/Foo` covers `/Foo/data` but
/// not `/Foobar`.
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let prefix = segments(prefix);
    let path = segments(path);
    prefix.len() <= path.len() && prefix.iter().zip(path.iter()).all(|(a, b)| a == b)
}

/// Split `namespace:localId` into its parts. Bare ids yield `None`.
pub fn split_namespace(provider: &str) -> Option<(&str, &str)> {
    let (namespace, local) = provider.split_once(NAMESPACE_SEPARATOR)?;
    if namespace.is_empty() || local.is_empty() {
        return None;
    }
    Some((namespace, local))
}

/// Prefix a provider id with `namespace`.
pub fn qualify(namespace: &str, provider: &str) -> String {
    format!("{namespace}{NAMESPACE_SEPARATOR}{provider}")
}

/// Address of a resource: provider, service and resource names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub provider: String,
    pub service: String,
    pub resource: String,
}

impl ResourcePath {
    pub fn new(
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
            resource: resource.into(),
        }
    }

    /// Parse `/provider/service/resource`.
    pub fn parse(uri: &str) -> GatewayResult<Self> {
        match segments(uri).as_slice() {
            [provider, service, resource] => Ok(Self::new(*provider, *service, *resource)),
            _ => Err(GatewayError::NotFound(format!("not a resource uri: {uri}"))),
        }
    }

    pub fn uri(&self) -> String {
        uri([
            self.provider.as_str(),
            self.service.as_str(),
            self.resource.as_str(),
        ])
    }

    pub fn service_uri(&self) -> String {
        uri([self.provider.as_str(), self.service.as_str()])
    }

    pub fn provider_uri(&self) -> String {
        uri([self.provider.as_str()])
    }

    /// Same path with the provider id prefixed by `namespace`.
    pub fn qualified(&self, namespace: &str) -> Self {
        Self {
            provider: qualify(namespace, &self.provider),
            ..self.clone()
        }
    }

    /// Same path with any namespace prefix dropped from the provider id.
    pub fn localized(&self) -> Self {
        match split_namespace(&self.provider) {
            Some((_, local)) => Self {
                provider: local.to_owned(),
                ..self.clone()
            },
            None => self.clone(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}
