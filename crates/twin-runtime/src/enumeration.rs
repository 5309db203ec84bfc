//! Provider listings and descriptions merged across the local registry and
//! every connected remote core, with pluggable post filters.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use twin_protocol::{
    AccessMethodResponse, DescribeRequest, FilteringDefinition, GatewayError, PostFilter, status,
};
use twin_registry::ProviderView;

use crate::GatewayRuntime;
use crate::sessions::Session;

/// Registered result post filters, looked up by filter type.
#[derive(Default)]
pub struct PostFilterRegistry {
    filters: RwLock<Vec<Arc<dyn PostFilter>>>,
}

impl PostFilterRegistry {
    pub fn register(&self, filter: Arc<dyn PostFilter>) {
        self.filters.write().push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the filter handling `definition`'s type. Without one the result
    /// passes through unchanged.
    pub fn apply(&self, definition: &FilteringDefinition, result: Value) -> anyhow::Result<Value> {
        let filter = self
            .filters
            .read()
            .iter()
            .find(|filter| filter.handles(&definition.filter_type))
            .cloned();
        match filter {
            Some(filter) => filter.apply(&definition.filter, result),
            None => {
                warn!(
                    filter_type = %definition.filter_type,
                    "no post filter for type, result left unfiltered"
                );
                Ok(result)
            }
        }
    }
}

/// Answer to a listing or description request, before it is wrapped.
#[derive(Debug)]
pub(crate) enum Fragment {
    Found(Value),
    NotFound,
    Failed(GatewayError),
}

/// Narrow a provider listing with an extra LDAP filter.
fn with_ldap(request: DescribeRequest, ldap: &str) -> DescribeRequest {
    let combine = |filter: Option<String>| {
        Some(match filter {
            Some(existing) if !existing.trim().is_empty() => format!("(&{existing}{ldap})"),
            _ => ldap.to_owned(),
        })
    };
    match request {
        DescribeRequest::Providers { filter } => DescribeRequest::Providers {
            filter: combine(filter),
        },
        DescribeRequest::All { filter } => DescribeRequest::All {
            filter: combine(filter),
        },
        other => other,
    }
}

fn describe_view(view: &ProviderView, request: &DescribeRequest) -> Option<Value> {
    match request {
        DescribeRequest::Provider { .. } => Some(view.describe_json()),
        DescribeRequest::Services { .. } => Some(json!(view.service_names())),
        DescribeRequest::Service { service, .. } => Some(view.service(service)?.describe_json()),
        DescribeRequest::Resources { service, .. } => {
            Some(json!(view.service(service)?.resource_names()))
        }
        DescribeRequest::Resource {
            service, resource, ..
        } => Some(view.resource(service, resource)?.describe_json()),
        DescribeRequest::Providers { .. } | DescribeRequest::All { .. } => None,
    }
}

impl GatewayRuntime {
    /// Listing or description wrapped in its response envelope.
    ///
    /// An `ldap` filtering definition narrows provider listings before they
    /// are built; any other type names a post filter run on the result.
    #[instrument(skip_all, fields(uri = %request.uri(), local_id = session.local_id()))]
    pub async fn describe(
        &self,
        session: &Session,
        request: DescribeRequest,
        filtering: Option<FilteringDefinition>,
    ) -> AccessMethodResponse {
        let response_type = request.response_type();
        let uri = request.uri();
        let (request, post_filter) = match &filtering {
            Some(definition) if definition.is_ldap() => {
                (with_ldap(request, &definition.filter), None)
            }
            other => (request, other.clone()),
        };

        let result = match self.fragment(session, &request).await {
            Fragment::Found(value) => value,
            Fragment::NotFound => {
                return AccessMethodResponse::not_found(response_type, uri).with_filter(filtering);
            }
            Fragment::Failed(GatewayError::Upstream(reason)) => {
                return AccessMethodResponse::error(
                    response_type,
                    uri,
                    status::UPSTREAM_UNAVAILABLE,
                    reason,
                )
                .with_filter(filtering);
            }
            Fragment::Failed(error) => {
                warn!(error = %error, "description failed");
                return AccessMethodResponse::error(
                    response_type,
                    uri,
                    status::INTERNAL_ERROR,
                    error.to_string(),
                )
                .with_filter(filtering);
            }
        };

        let result = match &post_filter {
            Some(definition) => match self.inner.post_filters.apply(definition, result) {
                Ok(filtered) => filtered,
                Err(error) => {
                    warn!(error = ?error, "post filter failed");
                    return AccessMethodResponse::internal_error(response_type, uri)
                        .with_filter(filtering);
                }
            },
            None => result,
        };
        AccessMethodResponse::ok(response_type, uri, result).with_filter(filtering)
    }

    /// Unwrapped answer to `request` as seen by `session`. Local sessions
    /// also reach connected remote cores; peer sessions never do.
    pub(crate) async fn fragment(&self, session: &Session, request: &DescribeRequest) -> Fragment {
        match request {
            DescribeRequest::Providers { filter } | DescribeRequest::All { filter } => {
                self.listing(session, request, filter.as_deref()).await
            }
            _ => self.element(session, request).await,
        }
    }

    fn present(&self, session: &Session, view: ProviderView) -> ProviderView {
        if session.is_local() {
            view
        } else {
            view.qualified(&self.inner.config.namespace)
        }
    }

    async fn listing(
        &self,
        session: &Session,
        request: &DescribeRequest,
        filter: Option<&str>,
    ) -> Fragment {
        let tree = session.tree();
        let views = match self.inner.registry.providers(&tree, filter) {
            Ok(views) => views,
            Err(error) => return Fragment::Failed(error),
        };
        let complete = matches!(request, DescribeRequest::All { .. });
        let mut entries: Vec<Value> = views
            .into_iter()
            .map(|view| {
                let view = self.present(session, view);
                if complete {
                    view.complete_json()
                } else {
                    json!(view.name)
                }
            })
            .collect();

        if session.is_local() {
            let cores = self.inner.federation.connected();
            let key = session.public_key();
            let answers = join_all(
                cores
                    .iter()
                    .map(|core| core.endpoint().describe(key, request)),
            )
            .await;
            for (core, answer) in cores.iter().zip(answers) {
                match answer {
                    Ok(Some(Value::Array(remote))) => entries.extend(remote),
                    Ok(Some(other)) => warn!(
                        local_id = core.local_id(),
                        fragment = %other,
                        "remote listing is not an array"
                    ),
                    Ok(None) => {}
                    Err(error) => warn!(
                        local_id = core.local_id(),
                        error = %error,
                        "remote listing failed"
                    ),
                }
            }
        }
        debug!(entries = entries.len(), "listing built");
        Fragment::Found(Value::Array(entries))
    }

    async fn element(&self, session: &Session, request: &DescribeRequest) -> Fragment {
        let Some(provider) = request.provider() else {
            return Fragment::NotFound;
        };
        let tree = session.tree();
        if let Some(view) = self.inner.registry.provider(&tree, provider) {
            let view = self.present(session, view);
            return describe_view(&view, request).map_or(Fragment::NotFound, Fragment::Found);
        }
        if !session.is_local() {
            return Fragment::NotFound;
        }
        let Some(core) = self.inner.federation.route(provider) else {
            return Fragment::NotFound;
        };
        match core
            .endpoint()
            .describe(session.public_key(), &request.localized())
            .await
        {
            Ok(Some(value)) => Fragment::Found(value),
            Ok(None) => Fragment::NotFound,
            Err(error) => {
                warn!(local_id = core.local_id(), error = %error, "remote description failed");
                Fragment::Failed(GatewayError::Upstream(error.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;

    impl PostFilter for Uppercase {
        fn handles(&self, filter_type: &str) -> bool {
            filter_type == "upper"
        }

        fn apply(&self, _definition: &str, result: Value) -> anyhow::Result<Value> {
            Ok(match result {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(text) => Value::String(text.to_uppercase()),
                            other => other,
                        })
                        .collect(),
                ),
                other => other,
            })
        }
    }

    #[test]
    fn post_filters_are_selected_by_type() -> anyhow::Result<()> {
        let registry = PostFilterRegistry::default();
        registry.register(Arc::new(Uppercase));
        assert_eq!(registry.len(), 1);

        let filtered = registry.apply(&FilteringDefinition::new("upper", ""), json!(["foo"]))?;
        assert_eq!(filtered, json!(["FOO"]));
        let untouched = registry.apply(&FilteringDefinition::new("other", ""), json!(["foo"]))?;
        assert_eq!(untouched, json!(["foo"]));
        Ok(())
    }

    #[test]
    fn ldap_definitions_narrow_listings_only() {
        let narrowed = with_ldap(
            DescribeRequest::Providers {
                filter: Some("(name=F*)".to_owned()),
            },
            "(location=*)",
        );
        assert_eq!(
            narrowed,
            DescribeRequest::Providers {
                filter: Some("(&(name=F*)(location=*))".to_owned())
            }
        );
        assert_eq!(
            with_ldap(DescribeRequest::All { filter: None }, "(name=Foo)"),
            DescribeRequest::All {
                filter: Some("(name=Foo)".to_owned())
            }
        );
        let targeted = DescribeRequest::Provider {
            provider: "Foo".to_owned(),
        };
        assert_eq!(with_ldap(targeted.clone(), "(name=Foo)"), targeted);
    }
}
