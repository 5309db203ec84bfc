//! Access method dispatch: resolve the target resource through the
//! session's access tree, check the method against the resource type and
//! the granted methods, then run it locally or on the owning remote core.

use serde_json::json;
use tracing::{debug, info, instrument, warn};
use twin_events::SnaCallback;
use twin_protocol::{
    AccessMethod, AccessMethodResponse, Constraint, GatewayError, Invocation, MessageType,
    MethodCall, ResourcePath, SnaFilter, SubscribeRequest, SubscriptionId, status, uri,
};
use twin_registry::{ResourceType, ResourceView};

use crate::GatewayRuntime;
use crate::sessions::Session;

fn supports(resource_type: ResourceType, method: AccessMethod) -> bool {
    match resource_type {
        ResourceType::Data => method != AccessMethod::Act,
        ResourceType::Action => matches!(method, AccessMethod::Act | AccessMethod::Describe),
    }
}

/// Envelope for a failed registry operation on a resolved resource.
fn failure(method: AccessMethod, uri: String, error: GatewayError) -> AccessMethodResponse {
    match error {
        GatewayError::NotFound(_) => AccessMethodResponse::not_found(method, uri),
        error => {
            warn!(error = %error, "access method failed");
            AccessMethodResponse::internal_error(method, uri)
        }
    }
}

impl GatewayRuntime {
    /// Run `invocation` on behalf of `session`. Every outcome, including a
    /// missing resource or an unreachable peer, is a response envelope.
    #[instrument(
        skip_all,
        fields(
            method = %invocation.method(),
            path = %invocation.path,
            local_id = session.local_id(),
        )
    )]
    pub async fn execute(&self, session: &Session, invocation: Invocation) -> AccessMethodResponse {
        let request_id = invocation.request_id.clone();
        let resolved = self
            .inner
            .registry
            .resolve(&session.tree(), &invocation.path);
        let response = match resolved {
            Some(view) => self.invoke_local(session, &view, invocation),
            None if session.is_local() => self.invoke_remote(session, invocation).await,
            None => {
                let uri = self.response_uri(session, &invocation.path, invocation.call.attribute());
                AccessMethodResponse::not_found(invocation.method(), uri)
            }
        };
        debug!(status_code = response.status_code, "access method dispatched");
        response.with_request_id(request_id)
    }

    /// URI reported back to `session`: namespace-qualified for peers.
    fn response_uri(
        &self,
        session: &Session,
        path: &ResourcePath,
        attribute: Option<&str>,
    ) -> String {
        let path = if session.is_local() {
            path.uri()
        } else {
            path.qualified(&self.inner.config.namespace).uri()
        };
        match attribute {
            Some(attribute) => uri::uri([path.as_str(), attribute]),
            None => path,
        }
    }

    fn invoke_local(
        &self,
        session: &Session,
        view: &ResourceView,
        invocation: Invocation,
    ) -> AccessMethodResponse {
        let method = invocation.method();
        let uri = self.response_uri(session, &invocation.path, invocation.call.attribute());
        if !supports(view.resource_type, method) {
            return AccessMethodResponse::unknown_method(method, uri);
        }
        if !view.allows(method) {
            debug!("method not granted");
            return AccessMethodResponse::forbidden(method, uri);
        }

        let registry = &self.inner.registry;
        let path = &invocation.path;
        match invocation.call {
            MethodCall::Get { attribute } => match registry.get(path, attribute.as_deref()) {
                Ok(reading) => AccessMethodResponse::ok(method, uri, reading.to_json()),
                Err(error) => failure(method, uri, error),
            },
            MethodCall::Set { attribute, value } => {
                match registry.set(path, attribute.as_deref(), value) {
                    Ok(reading) => AccessMethodResponse::ok(method, uri, reading.to_json()),
                    Err(error) => failure(method, uri, error),
                }
            }
            MethodCall::Act { arguments } => match registry.act(path, &arguments) {
                Ok(result) => AccessMethodResponse::ok(method, uri, result),
                Err(error) => failure(method, uri, error),
            },
            MethodCall::Subscribe(request) => self.subscribe(path, uri, request),
            MethodCall::Unsubscribe { subscription_id } => {
                // Only subscriptions held by the named resource are cancelled.
                let removed = registry.remove_subscription(path, &subscription_id);
                if removed {
                    self.inner.engine.delete_callback(&subscription_id);
                }
                debug!(subscription_id = %subscription_id, removed, "unsubscribed");
                let payload = json!({ "subscriptionId": subscription_id });
                AccessMethodResponse::ok(method, uri, payload)
            }
            MethodCall::Describe => AccessMethodResponse::ok(method, uri, view.describe_json()),
        }
    }

    fn subscribe(
        &self,
        path: &ResourcePath,
        uri: String,
        request: SubscribeRequest,
    ) -> AccessMethodResponse {
        let mut filter = SnaFilter::new(path.uri()).with_types([MessageType::Update]);
        if let Some(definition) = &request.constraint {
            match Constraint::parse(definition) {
                Ok(constraint) => filter = filter.with_constraint(constraint),
                Err(error) => warn!(error = %error, "subscribing without the invalid constraint"),
            }
        }

        let id = SubscriptionId::generate();
        if let Err(error) = self.inner.registry.add_subscription(path, id.clone()) {
            return failure(AccessMethod::Subscribe, uri, error);
        }
        self.inner.engine.add_callback(
            filter,
            SnaCallback::new(id.clone(), request.recipient)
                .expires_at(request.expires_at)
                .error_policy(request.error_policy),
        );
        info!(subscription_id = %id, "subscription installed");
        AccessMethodResponse::ok(AccessMethod::Subscribe, uri, json!({ "subscriptionId": id }))
    }

    async fn invoke_remote(
        &self,
        session: &Session,
        invocation: Invocation,
    ) -> AccessMethodResponse {
        let method = invocation.method();
        let uri = self.response_uri(session, &invocation.path, invocation.call.attribute());
        let Some(core) = self.inner.federation.route(&invocation.path.provider) else {
            return AccessMethodResponse::not_found(method, uri);
        };
        match core
            .endpoint()
            .invoke(session.public_key(), &invocation.localized())
            .await
        {
            Ok(Some(response)) => response,
            Ok(None) => AccessMethodResponse::error(
                method,
                uri,
                status::NOT_FOUND,
                format!("provider '{}' not found", invocation.path.provider),
            ),
            Err(error) => {
                warn!(local_id = core.local_id(), error = %error, "remote core unavailable");
                let message = error.to_string();
                AccessMethodResponse::error(method, uri, status::UPSTREAM_UNAVAILABLE, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_types_restrict_methods() {
        for method in AccessMethod::ALL {
            assert_eq!(supports(ResourceType::Data, method), method != AccessMethod::Act);
        }
        assert!(supports(ResourceType::Action, AccessMethod::Act));
        assert!(supports(ResourceType::Action, AccessMethod::Describe));
        assert!(!supports(ResourceType::Action, AccessMethod::Get));
        assert!(!supports(ResourceType::Action, AccessMethod::Subscribe));
    }

    #[test]
    fn registry_failures_map_to_statuses() {
        let missing = failure(
            AccessMethod::Get,
            "/Foo/data/value/unit".to_owned(),
            GatewayError::NotFound("/Foo/data/value/unit".to_owned()),
        );
        assert_eq!(missing.status_code, status::NOT_FOUND);
        assert_eq!(missing.error_message(), Some("Resource /Foo/data/value/unit not found"));

        let broken = failure(
            AccessMethod::Act,
            "/Foo/control/double".to_owned(),
            GatewayError::ActionFailed("boom".to_owned()),
        );
        assert_eq!(broken.status_code, status::INTERNAL_ERROR);
        assert_eq!(broken.error_message(), Some("Internal server error"));
    }
}
