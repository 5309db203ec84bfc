//! Canonical ID types for the twin gateway.
//!
//! IDs are opaque String wrappers (serde-transparent). Session tokens and
//! public keys are produced by the session registry and the security
//! subsystem; the gateway only requires String.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Opaque token identifying a client session.
    SessionToken
);
typed_id!(
    /// Public key of an identity (user, application, agent or peer).
    PublicKey
);
typed_id!(
    /// Identifier of a resource subscription, returned by SUBSCRIBE.
    SubscriptionId
);
typed_id!(
    /// Identifier of a long-lived agent registered on the message stream.
    AgentId
);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(format!("subscription_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl AgentId {
    pub fn generate() -> Self {
        Self(format!("agent_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl PublicKey {
    /// Key given to the n-th anonymous identity of this gateway.
    pub fn anonymous(index: u32) -> Self {
        Self(format!("anonymous_{index}"))
    }

    /// Key standing for an anonymous identity of the peer bound to `local_id`.
    pub fn remote_anonymous(local_id: u32) -> Self {
        Self(format!("anonymous_R{local_id}"))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with("anonymous_")
    }
}
