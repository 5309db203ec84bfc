use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation a client can invoke on a model element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMethod {
    Get,
    Set,
    Act,
    Subscribe,
    Unsubscribe,
    Describe,
}

impl AccessMethod {
    pub const ALL: [AccessMethod; 6] = [
        AccessMethod::Get,
        AccessMethod::Set,
        AccessMethod::Act,
        AccessMethod::Subscribe,
        AccessMethod::Unsubscribe,
        AccessMethod::Describe,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Act => "ACT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Describe => "DESCRIBE",
        }
    }
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered access levels. A method is accessible when the level granted by
/// an identity's access tree is at least the level the element requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessLevel {
    Anonymous = 0,
    Authenticated = 1,
    Admin = 2,
    Owner = 3,
}

impl AccessLevel {
    pub fn allows(self, required: AccessLevel) -> bool {
        self >= required
    }
}

/// Whether one method is accessible on one path for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAccessibility {
    pub method: AccessMethod,
    pub accessible: bool,
}

impl MethodAccessibility {
    pub fn lookup(set: &[MethodAccessibility], method: AccessMethod) -> bool {
        set.iter()
            .find(|candidate| candidate.method == method)
            .is_some_and(|candidate| candidate.accessible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(AccessLevel::Owner.allows(AccessLevel::Admin));
        assert!(AccessLevel::Authenticated.allows(AccessLevel::Anonymous));
        assert!(!AccessLevel::Anonymous.allows(AccessLevel::Authenticated));
    }

    #[test]
    fn accessibility_lookup_defaults_to_denied() {
        let set = [MethodAccessibility {
            method: AccessMethod::Get,
            accessible: true,
        }];
        assert!(MethodAccessibility::lookup(&set, AccessMethod::Get));
        assert!(!MethodAccessibility::lookup(&set, AccessMethod::Set));
    }

    #[test]
    fn methods_serialize_uppercase() {
        assert_eq!(
            serde_json::to_string(&AccessMethod::Unsubscribe).unwrap(),
            "\"UNSUBSCRIBE\""
        );
    }
}
