use serde::{Deserialize, Serialize};

use crate::constraint::Constraint;
use crate::message::{MessageType, SnaMessage};
use crate::uri;

/// Predicate over [`SnaMessage`]s: sender path prefix, accepted message
/// types (empty accepts every type) and an optional value constraint applied
/// to UPDATE messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnaFilter {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
}

impl SnaFilter {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            types: Vec::new(),
            constraint: None,
        }
    }

    /// Filter accepting every message.
    pub fn everything() -> Self {
        Self::new(uri::ROOT)
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = MessageType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn matches(&self, message: &SnaMessage) -> bool {
        if !uri::is_path_prefix(&self.sender, &message.path) {
            return false;
        }
        if !self.types.is_empty() && !self.types.contains(&message.message_type()) {
            return false;
        }
        match (&self.constraint, message.message_type()) {
            (Some(constraint), MessageType::Update) => {
                message.value().is_some_and(|value| constraint.complies(value))
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::constraint::{Condition, Operator};
    use crate::message::LifecycleEvent;

    #[test]
    fn matches_on_sender_prefix_and_type() {
        let filter = SnaFilter::new("/Foo").with_types([MessageType::Update]);
        assert!(filter.matches(&SnaMessage::update("/Foo/data/value", json!(1))));
        assert!(!filter.matches(&SnaMessage::update("/Bar/data/value", json!(1))));
        assert!(!filter.matches(&SnaMessage::lifecycle(
            LifecycleEvent::ProviderAppearing,
            "/Foo"
        )));
        assert!(SnaFilter::everything().matches(&SnaMessage::error("/Bar", "boom")));
    }

    #[test]
    fn constraint_applies_to_update_values_only() {
        let filter = SnaFilter::new("/Foo").with_constraint(Constraint::new(vec![
            Condition::new(Operator::GreaterOrEqual, 10),
        ]));
        assert!(filter.matches(&SnaMessage::update("/Foo/data/value", json!(12))));
        assert!(!filter.matches(&SnaMessage::update("/Foo/data/value", json!(3))));
        assert!(filter.matches(&SnaMessage::lifecycle(
            LifecycleEvent::ResourceAppearing,
            "/Foo/data/value"
        )));
    }
}
