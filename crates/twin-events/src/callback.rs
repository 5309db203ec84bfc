use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use twin_protocol::{ErrorPolicy, Recipient, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Active,
    /// The recipient failed at least once.
    Error,
}

/// One subscriber attached to a filter.
#[derive(Clone)]
pub struct SnaCallback {
    pub id: SubscriptionId,
    pub recipient: Arc<dyn Recipient>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_policy: ErrorPolicy,
    pub status: CallbackStatus,
}

impl SnaCallback {
    pub fn new(id: SubscriptionId, recipient: Arc<dyn Recipient>) -> Self {
        Self {
            id,
            recipient,
            expires_at: None,
            error_policy: ErrorPolicy::default(),
            status: CallbackStatus::Active,
        }
    }

    pub fn expires_at(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.expires_at = deadline;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Expired, or failed under the [`ErrorPolicy::Remove`] policy.
    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now)
            || (self.status == CallbackStatus::Error && self.error_policy == ErrorPolicy::Remove)
    }
}

impl fmt::Debug for SnaCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnaCallback")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .field("error_policy", &self.error_policy)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
