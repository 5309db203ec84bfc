//! Session registry: every open session, indexed by token and by the
//! (public key, local id) identity that owns it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::debug;
use twin_policy::AccessTree;
use twin_protocol::{PublicKey, SessionToken};
use uuid::Uuid;

/// Local id of sessions opened by clients of this gateway. Sessions opened
/// on behalf of a peer carry the peer's remote core id instead.
pub const LOCAL_ID: u32 = 0;

/// Source of candidate session tokens.
pub trait TokenGenerator: Send + Sync {
    fn next_token(&self) -> SessionToken;
}

/// Hex SHA-256 digest of a random UUID and the current time.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokens;

impl TokenGenerator for RandomTokens {
    fn next_token(&self) -> SessionToken {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        hasher.update(
            chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes(),
        );
        SessionToken::from_string(hex::encode(hasher.finalize()))
    }
}

/// An authenticated or anonymous conversation with the gateway.
pub struct Session {
    token: SessionToken,
    public_key: PublicKey,
    local_id: u32,
    tree: RwLock<Arc<AccessTree>>,
}

impl Session {
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Opened by a local client rather than by a peer gateway.
    pub fn is_local(&self) -> bool {
        self.local_id == LOCAL_ID
    }

    pub fn tree(&self) -> Arc<AccessTree> {
        self.tree.read().clone()
    }

    fn refresh(&self, tree: Arc<AccessTree>) {
        *self.tree.write() = tree;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("public_key", &self.public_key)
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct SessionIndex {
    by_token: HashMap<SessionToken, Arc<Session>>,
    by_key: HashMap<(PublicKey, u32), SessionToken>,
}

/// Both indexes live under one lock so they never disagree.
pub struct SessionRegistry {
    index: Mutex<SessionIndex>,
    tokens: Arc<dyn TokenGenerator>,
}

impl SessionRegistry {
    pub fn new(tokens: Arc<dyn TokenGenerator>) -> Self {
        Self {
            index: Mutex::new(SessionIndex::default()),
            tokens,
        }
    }

    /// Session already bound to `key` and `local_id`, or a new one built
    /// with `tree`.
    pub fn open(
        &self,
        key: PublicKey,
        local_id: u32,
        tree: impl FnOnce() -> Arc<AccessTree>,
    ) -> Arc<Session> {
        let mut index = self.index.lock();
        if let Some(session) = index
            .by_key
            .get(&(key.clone(), local_id))
            .and_then(|token| index.by_token.get(token))
        {
            return session.clone();
        }

        let token = loop {
            let candidate = self.tokens.next_token();
            if !index.by_token.contains_key(&candidate) {
                break candidate;
            }
            debug!("session token collision, drawing another");
        };
        let session = Arc::new(Session {
            token: token.clone(),
            public_key: key.clone(),
            local_id,
            tree: RwLock::new(tree()),
        });
        index.by_key.insert((key, local_id), token.clone());
        index.by_token.insert(token, session.clone());
        debug!(public_key = %session.public_key, local_id, "session opened");
        session
    }

    pub fn get(&self, token: &SessionToken) -> Option<Arc<Session>> {
        self.index.lock().by_token.get(token).cloned()
    }

    pub fn by_key(&self, key: &PublicKey, local_id: u32) -> Option<Arc<Session>> {
        let index = self.index.lock();
        index
            .by_key
            .get(&(key.clone(), local_id))
            .and_then(|token| index.by_token.get(token))
            .cloned()
    }

    pub fn remove(&self, token: &SessionToken) -> Option<Arc<Session>> {
        let mut index = self.index.lock();
        let session = index.by_token.remove(token)?;
        index
            .by_key
            .remove(&(session.public_key.clone(), session.local_id));
        debug!(public_key = %session.public_key, "session closed");
        Some(session)
    }

    /// Install `tree` on every session owned by `key`; returns how many
    /// sessions were refreshed.
    pub fn refresh_tree(&self, key: &PublicKey, tree: Arc<AccessTree>) -> usize {
        let index = self.index.lock();
        let mut refreshed = 0;
        for session in index.by_token.values().filter(|s| s.public_key == *key) {
            session.refresh(tree.clone());
            refreshed += 1;
        }
        refreshed
    }

    pub fn len(&self) -> usize {
        self.index.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
