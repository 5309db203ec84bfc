use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use twin_protocol::{Credentials, PublicKey};

use crate::access::AccessTree;

/// Turns credentials into the public key of the identity they prove.
pub trait AuthenticationService: Send + Sync {
    fn build_key(&self, credentials: &Credentials) -> Option<PublicKey>;
}

/// Resolves identities to their access trees.
pub trait SecuredAccess: Send + Sync {
    /// Tree bound to `key`; unknown keys get the anonymous tree.
    fn access_tree(&self, key: &PublicKey) -> Arc<AccessTree>;

    fn anonymous_tree(&self) -> Arc<AccessTree>;

    /// Public key of the application owning `private_key`.
    fn application_key(&self, private_key: &str) -> Option<PublicKey>;

    /// Public key under which the agent installed by `identity` runs.
    fn agent_key(&self, identity: &str) -> PublicKey;

    /// Replace the tree bound to `key`. Returns false if the key is unknown.
    fn update_access_tree(&self, key: &PublicKey, tree: AccessTree) -> bool;
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn derive_key(kind: &str, name: &str) -> PublicKey {
    PublicKey::from_string(digest(&format!("{kind}:{name}")))
}

#[derive(Debug, Clone)]
struct UserRecord {
    password_digest: String,
    key: PublicKey,
}

#[derive(Debug)]
struct SecurityState {
    users: HashMap<String, UserRecord>,
    applications: HashMap<String, PublicKey>,
    agents: HashMap<String, PublicKey>,
    trees: HashMap<PublicKey, Arc<AccessTree>>,
    anonymous: Arc<AccessTree>,
}

/// In-memory security subsystem: users, applications and agent identities,
/// each bound to an access tree.
#[derive(Debug)]
pub struct StaticSecuredAccess {
    state: RwLock<SecurityState>,
}

impl StaticSecuredAccess {
    pub fn new(anonymous: AccessTree) -> Self {
        Self {
            state: RwLock::new(SecurityState {
                users: HashMap::new(),
                applications: HashMap::new(),
                agents: HashMap::new(),
                trees: HashMap::new(),
                anonymous: Arc::new(anonymous),
            }),
        }
    }

    pub fn add_user(&self, login: &str, password: &str, tree: AccessTree) -> PublicKey {
        let key = derive_key("user", login);
        let mut state = self.state.write();
        state.users.insert(
            login.to_owned(),
            UserRecord {
                password_digest: digest(password),
                key: key.clone(),
            },
        );
        state.trees.insert(key.clone(), Arc::new(tree));
        info!(login, public_key = %key, "user registered");
        key
    }

    pub fn add_application(&self, private_key: &str, tree: AccessTree) -> PublicKey {
        let key = derive_key("application", private_key);
        let mut state = self.state.write();
        state.applications.insert(private_key.to_owned(), key.clone());
        state.trees.insert(key.clone(), Arc::new(tree));
        info!(public_key = %key, "application registered");
        key
    }

    pub fn add_agent_identity(&self, identity: &str, tree: AccessTree) -> PublicKey {
        let key = derive_key("agent", identity);
        let mut state = self.state.write();
        state.agents.insert(identity.to_owned(), key.clone());
        state.trees.insert(key.clone(), Arc::new(tree));
        info!(identity, public_key = %key, "agent identity registered");
        key
    }
}

impl Default for StaticSecuredAccess {
    fn default() -> Self {
        Self::new(AccessTree::anonymous())
    }
}

impl AuthenticationService for StaticSecuredAccess {
    fn build_key(&self, credentials: &Credentials) -> Option<PublicKey> {
        let state = self.state.read();
        let record = state.users.get(&credentials.login)?;
        if record.password_digest != digest(&credentials.password) {
            debug!(login = %credentials.login, "password mismatch");
            return None;
        }
        Some(record.key.clone())
    }
}

impl SecuredAccess for StaticSecuredAccess {
    fn access_tree(&self, key: &PublicKey) -> Arc<AccessTree> {
        let state = self.state.read();
        state
            .trees
            .get(key)
            .cloned()
            .unwrap_or_else(|| state.anonymous.clone())
    }

    fn anonymous_tree(&self) -> Arc<AccessTree> {
        self.state.read().anonymous.clone()
    }

    fn application_key(&self, private_key: &str) -> Option<PublicKey> {
        self.state.read().applications.get(private_key).cloned()
    }

    fn agent_key(&self, identity: &str) -> PublicKey {
        self.state
            .read()
            .agents
            .get(identity)
            .cloned()
            .unwrap_or_else(|| derive_key("agent", identity))
    }

    fn update_access_tree(&self, key: &PublicKey, tree: AccessTree) -> bool {
        let mut state = self.state.write();
        match state.trees.get_mut(key) {
            Some(slot) => {
                *slot = Arc::new(tree);
                info!(public_key = %key, "access tree replaced");
                true
            }
            None => false,
        }
    }
}
