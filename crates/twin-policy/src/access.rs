use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use twin_protocol::uri;
use twin_protocol::{AccessLevel, AccessMethod, MethodAccessibility};

/// One node of an [`AccessTree`]: levels granted per method on this path,
/// and the mapped children below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    levels: BTreeMap<AccessMethod, AccessLevel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, AccessNode>,
}

impl AccessNode {
    pub fn level(&self, method: AccessMethod) -> Option<AccessLevel> {
        self.levels.get(&method).copied()
    }

    pub fn child(&self, segment: &str) -> Option<&AccessNode> {
        self.children.get(segment)
    }

    fn child_mut(&mut self, segment: &str) -> &mut AccessNode {
        self.children.entry(segment.to_owned()).or_default()
    }
}

/// Per-identity permission structure over the provider/service/resource/
/// attribute namespace.
///
/// The root carries a level for every method. A lookup walks the path and
/// keeps the level of the nearest mapped ancestor, so unmapped paths fall
/// back to the root defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTree {
    root: AccessNode,
    #[serde(default)]
    mutable: bool,
}

impl AccessTree {
    /// Tree granting `default` for every method everywhere.
    pub fn new(default: AccessLevel) -> Self {
        let mut root = AccessNode::default();
        for method in AccessMethod::ALL {
            root.levels.insert(method, default);
        }
        Self {
            root,
            mutable: false,
        }
    }

    /// Tree shared by anonymous identities.
    pub fn anonymous() -> Self {
        Self::new(AccessLevel::Anonymous)
    }

    /// Grant `level` for every method on `path` and below.
    pub fn grant(mut self, path: &str, level: AccessLevel) -> Self {
        let node = self.node_mut(path);
        for method in AccessMethod::ALL {
            node.levels.insert(method, level);
        }
        self
    }

    /// Grant `level` for one method on `path` and below.
    pub fn grant_method(mut self, path: &str, method: AccessMethod, level: AccessLevel) -> Self {
        self.node_mut(path).levels.insert(method, level);
        self
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn root(&self) -> &AccessNode {
        &self.root
    }

    /// Level granted for `method` on `path`.
    pub fn level(&self, path: &str, method: AccessMethod) -> AccessLevel {
        let mut granted = self.root.level(method).unwrap_or(AccessLevel::Anonymous);
        let mut node = &self.root;
        for segment in uri::segments(path) {
            match node.child(segment) {
                Some(child) => {
                    node = child;
                    if let Some(level) = node.level(method) {
                        granted = level;
                    }
                }
                None => break,
            }
        }
        granted
    }

    pub fn is_accessible(&self, path: &str, method: AccessMethod, required: AccessLevel) -> bool {
        self.level(path, method).allows(required)
    }

    /// Accessibility of every method on `path`, given the level each method
    /// requires there.
    pub fn accessibility(
        &self,
        path: &str,
        required: impl Fn(AccessMethod) -> AccessLevel,
    ) -> Vec<MethodAccessibility> {
        AccessMethod::ALL
            .into_iter()
            .map(|method| MethodAccessibility {
                method,
                accessible: self.is_accessible(path, method, required(method)),
            })
            .collect()
    }

    fn node_mut(&mut self, path: &str) -> &mut AccessNode {
        let mut node = &mut self.root;
        for segment in uri::segments(path) {
            node = node.child_mut(segment);
        }
        node
    }
}

impl Default for AccessTree {
    fn default() -> Self {
        Self::anonymous()
    }
}
