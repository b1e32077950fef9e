//! Registry of known peers: one client per node name, owned by the daemon
//! and mutated only through these accessors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::net::client::PeerClient;

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<dyn PeerClient>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, name: &str) -> Option<Arc<dyn PeerClient>> {
        self.nodes
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Register a client under `name`, replacing any existing entry. Used by
    /// paths that intentionally re-bind (tunnel re-establishment, dial).
    pub fn set_node(&self, name: impl Into<String>, client: Arc<dyn PeerClient>) {
        self.nodes
            .write()
            .expect("registry lock poisoned")
            .insert(name.into(), client);
    }

    /// Register only if `name` is unknown: the first registration wins, so
    /// re-marking an already-known node is an idempotent no-op. Returns
    /// whether the client was inserted.
    pub fn set_node_if_absent(&self, name: &str, client: Arc<dyn PeerClient>) -> bool {
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        if nodes.contains_key(name) {
            return false;
        }
        nodes.insert(name.to_string(), client);
        true
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn PeerClient>> {
        self.nodes
            .write()
            .expect("registry lock poisoned")
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First public peer that can serve as a relay, if any.
    pub fn first_public(&self) -> Option<Arc<dyn PeerClient>> {
        let nodes = self.nodes.read().expect("registry lock poisoned");
        let mut names: Vec<&String> = nodes.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| nodes[n].clone())
            .find(|c| c.is_public())
    }
}
