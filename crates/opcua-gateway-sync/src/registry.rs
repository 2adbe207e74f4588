//! `device/control` to node mapping.
//!
//! A single mutex guards the mapping. The materializer keeps the same lock
//! across address-space browse-then-create sequences, so the map and the
//! address space never disagree about which keys are materialized.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, MutexGuard};

use opcua_gateway_core::address_space::{AccessLevel, DataType, NodeId};
use opcua_gateway_core::bus::ControlHandle;
use opcua_gateway_core::key::NodeKey;

/// A materialized variable node bound to its control.
#[derive(Clone)]
pub struct NodeEntry {
    pub key: NodeKey,
    pub control: ControlHandle,
    pub data_type: DataType,
    pub access_level: AccessLevel,
}

impl NodeEntry {
    pub fn node_id(&self) -> NodeId {
        crate::materializer::leaf_node_id(&self.key)
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("key", &self.key)
            .field("data_type", &self.data_type)
            .field("access_level", &self.access_level)
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct RegistryState {
    entries: HashMap<NodeKey, NodeEntry>,
    /// Nodes created for configured controls that were absent at the time.
    declared: HashSet<NodeKey>,
}

impl RegistryState {
    pub(crate) fn exists(&self, key: &NodeKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert unless `key` is already present. Returns `true` if inserted.
    pub(crate) fn insert(&mut self, entry: NodeEntry) -> bool {
        if self.entries.contains_key(&entry.key) {
            return false;
        }
        self.declared.remove(&entry.key);
        self.entries.insert(entry.key.clone(), entry);
        true
    }

    pub(crate) fn declare(&mut self, key: NodeKey) {
        if !self.entries.contains_key(&key) {
            self.declared.insert(key);
        }
    }

    pub(crate) fn is_declared(&self, key: &NodeKey) -> bool {
        self.declared.contains(key)
    }
}

/// Process-wide mapping from [`NodeKey`] to [`NodeEntry`]. Only grows.
#[derive(Default)]
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, key: &NodeKey) -> bool {
        self.state.lock().exists(key)
    }

    /// Idempotent insert. Returns `false` if the key was already mapped.
    pub fn insert(&self, entry: NodeEntry) -> bool {
        self.state.lock().insert(entry)
    }

    pub fn lookup(&self, key: &NodeKey) -> Option<ControlHandle> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.control.clone())
    }

    pub fn entry(&self, key: &NodeKey) -> Option<NodeEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// True if a node exists for `key` but no control is bound to it yet.
    pub fn is_declared(&self, key: &NodeKey) -> bool {
        self.state.lock().is_declared(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self.state.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }
}
