//! The registry is the single process-wide source of truth for what
//! Morpheus believes it has provisioned. Every mutation is persisted
//! before the call returns, so a crash immediately after a successful
//! call never loses that call's effect.

#![forbid(unsafe_code)]

use morpheus_core::{Forest, ForestStatus, MorpheusError, MorpheusResult, Node, NodeStatus, RegistrySnapshot};
use morpheus_persist::{JsonStore, StoreLock};
use parking_lot::Mutex;
use std::path::Path;

pub struct Registry {
    store: JsonStore,
    snapshot: Mutex<RegistrySnapshot>,
    _lock: StoreLock,
}

impl Registry {
    /// Loads existing state from the registry file at `path` (or starts
    /// empty if none exists yet). `path` is the exact file to read and
    /// write, not a directory — see `MorpheusConfig::resolved_registry_path`.
    ///
    /// Holds an advisory exclusive lock on `path` for as long as the
    /// returned `Registry` lives, so a second concurrent Morpheus process
    /// fails fast here instead of racing this one's load-mutate-save cycle.
    pub fn open(path: impl AsRef<Path>) -> MorpheusResult<Self> {
        let store = JsonStore::at_path(path.as_ref().to_path_buf());
        let lock = StoreLock::acquire(&store)
            .map_err(|e| MorpheusError::RegistryIO(format!("another morpheus process holds the registry lock: {e}")))?;
        let snapshot: RegistrySnapshot = store.load();
        Ok(Self {
            store,
            snapshot: Mutex::new(snapshot),
            _lock: lock,
        })
    }

    pub fn register_forest(&self, forest: Forest) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        if guard.forests.contains_key(&forest.id) {
            return Err(MorpheusError::Other(format!("forest already registered: {}", forest.id)));
        }
        guard.forests.insert(forest.id.clone(), forest);
        self.persist(&guard)
    }

    pub fn register_node(&self, node: Node) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        if guard.nodes.contains_key(&node.id) {
            return Err(MorpheusError::Other(format!("node already registered: {}", node.id)));
        }
        if !guard.forests.contains_key(&node.forest_id) {
            return Err(MorpheusError::Other(format!("unknown forest: {}", node.forest_id)));
        }
        guard.nodes.insert(node.id.clone(), node);
        self.persist(&guard)
    }

    pub fn update_forest_status(&self, forest_id: &str, status: ForestStatus) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        let forest = guard
            .forests
            .get_mut(forest_id)
            .ok_or_else(|| MorpheusError::Other(format!("unknown forest: {forest_id}")))?;
        forest.status = status;
        self.persist(&guard)
    }

    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        let node = guard
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MorpheusError::Other(format!("unknown node: {node_id}")))?;
        node.status = status;
        self.persist(&guard)
    }

    pub fn update_node_addresses(&self, node_id: &str, ipv4: String, ipv6: String) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        let node = guard
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MorpheusError::Other(format!("unknown node: {node_id}")))?;
        node.ipv4 = ipv4;
        node.ipv6 = ipv6;
        self.persist(&guard)
    }

    /// Records a free-form key/value on a node without otherwise touching
    /// its state. Used for surfacing non-fatal warnings (e.g. DNS
    /// registration failure) that shouldn't fail the node itself.
    pub fn set_node_metadata(&self, node_id: &str, key: &str, value: String) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        let node = guard
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MorpheusError::Other(format!("unknown node: {node_id}")))?;
        node.metadata.insert(key.to_string(), value);
        self.persist(&guard)
    }

    pub fn update_forest_node_count(&self, forest_id: &str, node_count: u32) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        let forest = guard
            .forests
            .get_mut(forest_id)
            .ok_or_else(|| MorpheusError::Other(format!("unknown forest: {forest_id}")))?;
        forest.node_count = node_count;
        self.persist(&guard)
    }

    pub fn get_forest(&self, forest_id: &str) -> Option<Forest> {
        self.snapshot.lock().forests.get(forest_id).cloned()
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.snapshot.lock().nodes.get(node_id).cloned()
    }

    pub fn list_forests(&self) -> Vec<Forest> {
        self.snapshot.lock().forests.values().cloned().collect()
    }

    pub fn nodes_in_forest(&self, forest_id: &str) -> Vec<Node> {
        self.snapshot
            .lock()
            .nodes
            .values()
            .filter(|n| n.forest_id == forest_id)
            .cloned()
            .collect()
    }

    /// Removes a forest and every node that belongs to it. Used once
    /// teardown has succeeded for all of a forest's nodes.
    pub fn delete_forest(&self, forest_id: &str) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        guard.forests.remove(forest_id);
        guard.nodes.retain(|_, n| n.forest_id != forest_id);
        self.persist(&guard)
    }

    pub fn remove_node(&self, node_id: &str) -> MorpheusResult<()> {
        let mut guard = self.snapshot.lock();
        guard.nodes.remove(node_id);
        self.persist(&guard)
    }

    fn persist(&self, snapshot: &RegistrySnapshot) -> MorpheusResult<()> {
        self.store
            .save(snapshot)
            .map_err(|e| MorpheusError::RegistryIO(e.to_string()))
    }
}
