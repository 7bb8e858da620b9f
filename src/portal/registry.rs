//! Node Registry
//!
//! The single source of truth for which nodes exist. Writes come only from
//! registration; publish and upgrade read snapshots of the ready nodes. The table is never
//! handed out, only copies of its entries.

use super::types::RegisteredNode;
use crate::task::types::{NodeId, now_ms};

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct RegistryInner {
    /// Node ids in registration order.
    order: Vec<NodeId>,
    nodes: HashMap<NodeId, RegisteredNode>,
}

#[derive(Default)]
pub struct NodeRegistry {
    inner: Mutex<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a node. Registering an id again returns the original entry;
    /// the only change it can make is marking the node ready. The boolean
    /// tells whether the node is new.
    pub fn register(&self, id: NodeId, addr: String, ready: bool) -> (RegisteredNode, bool) {
        let mut inner = self.lock();

        if let Some(existing) = inner.nodes.get_mut(&id) {
            if existing.addr != addr {
                tracing::warn!(
                    "Node {} re-registered with address {} (keeping {})",
                    id,
                    addr,
                    existing.addr
                );
            }
            if ready && !existing.ready {
                existing.ready = true;
            }
            return (existing.clone(), false);
        }

        let node = RegisteredNode {
            id: id.clone(),
            addr,
            order: inner.order.len() as u64,
            registered_at: now_ms(),
            ready,
        };
        inner.order.push(id.clone());
        inner.nodes.insert(id, node.clone());

        (node, true)
    }

    /// All nodes in registration order.
    pub fn snapshot(&self) -> Vec<RegisteredNode> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect()
    }

    /// Ready nodes in registration order.
    pub fn ready_snapshot(&self) -> Vec<RegisteredNode> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id))
            .filter(|node| node.ready)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &NodeId) -> Option<RegisteredNode> {
        self.lock().nodes.get(id).cloned()
    }

    pub fn first(&self) -> Option<RegisteredNode> {
        let inner = self.lock();
        inner.order.first().and_then(|id| inner.nodes.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
