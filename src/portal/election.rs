use super::types::RegisteredNode;
use crate::config::ElectionPolicy;
use crate::task::types::TaskId;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

impl ElectionPolicy {
    /// Picks the dispatcher for `task_id` from nodes in registration order.
    ///
    /// Depends only on the node list and the task id, so every node asking
    /// about the same task gets the same answer. `None` when no node exists.
    pub fn elect<'a>(
        &self,
        nodes: &'a [RegisteredNode],
        task_id: &TaskId,
    ) -> Option<&'a RegisteredNode> {
        if nodes.is_empty() {
            return None;
        }

        match self {
            ElectionPolicy::FirstRegistered => nodes.first(),
            ElectionPolicy::TaskHash => {
                let mut hasher = DefaultHasher::new();
                task_id.0.hash(&mut hasher);
                let idx = (hasher.finish() % nodes.len() as u64) as usize;
                nodes.get(idx)
            }
        }
    }
}
