use crate::task::types::{NodeId, TaskId, TaskReply};
use serde::{Deserialize, Serialize};

/// A node as recorded by the portal. Only `ready` changes after the first
/// registration, and only from false to true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredNode {
    pub id: NodeId,
    pub addr: String,
    /// Position in registration order, starting at 0.
    pub order: u64,
    /// Timestamp (ms) of the first registration.
    pub registered_at: u64,
    /// Subscribed to task announcements. Only ready nodes are expected to
    /// reply or can be elected.
    pub ready: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("no nodes registered")]
    NoNodesRegistered,

    #[error("task {0} is already outstanding")]
    DuplicateTask(TaskId),

    #[error("portal is draining, no new tasks are accepted")]
    Draining,

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Every expected node replied and all of them succeeded.
#[derive(Debug, Clone)]
pub struct WaitReport {
    pub task_id: TaskId,
    pub replies: Vec<TaskReply>,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("task {0} was not published or is already being waited on")]
    NotPublished(TaskId),

    /// At least one node reported failure. `message` is the last failure seen.
    #[error("task {task_id} failed on {failed} of {expected} nodes: {message}")]
    Failed {
        task_id: TaskId,
        message: String,
        failed: usize,
        received: usize,
        expected: usize,
        replies: Vec<TaskReply>,
    },

    #[error("task {task_id} timed out with {received}/{expected} replies")]
    TimedOut {
        task_id: TaskId,
        received: usize,
        expected: usize,
        missing: Vec<NodeId>,
        replies: Vec<TaskReply>,
    },

    #[error("reply subscription for task {0} closed early")]
    Closed(TaskId),
}

impl WaitError {
    /// Replies that did arrive before the wait ended.
    pub fn replies(&self) -> &[TaskReply] {
        match self {
            WaitError::Failed { replies, .. } | WaitError::TimedOut { replies, .. } => replies,
            WaitError::NotPublished(_) | WaitError::Closed(_) => &[],
        }
    }
}
