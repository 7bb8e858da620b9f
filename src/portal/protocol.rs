//! Portal Network Protocol
//!
//! HTTP endpoints the portal serves and the JSON bodies exchanged on them.
//! Workers use register/upgrade; clients use submit and the node listing.

use super::types::RegisteredNode;
use crate::task::types::{Endpoint, Job, NodeId, ReplyStatus, Task, TaskId};
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Worker announces itself and learns where the bus is.
pub const ENDPOINT_REGISTER: &str = "/node/register";
/// Worker asks who dispatches a task.
pub const ENDPOINT_UPGRADE: &str = "/node/upgrade";
/// Client publishes a task and waits for the aggregate outcome.
pub const ENDPOINT_SUBMIT_TASK: &str = "/task/submit";
pub const ENDPOINT_NODES: &str = "/nodes";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: NodeId,
    pub addr: String,
    /// False while the node is still subscribing to task announcements; it
    /// registers again with true once it is listening.
    #[serde(default = "ready_by_default")]
    pub ready: bool,
}

fn ready_by_default() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterReply {
    /// `host:port` of the message bus.
    pub queue_addr: String,
    /// Broadcast subject tasks are announced on.
    pub subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub node_id: NodeId,
    pub task_id: TaskId,
}

/// Names the dispatcher of a task. The asking node is a follower unless
/// `node_id` is its own id.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpgradeReply {
    pub node_id: NodeId,
    pub addr: String,
    /// Subject and queue group the task's units travel on.
    pub subject: String,
}

/// Job as a client writes it: the body is plain JSON rather than bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    pub job: JobSpec,
}

impl TaskSpec {
    pub fn into_task(self) -> anyhow::Result<Task> {
        let mut job = Job::new(&self.job.kind, &self.job.body)?;
        if let Some(id) = self.job.id {
            job.id = id;
        }

        Ok(Task {
            id: self.id.map(TaskId).unwrap_or_default(),
            endpoints: self.endpoints,
            job,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub task: TaskSpec,
    /// Overrides the portal's wait deadline for this task.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Option<TaskId>,
    pub status: ReplyStatus,
    pub message: String,
    pub received: usize,
    pub expected: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<RegisteredNode>,
}
