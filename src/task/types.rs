use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known subject every worker listens on for new tasks.
pub const TASKS_SUBJECT: &str = "tasks";

/// Opaque identity of a worker node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a task, supplied by the submitter.
///
/// Every subject used while the task runs is derived from this id, so all
/// nodes compute the same names independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Subject (and queue group) job units are published on.
    pub fn topic(&self) -> String {
        format!("task.{}", self.0)
    }

    /// Rejects ids whose derived subjects would collide with the protocol's
    /// own: the task announcement subject, or another task's unit, ack or
    /// done subjects.
    pub fn validate(&self) -> anyhow::Result<()> {
        let id = self.0.as_str();
        if id.is_empty() {
            return Err(anyhow::anyhow!("task id must not be empty"));
        }
        if id == TASKS_SUBJECT {
            return Err(anyhow::anyhow!("task id '{}' is a reserved subject", id));
        }
        if id == "task" || id.starts_with("task.") {
            return Err(anyhow::anyhow!(
                "task id '{}' collides with the per-task subjects",
                id
            ));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(anyhow::anyhow!("task id '{}' contains whitespace", id));
        }
        Ok(())
    }

    /// Subject every node sends its single `TaskReply` to.
    pub fn reply_subject(&self) -> String {
        self.0.clone()
    }

    /// Subject consumers acknowledge units on.
    pub fn ack_subject(&self) -> String {
        format!("task.{}.ack", self.0)
    }

    /// Retained subject carrying the dispatcher's `DispatchDone` marker.
    pub fn done_subject(&self) -> String {
        format!("task.{}.done", self.0)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

/// Declarative description of one storage location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub pairs: Vec<Pair>,
}

impl Endpoint {
    pub fn new(kind: &str, pairs: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.to_string(),
            pairs: pairs
                .iter()
                .map(|(key, value)| Pair {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    /// Returns the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|pair| pair.key == key)
            .map(|pair| pair.value.as_str())
    }
}

/// What a task should do: a type tag selecting the handler plus an opaque body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Vec<u8>,
}

impl Job {
    /// Builds a job whose body is the JSON encoding of `body`.
    pub fn new<T: Serialize>(kind: &str, body: &T) -> anyhow::Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            body: serde_json::to_vec(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| anyhow::anyhow!("Invalid body for job type '{}': {}", self.kind, e))
    }
}

/// One end-to-end operation submitted once by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub endpoints: Vec<Endpoint>,
    pub job: Job,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplyStatus {
    Succeeded,
    Failed,
}

/// The single completion signal a node sends for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskReply {
    pub id: TaskId,
    pub node_id: NodeId,
    pub status: ReplyStatus,
    pub message: String,
}

impl TaskReply {
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Succeeded
    }
}

/// Role a node plays for one task, as answered by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dispatcher,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Dispatcher => f.write_str("dispatcher"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
