use crate::task::types::{Job, NodeId, ReplyStatus, TaskId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One independently dispatchable piece of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobUnit {
    pub id: String,
    /// Selects the unit handler (e.g. `copy_file`).
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON body interpreted by the unit handler.
    pub body: Vec<u8>,
}

impl JobUnit {
    pub fn new<T: Serialize>(kind: &str, body: &T) -> anyhow::Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            body: serde_json::to_vec(body)?,
        })
    }

    /// A job that has no decomposer runs as a single unit of its own type.
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind.clone(),
            body: job.body.clone(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| anyhow::anyhow!("Invalid body for unit type '{}': {}", self.kind, e))
    }
}

/// Sent by whichever node consumed a unit, to the unit's `reply_to` subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitAck {
    pub unit_id: String,
    pub node_id: NodeId,
    pub status: ReplyStatus,
    pub message: String,
}

/// Retained marker the dispatcher leaves on `task.<id>.done` once every
/// published unit is accounted for (or dispatch gave up).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchDone {
    pub task_id: TaskId,
    pub published: u64,
    pub acknowledged: u64,
}

/// What one node observed while running its share of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub handled: u64,
    pub failed: u64,
    pub first_error: Option<String>,
}

impl RunOutcome {
    /// Records a failure; only the first message is kept.
    pub fn record_error(&mut self, message: String) {
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }

    pub fn status(&self) -> ReplyStatus {
        if self.first_error.is_none() {
            ReplyStatus::Succeeded
        } else {
            ReplyStatus::Failed
        }
    }

    pub fn message(&self) -> String {
        match &self.first_error {
            Some(error) => error.clone(),
            None => format!("{} units handled", self.handled),
        }
    }
}
