//! Per-Task Agent
//!
//! Built fresh for every task a worker hears about. The agent learns its role
//! from the portal, opens its own bus session, resolves the task's endpoints
//! and hands over to a `JobRunner`.

use super::worker::NodeContext;
use crate::bus::client::BusConnection;
use crate::endpoint::storage::Storage;
use crate::runner::registry::Storages;
use crate::runner::runner::JobRunner;
use crate::task::types::{Role, Task, TaskId, TaskReply};

use anyhow::{Context, Result};
use std::sync::Arc;

pub struct Agent {
    context: Arc<NodeContext>,
    queue_addr: String,
    task: Task,
}

impl Agent {
    pub fn new(context: Arc<NodeContext>, queue_addr: String, task: Task) -> Self {
        Self {
            context,
            queue_addr,
            task,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    /// Runs this node's part of the task and returns the reply it sent.
    ///
    /// Errors before the role is known (upgrade, bus connect) mean no reply
    /// was sent. Once the role is known a reply always goes out, and a
    /// failed reply is also returned as an error.
    pub async fn handle(self) -> Result<TaskReply> {
        let node_id = self.context.node_id.clone();
        let task_id = self.task.id.clone();

        let upgrade = self.context.portal.upgrade(&node_id, &task_id).await?;
        let role = if upgrade.node_id == node_id {
            Role::Dispatcher
        } else {
            Role::Follower
        };
        if upgrade.subject != task_id.topic() {
            tracing::warn!(
                "Task {}: portal named topic {}, expected {}",
                task_id,
                upgrade.subject,
                task_id.topic()
            );
        }
        tracing::info!(
            "Task {}: node {} is {} (dispatcher {} at {})",
            task_id,
            node_id,
            role,
            upgrade.node_id,
            upgrade.addr
        );

        let resolved = self
            .context
            .resolver
            .resolve_all(&self.task.endpoints)
            .with_context(|| format!("task {}", task_id));

        let queue = Arc::new(
            BusConnection::connect(&self.queue_addr)
                .await
                .with_context(|| format!("task {}: open bus session", task_id))?,
        );

        let (storages, setup_error) = match resolved {
            Ok(storages) => (Storages::from(storages), None),
            Err(e) => (Storages::from(Vec::<Arc<dyn Storage>>::new()), Some(e)),
        };

        let runner = JobRunner::new(
            node_id,
            task_id.clone(),
            queue.clone(),
            self.context.handlers.clone(),
            storages,
            self.context.runner.clone(),
        );

        let outcome = match setup_error {
            Some(e) => {
                let abandoned = runner.abandon(role, &e);
                finish(&queue, &task_id).await;
                abandoned?;
                return Err(e);
            }
            None => match role {
                Role::Dispatcher => runner.sync(&self.task.job).await,
                Role::Follower => runner.follow().await,
            },
        };

        finish(&queue, &task_id).await;
        let reply = outcome?;

        if !reply.is_success() {
            return Err(anyhow::anyhow!(
                "task {} failed as {}: {}",
                task_id,
                role,
                reply.message
            ));
        }
        Ok(reply)
    }
}

/// Flushes the reply and closes the agent's session.
async fn finish(queue: &BusConnection, task_id: &TaskId) {
    if let Err(e) = queue.drain().await {
        tracing::warn!("Task {}: bus drain failed: {}", task_id, e);
    }
}
