//! Job Runner
//!
//! Executes one task's job on one node and sends that node's single
//! `TaskReply`, whatever path the execution took.
//!
//! ## Modes
//! - **Dispatch** (`sync`): joins the unit queue group, decomposes the job,
//!   publishes every unit, consumes its own share, and counts acks until every
//!   published unit is accounted for. It then leaves the retained
//!   `DispatchDone` marker for followers.
//! - **Follow** (`follow`): consumes units from the queue group until the
//!   dispatcher's marker shows up, then joins its in-flight handlers.

use super::registry::{JobHandlerRegistry, Storages};
use super::types::{DispatchDone, JobUnit, RunOutcome, UnitAck};
use crate::bus::client::BusConnection;
use crate::bus::types::Message;
use crate::config::RunnerConfig;
use crate::task::types::{Job, NodeId, ReplyStatus, Role, TaskId, TaskReply};

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

pub struct JobRunner {
    node_id: NodeId,
    task_id: TaskId,
    queue: Arc<BusConnection>,
    handlers: Arc<JobHandlerRegistry>,
    storages: Storages,
    config: RunnerConfig,
    /// Bounds how many units this node executes at once.
    limiter: Arc<Semaphore>,
    outcome: Mutex<RunOutcome>,
    replied: AtomicBool,
}

impl JobRunner {
    pub fn new(
        node_id: NodeId,
        task_id: TaskId,
        queue: Arc<BusConnection>,
        handlers: Arc<JobHandlerRegistry>,
        storages: Storages,
        config: RunnerConfig,
    ) -> Arc<Self> {
        let permits = config.max_concurrent_units.max(1);
        Arc::new(Self {
            node_id,
            task_id,
            queue,
            handlers,
            storages,
            config,
            limiter: Arc::new(Semaphore::new(permits)),
            outcome: Mutex::new(RunOutcome::default()),
            replied: AtomicBool::new(false),
        })
    }

    fn lock_outcome(&self) -> std::sync::MutexGuard<'_, RunOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_error(&self, message: String) {
        tracing::warn!("Task {}: {}", self.task_id, message);
        self.lock_outcome().record_error(message);
    }

    pub fn outcome(&self) -> RunOutcome {
        self.lock_outcome().clone()
    }

    /// Dispatch mode: fan the job out and account for every published unit.
    pub async fn sync(self: &Arc<Self>, job: &Job) -> Result<TaskReply> {
        let topic = self.task_id.topic();
        let ack_subject = self.task_id.ack_subject();

        // Subscribe before publishing so neither acks nor our own share can be missed.
        let mut acks = self.queue.subscribe(&ack_subject)?;
        let mut units = self.queue.queue_subscribe(&topic, &topic)?;

        let decomposed = match self.handlers.decompose(job, &self.storages).await {
            Ok(decomposed) => decomposed,
            Err(e) => {
                self.record_error(format!("decompose {} job: {:#}", job.kind, e));
                Vec::new()
            }
        };

        let mut published: u64 = 0;
        for unit in &decomposed {
            if let Err(e) = self.queue.publish_msg(&topic, Some(ack_subject.as_str()), unit) {
                self.record_error(format!("publish unit {}: {:#}", unit.id, e));
                break;
            }
            published += 1;
        }
        tracing::info!(
            "Task {}: published {} units on {}",
            self.task_id,
            published,
            topic
        );

        let mut in_flight = JoinSet::new();
        let mut acknowledged: u64 = 0;
        let deadline = tokio::time::sleep_until(Instant::now() + self.config.dispatch_timeout);
        tokio::pin!(deadline);

        while acknowledged < published {
            tokio::select! {
                message = units.next() => match message {
                    Some(message) => {
                        let runner = self.clone();
                        in_flight.spawn(async move { runner.handle_unit(message).await });
                    }
                    None => {
                        self.record_error("bus connection closed during dispatch".to_string());
                        break;
                    }
                },
                message = acks.next() => match message {
                    Some(message) => {
                        acknowledged += 1;
                        match message.decode::<UnitAck>() {
                            Ok(ack) if ack.status == ReplyStatus::Failed => tracing::warn!(
                                "Task {}: unit {} failed on {}: {}",
                                self.task_id,
                                ack.unit_id,
                                ack.node_id,
                                ack.message
                            ),
                            Ok(ack) => tracing::debug!(
                                "Task {}: unit {} done on {} ({}/{})",
                                self.task_id,
                                ack.unit_id,
                                ack.node_id,
                                acknowledged,
                                published
                            ),
                            Err(e) => tracing::warn!("Task {}: undecodable ack: {}", self.task_id, e),
                        }
                    }
                    None => {
                        self.record_error("bus connection closed during dispatch".to_string());
                        break;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        self.record_error(format!("unit handler panicked: {}", e));
                    }
                }
                _ = &mut deadline => {
                    self.record_error(format!(
                        "dispatch timed out after {:?} with {}/{} units acknowledged",
                        self.config.dispatch_timeout, acknowledged, published
                    ));
                    break;
                }
            }
        }

        // Leave the group so nothing new lands here, then join our own share.
        drop(units);
        drop(acks);
        self.join_all(&mut in_flight).await;

        self.queue.publish_retained(
            &self.task_id.done_subject(),
            &DispatchDone {
                task_id: self.task_id.clone(),
                published,
                acknowledged,
            },
        )?;

        self.reply()
    }

    /// Follow mode: consume units until the dispatcher marks the task done.
    pub async fn follow(self: &Arc<Self>) -> Result<TaskReply> {
        let topic = self.task_id.topic();

        let mut units = self.queue.queue_subscribe(&topic, &topic)?;
        let mut done = self.queue.subscribe(&self.task_id.done_subject())?;

        let mut in_flight = JoinSet::new();
        let deadline = tokio::time::sleep_until(Instant::now() + self.config.dispatch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                message = units.next() => match message {
                    Some(message) => {
                        let runner = self.clone();
                        in_flight.spawn(async move { runner.handle_unit(message).await });
                    }
                    None => {
                        self.record_error("bus connection closed while following".to_string());
                        break;
                    }
                },
                message = done.next() => {
                    match message.map(|m| m.decode::<DispatchDone>()) {
                        Some(Ok(marker)) => tracing::info!(
                            "Task {}: dispatcher finished ({}/{} units acknowledged)",
                            self.task_id,
                            marker.acknowledged,
                            marker.published
                        ),
                        Some(Err(e)) => tracing::warn!(
                            "Task {}: undecodable dispatch marker: {}",
                            self.task_id,
                            e
                        ),
                        None => self.record_error(
                            "bus connection closed while following".to_string(),
                        ),
                    }
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        self.record_error(format!("unit handler panicked: {}", e));
                    }
                }
                _ = &mut deadline => {
                    self.record_error(format!(
                        "dispatcher did not finish within {:?}",
                        self.config.dispatch_timeout
                    ));
                    break;
                }
            }
        }

        drop(units);
        drop(done);
        self.join_all(&mut in_flight).await;

        self.reply()
    }

    /// Consumption mode: run one unit, acknowledge it, record the outcome.
    pub async fn handle_unit(&self, message: Message) {
        // The semaphore is never closed, so acquiring only waits.
        let _permit = self.limiter.clone().acquire_owned().await.ok();

        let (unit_id, result) = match message.decode::<JobUnit>() {
            Ok(unit) => {
                let result = self.handlers.execute(&unit, &self.storages).await;
                (unit.id, result)
            }
            Err(e) => ("<undecodable>".to_string(), Err(e)),
        };

        let ack = {
            let mut outcome = self.lock_outcome();
            outcome.handled += 1;
            match &result {
                Ok(()) => UnitAck {
                    unit_id: unit_id.clone(),
                    node_id: self.node_id.clone(),
                    status: ReplyStatus::Succeeded,
                    message: String::new(),
                },
                Err(e) => {
                    let error = format!("unit {}: {:#}", unit_id, e);
                    tracing::warn!("Task {}: {}", self.task_id, error);
                    outcome.failed += 1;
                    outcome.record_error(error.clone());
                    UnitAck {
                        unit_id: unit_id.clone(),
                        node_id: self.node_id.clone(),
                        status: ReplyStatus::Failed,
                        message: error,
                    }
                }
            }
        };

        if let Some(reply_to) = message.reply_to.as_deref()
            && let Err(e) = self.queue.publish_msg(reply_to, None, &ack)
        {
            tracing::warn!("Task {}: failed to ack unit {}: {}", self.task_id, unit_id, e);
        }
    }

    /// Ends this node's participation before any unit ran, e.g. when an
    /// endpoint could not be resolved. A dispatcher still leaves the done
    /// marker so followers are not left waiting.
    pub fn abandon(&self, role: Role, error: &anyhow::Error) -> Result<TaskReply> {
        self.record_error(format!("{:#}", error));

        if role == Role::Dispatcher {
            self.queue.publish_retained(
                &self.task_id.done_subject(),
                &DispatchDone {
                    task_id: self.task_id.clone(),
                    published: 0,
                    acknowledged: 0,
                },
            )?;
        }

        self.reply()
    }

    /// Publishes this node's `TaskReply`. Only the first call sends anything.
    pub fn reply(&self) -> Result<TaskReply> {
        if self.replied.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!(
                "reply for task {} was already sent",
                self.task_id
            ));
        }

        let outcome = self.outcome();
        let reply = TaskReply {
            id: self.task_id.clone(),
            node_id: self.node_id.clone(),
            status: outcome.status(),
            message: outcome.message(),
        };

        self.queue
            .publish_msg(&self.task_id.reply_subject(), None, &reply)?;

        match reply.status {
            ReplyStatus::Succeeded => tracing::info!(
                "Task {}: replied succeeded ({} units)",
                self.task_id,
                outcome.handled
            ),
            ReplyStatus::Failed => tracing::warn!(
                "Task {}: replied failed: {}",
                self.task_id,
                reply.message
            ),
        }

        Ok(reply)
    }

    async fn join_all(&self, in_flight: &mut JoinSet<()>) {
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                self.record_error(format!("unit handler panicked: {}", e));
            }
        }
    }
}
