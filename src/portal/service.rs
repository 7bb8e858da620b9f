//! Portal Service
//!
//! Hosts the message bus and the registration RPC server, elects dispatchers
//! and aggregates the per-node replies of every published task.
//!
//! ## Reply Accounting
//! `publish` snapshots the ready nodes and subscribes to the task's reply
//! subject before the task goes out, so a fast node cannot reply unseen.
//! `wait` then consumes that subscription until every node in the snapshot
//! has answered or the deadline passes.
//!
//! ## Task Lifetime
//! The dispatcher is elected once, over the publish-time snapshot, and every
//! upgrade for the task returns that node. The task stays live after `wait`
//! until its done marker has been seen and cleared from the bus, or until
//! `marker_linger` passes. Its id cannot be published again while live.

use super::handlers::{handle_nodes, handle_register, handle_submit_task, handle_upgrade};
use super::protocol::{
    ENDPOINT_NODES, ENDPOINT_REGISTER, ENDPOINT_SUBMIT_TASK, ENDPOINT_UPGRADE, RegisterReply,
    UpgradeReply,
};
use super::registry::NodeRegistry;
use super::types::{PortalError, RegisteredNode, WaitError, WaitReport};
use crate::bus::client::{BusConnection, Subscription};
use crate::bus::server::BusServer;
use crate::config::{PortalConfig, WaitPolicy};
use crate::task::types::{NodeId, TASKS_SUBJECT, Task, TaskId, TaskReply};

use anyhow::Result;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A published task whose replies have not been collected yet.
struct PendingTask {
    expected: Vec<NodeId>,
    replies: Subscription,
    done: Subscription,
}

/// Dispatcher of every live task. `None` when no node was ready at publish.
type DispatcherTable = Arc<DashMap<TaskId, Option<RegisteredNode>>>;

pub struct Portal {
    config: PortalConfig,
    registry: NodeRegistry,
    bus: BusServer,
    /// The portal's own session with its bus.
    queue: Arc<BusConnection>,
    queue_addr: String,
    rpc_addr: SocketAddr,
    pending: DashMap<TaskId, PendingTask>,
    live: DispatcherTable,
    draining: AtomicBool,
    server_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Portal {
    /// Brings up the bus, connects to it and starts serving RPCs.
    ///
    /// Fails if the bus does not accept the portal's connection within
    /// `bus_ready_timeout`.
    pub async fn start(config: PortalConfig) -> Result<Arc<Self>> {
        let bus = BusServer::bind(&config.bus_bind_addr()).await?;
        let queue_addr = format!("{}:{}", config.host, bus.local_addr().port());

        let queue = match tokio::time::timeout(
            config.bus_ready_timeout,
            BusConnection::connect(&queue_addr),
        )
        .await
        {
            Ok(connected) => connected?,
            Err(_) => {
                bus.shutdown();
                return Err(anyhow::anyhow!(
                    "message bus at {} not ready within {:?}",
                    queue_addr,
                    config.bus_ready_timeout
                ));
            }
        };
        queue.flush().await?;

        let listener = tokio::net::TcpListener::bind(config.rpc_bind_addr()).await?;
        let rpc_addr = listener.local_addr()?;

        let portal = Arc::new(Self {
            config,
            registry: NodeRegistry::new(),
            bus,
            queue: Arc::new(queue),
            queue_addr,
            rpc_addr,
            pending: DashMap::new(),
            live: Arc::new(DashMap::new()),
            draining: AtomicBool::new(false),
            server_handle: Mutex::new(None),
        });

        let app = router(portal.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Portal RPC server stopped: {}", e);
            }
        });
        *portal
            .server_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        tracing::info!(
            "Portal ready: rpc={} bus={}",
            portal.rpc_addr,
            portal.queue_addr
        );

        Ok(portal)
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn queue_addr(&self) -> &str {
        &self.queue_addr
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Registered nodes in registration order.
    pub fn nodes(&self) -> Vec<RegisteredNode> {
        self.registry.snapshot()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of tasks published but not yet waited on.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Number of tasks whose id is still taken: outstanding, or waited on
    /// with the done marker not yet retired.
    pub fn live_tasks(&self) -> usize {
        self.live.len()
    }

    /// Registers a node that is already listening for tasks.
    pub fn register(&self, node_id: NodeId, addr: String) -> RegisterReply {
        self.register_with(node_id, addr, true)
    }

    /// Registers a node. A node that is not `ready` yet is recorded but
    /// neither expected to reply nor elected until it registers again ready.
    pub fn register_with(&self, node_id: NodeId, addr: String, ready: bool) -> RegisterReply {
        let (node, is_new) = self.registry.register(node_id, addr, ready);
        if is_new {
            tracing::info!(
                "Registered node {} at {} (#{}, ready={})",
                node.id,
                node.addr,
                node.order,
                node.ready
            );
        } else if ready {
            tracing::info!("Node {} is ready", node.id);
        } else {
            tracing::debug!("Node {} registered again", node.id);
        }

        RegisterReply {
            queue_addr: self.queue_addr.clone(),
            subject: TASKS_SUBJECT.to_string(),
        }
    }

    /// Names the dispatcher of `task_id`. For a published task this is the
    /// node elected at publish, whatever registered since. An unknown task is
    /// answered from the current ready nodes without recording anything.
    pub fn upgrade(&self, node_id: &NodeId, task_id: &TaskId) -> Result<UpgradeReply, PortalError> {
        let elected = match self.live.get(task_id) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::debug!("Upgrade for task {} that is not live", task_id);
                let nodes = self.registry.ready_snapshot();
                self.config.election.elect(&nodes, task_id).cloned()
            }
        };
        let dispatcher = elected.ok_or(PortalError::NoNodesRegistered)?;

        if self.registry.get(node_id).is_none() {
            tracing::warn!("Upgrade for task {} from unregistered node {}", task_id, node_id);
        }
        tracing::debug!(
            "Task {}: node {} asked, dispatcher is {}",
            task_id,
            node_id,
            dispatcher.id
        );

        Ok(UpgradeReply {
            node_id: dispatcher.id.clone(),
            addr: dispatcher.addr.clone(),
            subject: task_id.topic(),
        })
    }

    /// Announces `task` to every worker. Does not wait for replies.
    pub async fn publish(&self, task: &Task) -> Result<(), PortalError> {
        if self.is_draining() {
            return Err(PortalError::Draining);
        }
        task.id
            .validate()
            .map_err(|e| PortalError::InvalidTaskId(e.to_string()))?;

        let nodes = self.registry.ready_snapshot();
        if nodes.is_empty() {
            tracing::warn!("Task {} published with no ready nodes", task.id);
        }
        let dispatcher = self.config.election.elect(&nodes, &task.id).cloned();
        let expected: Vec<NodeId> = nodes.into_iter().map(|n| n.id).collect();

        let reply_subject = task.id.reply_subject();
        match self.live.entry(task.id.clone()) {
            Entry::Occupied(_) => return Err(PortalError::DuplicateTask(task.id.clone())),
            Entry::Vacant(slot) => {
                let replies = self.queue.subscribe(&reply_subject)?;
                let done = self.queue.subscribe(&task.id.done_subject())?;
                self.pending.insert(
                    task.id.clone(),
                    PendingTask {
                        expected,
                        replies,
                        done,
                    },
                );
                slot.insert(dispatcher);
            }
        }

        let sent = self
            .queue
            .publish_msg(TASKS_SUBJECT, Some(reply_subject.as_str()), task);
        if let Err(e) = sent {
            self.pending.remove(&task.id);
            self.live.remove(&task.id);
            return Err(e.into());
        }
        self.queue.flush().await?;

        tracing::info!(
            "Published task {} ({} job, {} endpoints)",
            task.id,
            task.job.kind,
            task.endpoints.len()
        );
        Ok(())
    }

    /// Waits for the replies of `task_id` using the configured deadline.
    pub async fn wait(&self, task_id: &TaskId) -> Result<WaitReport, WaitError> {
        self.wait_with_deadline(task_id, self.config.wait_timeout)
            .await
    }

    /// Collects one reply per node registered when `task_id` was published.
    /// `None` waits indefinitely.
    pub async fn wait_with_deadline(
        &self,
        task_id: &TaskId,
        deadline: Option<Duration>,
    ) -> Result<WaitReport, WaitError> {
        let (_, pending) = self
            .pending
            .remove(task_id)
            .ok_or_else(|| WaitError::NotPublished(task_id.clone()))?;

        let PendingTask {
            expected: expected_nodes,
            replies: mut reply_sub,
            done,
        } = pending;
        let expected = expected_nodes.len();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut replies: Vec<TaskReply> = Vec::new();
        let mut failed = 0usize;
        let mut last_failure = String::new();
        let mut timed_out = false;
        let mut closed = false;

        let timer = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        while seen.len() < expected {
            tokio::select! {
                message = reply_sub.next() => {
                    let Some(message) = message else {
                        closed = true;
                        break;
                    };
                    let reply = match message.decode::<TaskReply>() {
                        Ok(reply) => reply,
                        Err(e) => {
                            tracing::warn!("Task {}: undecodable reply: {}", task_id, e);
                            continue;
                        }
                    };

                    if !expected_nodes.contains(&reply.node_id) {
                        tracing::warn!(
                            "Task {}: ignoring reply from node {} not ready at publish",
                            task_id,
                            reply.node_id
                        );
                        continue;
                    }
                    if !seen.insert(reply.node_id.clone()) {
                        tracing::warn!("Task {}: duplicate reply from {}", task_id, reply.node_id);
                        continue;
                    }

                    if reply.is_success() {
                        tracing::info!(
                            "Task {}: node {} succeeded ({}/{})",
                            task_id,
                            reply.node_id,
                            seen.len(),
                            expected
                        );
                        replies.push(reply);
                    } else {
                        tracing::error!(
                            "Task {}: node {} failed: {}",
                            task_id,
                            reply.node_id,
                            reply.message
                        );
                        failed += 1;
                        last_failure = reply.message.clone();
                        replies.push(reply);
                        if self.config.wait_policy == WaitPolicy::FirstFailure {
                            break;
                        }
                    }
                }
                _ = &mut timer => {
                    timed_out = true;
                    break;
                }
            }
        }

        drop(reply_sub);
        self.retire(task_id, done);

        if closed {
            return Err(WaitError::Closed(task_id.clone()));
        }

        let received = seen.len();
        if timed_out {
            let missing: Vec<NodeId> = expected_nodes
                .into_iter()
                .filter(|id| !seen.contains(id))
                .collect();
            tracing::warn!(
                "Task {}: timed out with {}/{} replies, missing {:?}",
                task_id,
                received,
                expected,
                missing
            );
            return Err(WaitError::TimedOut {
                task_id: task_id.clone(),
                received,
                expected,
                missing,
                replies,
            });
        }

        if failed > 0 {
            return Err(WaitError::Failed {
                task_id: task_id.clone(),
                message: last_failure,
                failed,
                received,
                expected,
                replies,
            });
        }

        tracing::info!("Task {} completed on {} nodes", task_id, received);
        Ok(WaitReport {
            task_id: task_id.clone(),
            replies,
        })
    }

    /// Clears the task's done marker and frees its id. A marker that has not
    /// arrived yet is watched for in the background, for at most
    /// `marker_linger`, so a dispatcher finishing after `wait` gave up does
    /// not leave it retained on the bus.
    fn retire(&self, task_id: &TaskId, mut done: Subscription) {
        let has_dispatcher = self
            .live
            .get(task_id)
            .map(|entry| entry.value().is_some())
            .unwrap_or(false);

        if !has_dispatcher || done.try_next().is_some() {
            drop(done);
            clear_marker(&self.queue, task_id);
            self.live.remove(task_id);
            return;
        }

        let queue = self.queue.clone();
        let live = self.live.clone();
        let linger = self.config.marker_linger;
        let task_id = task_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(linger, done.next()).await {
                Ok(Some(_)) => tracing::debug!("Task {}: late done marker arrived", task_id),
                Ok(None) => tracing::debug!("Task {}: bus closed before done marker", task_id),
                Err(_) => tracing::warn!(
                    "Task {}: no done marker within {:?}, releasing id",
                    task_id,
                    linger
                ),
            }
            drop(done);
            clear_marker(&queue, &task_id);
            live.remove(&task_id);
        });
    }

    /// Stops accepting tasks and closes the portal's bus session after
    /// flushing what was already published.
    pub async fn drain(&self) -> Result<()> {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Draining portal ({} tasks outstanding)", self.pending.len());
        self.queue.drain().await
    }

    /// Stops the RPC server and the bus. Connected workers see their
    /// sessions close.
    pub fn shutdown(&self) {
        let handle = self
            .server_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.bus.shutdown();
        tracing::info!("Portal stopped");
    }

    pub fn bus_connections(&self) -> usize {
        self.bus.connection_count()
    }

    pub fn retained_markers(&self) -> usize {
        self.bus.retained_count()
    }
}

fn clear_marker(queue: &BusConnection, task_id: &TaskId) {
    if let Err(e) = queue.clear_retained(&task_id.done_subject()) {
        tracing::debug!("Task {}: could not clear done marker: {}", task_id, e);
    }
}

/// HTTP routes served by the portal.
pub fn router(portal: Arc<Portal>) -> Router {
    Router::new()
        .route(ENDPOINT_REGISTER, post(handle_register))
        .route(ENDPOINT_UPGRADE, post(handle_upgrade))
        .route(ENDPOINT_SUBMIT_TASK, post(handle_submit_task))
        .route(ENDPOINT_NODES, get(handle_nodes))
        .layer(Extension(portal))
}
