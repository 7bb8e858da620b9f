//! Worker Node
//!
//! Registers with the portal, listens for task announcements and runs one
//! `Agent` per task. Agents run concurrently in a `JoinSet`; a failing agent
//! is logged and never stops the listener.

use super::agent::Agent;
use super::rpc::PortalClient;
use crate::bus::client::{BusConnection, Subscription};
use crate::config::{RunnerConfig, WorkerConfig};
use crate::endpoint::resolver::EndpointResolver;
use crate::runner::registry::JobHandlerRegistry;
use crate::task::types::{NodeId, Task};

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

/// What every agent of this node shares.
pub struct NodeContext {
    pub node_id: NodeId,
    pub addr: String,
    pub portal: PortalClient,
    pub resolver: Arc<EndpointResolver>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub runner: RunnerConfig,
}

struct Session {
    stop: oneshot::Sender<()>,
    listener: JoinHandle<()>,
}

pub struct Worker {
    context: Arc<NodeContext>,
    session: Mutex<Option<Session>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        resolver: Arc<EndpointResolver>,
        handlers: Arc<JobHandlerRegistry>,
    ) -> Arc<Self> {
        let node_id = config.node_id.map(NodeId).unwrap_or_default();
        let portal = PortalClient::new(&config.portal_addr, config.rpc_timeout, config.rpc_attempts);

        Arc::new(Self {
            context: Arc::new(NodeContext {
                node_id,
                addr: config.advertise_addr,
                portal,
                resolver,
                handlers,
                runner: config.runner,
            }),
            session: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.context.node_id
    }

    pub fn is_connected(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|session| !session.listener.is_finished())
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers with the portal and starts listening for tasks. Returns once
    /// the task subscription is active on the bus and the portal counts this
    /// node as ready.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(anyhow::anyhow!(
                "worker {} is already connected",
                self.context.node_id
            ));
        }

        let registration = self
            .context
            .portal
            .register(&self.context.node_id, &self.context.addr, false)
            .await?;

        let queue = BusConnection::connect(&registration.queue_addr)
            .await
            .context("connect to task bus")?;
        let tasks = queue.subscribe(&registration.subject)?;
        // Tasks published after connect() returns must reach this node.
        queue.flush().await?;
        // Only now may the portal expect a reply from this node.
        self.context
            .portal
            .register(&self.context.node_id, &self.context.addr, true)
            .await?;

        tracing::info!(
            "Worker {} registered, listening on {} via {}",
            self.context.node_id,
            registration.subject,
            registration.queue_addr
        );

        let (stop, stop_rx) = oneshot::channel();
        let context = self.context.clone();
        let listener = tokio::spawn(async move {
            listen(context, registration.queue_addr, queue, tasks, stop_rx).await;
        });

        *self.lock_session() = Some(Session { stop, listener });
        Ok(())
    }

    /// Stops taking new tasks and waits for running agents to finish.
    pub async fn shutdown(&self) -> Result<()> {
        let session = self.lock_session().take();
        let Some(session) = session else {
            return Ok(());
        };

        let _ = session.stop.send(());
        session
            .listener
            .await
            .map_err(|e| anyhow::anyhow!("worker listener panicked: {}", e))?;

        tracing::info!("Worker {} stopped", self.context.node_id);
        Ok(())
    }
}

async fn listen(
    context: Arc<NodeContext>,
    queue_addr: String,
    queue: BusConnection,
    mut tasks: Subscription,
    mut stop: oneshot::Receiver<()>,
) {
    let mut agents = JoinSet::new();

    loop {
        tokio::select! {
            message = tasks.next() => {
                let Some(message) = message else {
                    tracing::warn!("Worker {}: task subscription closed", context.node_id);
                    break;
                };
                let task = match message.decode::<Task>() {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::warn!("Worker {}: undecodable task: {}", context.node_id, e);
                        continue;
                    }
                };

                tracing::info!("Worker {}: received task {}", context.node_id, task.id);
                let agent = Agent::new(context.clone(), queue_addr.clone(), task);
                agents.spawn(async move {
                    let task_id = agent.task_id().clone();
                    if let Err(e) = agent.handle().await {
                        tracing::error!("Task {}: agent failed: {:#}", task_id, e);
                    }
                });
            }
            Some(joined) = agents.join_next(), if !agents.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Worker {}: agent panicked: {}", context.node_id, e);
                }
            }
            _ = &mut stop => break,
        }
    }

    drop(tasks);
    while let Some(joined) = agents.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Worker {}: agent panicked: {}", context.node_id, e);
        }
    }
    if let Err(e) = queue.drain().await {
        tracing::debug!("Worker {}: bus drain failed: {}", context.node_id, e);
    }
}
