//! Job Handler Registry
//!
//! A dynamic registry that maps type tags to executable Rust closures. Job
//! types may register a decomposer (job -> units) and unit types register an
//! executor, so new operations plug in without touching the runner.

use super::types::JobUnit;
use crate::endpoint::storage::Storage;
use crate::task::types::Job;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Resolved storage handles of a task, indexed like `Task::endpoints`.
pub type Storages = Arc<[Arc<dyn Storage>]>;

/// Splits a job into the units the dispatcher publishes.
pub type DecomposeFn = Arc<
    dyn Fn(Job, Storages) -> Pin<Box<dyn Future<Output = Result<Vec<JobUnit>>> + Send>>
        + Send
        + Sync,
>;

/// Executes one unit against the task's storages.
pub type UnitHandlerFn =
    Arc<dyn Fn(JobUnit, Storages) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

pub struct JobHandlerRegistry {
    decomposers: DashMap<String, DecomposeFn>,
    handlers: DashMap<String, UnitHandlerFn>,
}

impl JobHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a registry with the built-in copy/move/delete operations.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        super::handlers::register_builtins(&registry);
        registry
    }

    /// Registers the decomposition strategy for a job type.
    pub fn register_job<F, Fut>(&self, kind: &str, decompose: F)
    where
        F: Fn(Job, Storages) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<JobUnit>>> + Send + 'static,
    {
        let decompose_fn: DecomposeFn = Arc::new(move |job: Job, storages: Storages| {
            Box::pin(decompose(job, storages))
                as Pin<Box<dyn Future<Output = Result<Vec<JobUnit>>> + Send>>
        });

        self.decomposers.insert(kind.to_string(), decompose_fn);

        tracing::info!("Registered job decomposer: {}", kind);
    }

    /// Registers the executor for a unit type.
    pub fn register_unit<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(JobUnit, Storages) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler_fn: UnitHandlerFn = Arc::new(move |unit: JobUnit, storages: Storages| {
            Box::pin(handler(unit, storages)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        self.handlers.insert(kind.to_string(), handler_fn);

        tracing::info!("Registered unit handler: {}", kind);
    }

    /// Produces the units for `job`.
    ///
    /// A job type without a decomposer but with a unit handler of the same
    /// name runs as exactly one unit.
    pub async fn decompose(&self, job: &Job, storages: &Storages) -> Result<Vec<JobUnit>> {
        let decompose_fn = self
            .decomposers
            .get(&job.kind)
            .map(|entry| entry.value().clone());

        match decompose_fn {
            Some(decompose_fn) => decompose_fn(job.clone(), storages.clone()).await,
            None if self.has_handler(&job.kind) => Ok(vec![JobUnit::from_job(job)]),
            None => {
                let error = format!("Unknown job type: {}", job.kind);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    /// Looks up the unit handler by type and runs it.
    pub async fn execute(&self, unit: &JobUnit, storages: &Storages) -> Result<()> {
        let handler_fn = self
            .handlers
            .get(&unit.kind)
            .map(|entry| entry.value().clone());

        match handler_fn {
            Some(handler_fn) => {
                tracing::debug!(
                    "Executing unit {} with handler '{}' (body size: {} bytes)",
                    unit.id,
                    unit.kind,
                    unit.body.len()
                );
                handler_fn(unit.clone(), storages.clone()).await
            }
            None => {
                let error = format!("Unknown unit handler: {}", unit.kind);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    /// Returns the names of all registered unit handlers.
    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn has_decomposer(&self, kind: &str) -> bool {
        self.decomposers.contains_key(kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for JobHandlerRegistry {
    fn default() -> Self {
        Self {
            decomposers: DashMap::new(),
            handlers: DashMap::new(),
        }
    }
}
