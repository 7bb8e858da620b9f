//! Endpoint Resolver
//!
//! Maps an endpoint's type tag to a factory that builds a live `Storage`
//! handle from the endpoint's key/value pairs. New backends are added with
//! `register` without touching the runner or the agent.

use super::fs::FsStorage;
use super::memory::MemoryStorage;
use super::storage::Storage;
use crate::task::types::Endpoint;

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Factory turning an endpoint description into a storage handle.
pub type ResolveFn = Arc<dyn Fn(&Endpoint) -> Result<Arc<dyn Storage>> + Send + Sync>;

pub struct EndpointResolver {
    factories: DashMap<String, ResolveFn>,
    /// Named in-memory stores, shared by every resolution of the same name.
    memory_stores: Arc<DashMap<String, Arc<MemoryStorage>>>,
}

impl EndpointResolver {
    /// Creates a resolver with the built-in `fs` and `memory` types.
    pub fn new() -> Arc<Self> {
        let resolver = Self {
            factories: DashMap::new(),
            memory_stores: Arc::new(DashMap::new()),
        };

        resolver.register("fs", |endpoint| {
            let work_dir = endpoint
                .get("work_dir")
                .ok_or_else(|| anyhow::anyhow!("fs endpoint requires a 'work_dir' pair"))?;
            Ok(Arc::new(FsStorage::new(work_dir)) as Arc<dyn Storage>)
        });

        let stores = resolver.memory_stores.clone();
        resolver.register("memory", move |endpoint| {
            let name = endpoint
                .get("name")
                .ok_or_else(|| anyhow::anyhow!("memory endpoint requires a 'name' pair"))?;
            let store = stores
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryStorage::new()))
                .value()
                .clone();
            Ok(store as Arc<dyn Storage>)
        });

        Arc::new(resolver)
    }

    /// Registers (or replaces) the factory for an endpoint type.
    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&Endpoint) -> Result<Arc<dyn Storage>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        tracing::debug!("Registered endpoint type: {}", kind);
    }

    pub fn has_type(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn resolve(&self, endpoint: &Endpoint) -> Result<Arc<dyn Storage>> {
        let factory = self
            .factories
            .get(&endpoint.kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown endpoint type: {}", endpoint.kind))?;

        factory(endpoint)
    }

    /// Resolves every endpoint in order, stopping at the first failure.
    pub fn resolve_all(&self, endpoints: &[Endpoint]) -> Result<Vec<Arc<dyn Storage>>> {
        endpoints
            .iter()
            .enumerate()
            .map(|(idx, endpoint)| {
                self.resolve(endpoint)
                    .with_context(|| format!("resolve endpoint {} ({})", idx, endpoint.kind))
            })
            .collect()
    }
}
