//! Portal Module
//!
//! The coordinator of the cluster. The portal owns the message bus, keeps the
//! registry of worker nodes, answers which node dispatches each task, and
//! aggregates the single reply every node sends per task.
//!
//! ## Submodules
//! - **`service`**: `Portal` itself: bus bring-up, publish, wait, drain.
//! - **`registry`**: the mutex-guarded node table.
//! - **`election`**: dispatcher selection policies.
//! - **`handlers`** / **`protocol`**: the HTTP RPC surface (axum).
//! - **`types`**: registered nodes and the portal's error types.

pub mod election;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod types;
