//! Worker Module
//!
//! The node side of the cluster. A `Worker` registers once and then runs an
//! `Agent` for every task announced on the bus; each agent asks the portal
//! for its role and drives a `JobRunner`.
//!
//! ## Submodules
//! - **`worker`**: registration, the task listener and shutdown.
//! - **`agent`**: the per-task flow (upgrade, resolve, run, drain).
//! - **`rpc`**: `PortalClient`, HTTP calls to the portal with retry.

pub mod agent;
pub mod rpc;
pub mod worker;

#[cfg(test)]
mod tests;
