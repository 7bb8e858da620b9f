//! Distributed Storage Task Coordinator
//!
//! A portal process coordinates a set of worker nodes that cooperatively
//! execute storage tasks (copy, move, delete across endpoints). The portal
//! hosts a message bus; tasks are announced on it, one node per task acts as
//! dispatcher and fans the job out as units that every node consumes, and each
//! node reports exactly once per task.
//!
//! ## Architecture Modules
//! - **`portal`**: node registry, dispatcher election, publish and reply
//!   aggregation, plus the HTTP RPC server workers register with.
//! - **`worker`**: the node side. Registers, listens for tasks and runs one
//!   agent per task.
//! - **`runner`**: executes one task on one node (dispatch or follow mode) and
//!   sends that node's single reply. Holds the job handler registry.
//! - **`endpoint`**: resolves declarative endpoints into storage handles.
//! - **`bus`**: the subject-based broker and its client.
//! - **`task`**: the shared data model.
//! - **`config`**: runtime configuration and defaults.

pub mod bus;
pub mod config;
pub mod endpoint;
pub mod portal;
pub mod runner;
pub mod task;
pub mod worker;
