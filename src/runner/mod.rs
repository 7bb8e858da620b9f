//! Job Runner Module
//!
//! Executes a task's job on one node: decomposition and fan-out on the
//! dispatcher, competing consumption of units everywhere, and exactly one
//! `TaskReply` per node.
//!
//! ## Submodules
//! - **`runner`**: `JobRunner`, the dispatch/follow loops and the reply path.
//! - **`registry`**: maps job and unit type tags to executable closures.
//! - **`handlers`**: built-in copy/move/delete operations.
//! - **`types`**: job units, unit acks and the dispatch marker.

pub mod handlers;
pub mod registry;
pub mod runner;
pub mod types;
