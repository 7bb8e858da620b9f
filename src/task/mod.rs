//! Task Data Model
//!
//! Types shared by every component: node and task identities, endpoints, jobs
//! and the per-node completion reply. All of them travel over the message bus,
//! so they only use shapes `bincode` can encode.

pub mod types;

#[cfg(test)]
mod tests;
