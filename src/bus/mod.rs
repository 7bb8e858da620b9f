//! Message Bus Module
//!
//! Subject-based publish/subscribe used for everything that flows between the
//! portal and the worker nodes once registration is done.
//!
//! ## Delivery Modes
//! - **Broadcast**: a plain subscription receives every message on its subject
//!   (task notifications on `"tasks"`, dispatch markers).
//! - **Competing consumer**: subscriptions sharing a queue group receive each
//!   message exactly once between them, in rotation (job units on `task.<id>`).
//! - **Retained**: the broker keeps the last retained message of a subject and
//!   hands it to subscribers that show up later.
//!
//! ## Submodules
//! - **`server`**: the broker the portal hosts.
//! - **`client`**: `BusConnection` and `Subscription`, used by portal and agents.
//! - **`types`**: wire frames and the length-prefixed `bincode` codec.

pub mod client;
pub mod server;
pub mod types;

#[cfg(test)]
mod tests;
