//! Data-plane API
//!
//! The node's public document surface and the internal node-to-node surface,
//! plus the `DataService` that routes each request to a local shard or
//! forwards it to the owning node.
//!
//! ## Submodules
//! - **`service`**: route-first get/put/delete with forwarding, and the full
//!   query pipeline wiring; participant transport for the coordinator.
//! - **`client`**: retrying reqwest wrapper for inter-node calls.
//! - **`handlers`**: axum handlers for the public and internal endpoints.
//! - **`protocol`**: endpoint constants and DTOs for node-to-node traffic.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod service;

#[cfg(test)]
mod tests;
