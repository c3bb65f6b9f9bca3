//! Transaction Coordinator
//!
//! Multi-shard mutations go through two-phase commit: the coordinator derives
//! the participant shards from the operations via the router, collects
//! unanimous prepare votes, then drives commit (or abort) to completion.
//! State is durable across coordinator restarts.
//!
//! ## Submodules
//! - **`types`**: the status DAG, operations, and the durable record format.
//! - **`coordinator`**: the state machine, timers, dispatch and recovery.

pub mod coordinator;
pub mod handlers;
pub mod protocol;
pub mod types;

#[cfg(test)]
mod tests;
