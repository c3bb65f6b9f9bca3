//! Query Pipeline
//!
//! Parser → planner → executor → aggregator. A filter expression is validated
//! (`parser`), fanned out as one target per shard (`planner`), scattered and
//! gathered with retries under a global deadline (`executor`), and the merged
//! rows optionally reduced (`aggregate`). Filter and sort semantics over
//! dynamic documents live in `filter`.

pub mod aggregate;
pub mod executor;
pub mod filter;
pub mod parser;
pub mod planner;
