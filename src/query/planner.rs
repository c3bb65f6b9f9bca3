//! Query planning.
//!
//! A plan assigns the parsed query to each target shard. Per-shard options
//! deliberately differ from the client's: offset always applies after the
//! merge, and a global sort forces every shard to return all candidates so
//! the merger can order them. The cost heuristic keeps runaway fan-outs from
//! executing at all.

use super::filter::QueryOptions;
use super::parser::ParsedQuery;
use crate::error::{DocError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTarget {
    pub shard_id: String,
    pub filters: Vec<super::filter::Filter>,
    pub options: QueryOptions,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub collection: String,
    pub targets: Vec<ShardTarget>,
    pub parallel: bool,
    pub requires_merge: bool,
    pub estimated_cost: f64,
    pub projection: Option<Vec<String>>,
    /// The client-facing options applied after the merge.
    pub options: QueryOptions,
}

pub fn plan(parsed: &ParsedQuery, shard_ids: &[String], max_cost: f64) -> Result<QueryPlan> {
    let sort_present = !parsed.options.sort.is_empty();
    let requires_merge = shard_ids.len() > 1 || sort_present;

    let shard_options = QueryOptions {
        // Offset only makes sense after the merge; a shard-local skip would
        // drop rows that belong in the global window.
        offset: None,
        limit: if sort_present {
            None
        } else {
            parsed.options.limit
        },
        sort: parsed.options.sort.clone(),
    };

    let targets: Vec<ShardTarget> = shard_ids
        .iter()
        .map(|shard_id| ShardTarget {
            shard_id: shard_id.clone(),
            filters: parsed.expression.conditions.clone(),
            options: shard_options.clone(),
        })
        .collect();

    let merge_factor = if requires_merge { 1.5 } else { 1.0 };
    let sort_factor = 1.0 + 0.2 * parsed.options.sort.len() as f64;
    let estimated_cost = targets.len() as f64 * merge_factor * sort_factor;

    if estimated_cost > max_cost {
        return Err(DocError::InvalidQuery(format!(
            "plan cost {estimated_cost:.1} exceeds the limit of {max_cost:.0} \
             ({} shard targets)",
            targets.len()
        )));
    }

    Ok(QueryPlan {
        collection: parsed.collection.clone(),
        targets,
        parallel: true,
        requires_merge,
        estimated_cost,
        projection: parsed.projection.clone(),
        options: parsed.options.clone(),
    })
}

/// Breaks a wide fan-out into chunks of at most `max_per_plan` targets.
pub fn split_plan(plan: &QueryPlan, max_per_plan: usize) -> Vec<QueryPlan> {
    let max_per_plan = max_per_plan.max(1);
    if plan.targets.len() <= max_per_plan {
        return vec![plan.clone()];
    }
    plan.targets
        .chunks(max_per_plan)
        .map(|chunk| QueryPlan {
            collection: plan.collection.clone(),
            targets: chunk.to_vec(),
            parallel: plan.parallel,
            requires_merge: true,
            estimated_cost: plan.estimated_cost * chunk.len() as f64 / plan.targets.len() as f64,
            projection: plan.projection.clone(),
            options: plan.options.clone(),
        })
        .collect()
}
