//! Query parsing and validation.
//!
//! Turns the loosely typed request body into a `ParsedQuery` with typed
//! filters, sort keys and pagination, rejecting anything malformed with
//! `INVALID_QUERY`. The expression tree currently carries a single AND level;
//! the `LogicalOp` seam exists so OR and set operators can slot in later.

use super::filter::{Filter, FilterOp, QueryOptions, SortDirection, SortKey};
use crate::document::validate_collection;
use crate::error::{DocError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterExpression {
    pub conditions: Vec<Filter>,
    #[serde(rename = "logicalOp")]
    pub logical_op: LogicalOp,
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub collection: String,
    pub expression: FilterExpression,
    pub projection: Option<Vec<String>>,
    pub options: QueryOptions,
}

/// Raw request body for `POST /api/data/{collection}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: Vec<RawFilter>,
    #[serde(default)]
    pub projection: Option<Vec<String>>,
    #[serde(default)]
    pub options: Option<RawOptions>,
    #[serde(default)]
    pub aggregations: Vec<RawAggregation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFilter {
    pub field: Option<String>,
    pub operator: Option<String>,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort: Vec<RawSort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSort {
    pub field: Option<String>,
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAggregation {
    #[serde(rename = "type")]
    pub agg_type: Option<String>,
    pub field: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
}

pub fn parse(collection: &str, request: &QueryRequest) -> Result<ParsedQuery> {
    validate_collection(collection)
        .map_err(|_| DocError::InvalidQuery(format!("invalid collection: {collection:?}")))?;

    let mut conditions = Vec::with_capacity(request.filters.len());
    for (i, raw) in request.filters.iter().enumerate() {
        let field = raw
            .field
            .as_deref()
            .filter(|field| !field.is_empty())
            .ok_or_else(|| DocError::InvalidQuery(format!("filter {i} is missing a field")))?;
        let operator = raw
            .operator
            .as_deref()
            .ok_or_else(|| DocError::InvalidQuery(format!("filter {i} is missing an operator")))?;
        let op = parse_operator(operator)?;
        let value = raw
            .value
            .clone()
            .ok_or_else(|| DocError::InvalidQuery(format!("filter {i} is missing a value")))?;
        conditions.push(Filter {
            field: field.to_string(),
            op,
            value,
        });
    }

    if let Some(projection) = &request.projection {
        for path in projection {
            if path.is_empty() || path.split('.').any(|segment| segment.is_empty()) {
                return Err(DocError::InvalidQuery(format!(
                    "invalid projection path: {path:?}"
                )));
            }
        }
    }

    let options = parse_options(request.options.as_ref())?;

    Ok(ParsedQuery {
        collection: collection.to_string(),
        expression: FilterExpression {
            conditions,
            logical_op: LogicalOp::And,
        },
        projection: request.projection.clone(),
        options,
    })
}

fn parse_operator(raw: &str) -> Result<FilterOp> {
    match raw {
        "=" => Ok(FilterOp::Eq),
        "!=" => Ok(FilterOp::Ne),
        ">" => Ok(FilterOp::Gt),
        ">=" => Ok(FilterOp::Gte),
        "<" => Ok(FilterOp::Lt),
        "<=" => Ok(FilterOp::Lte),
        other => Err(DocError::InvalidQuery(format!(
            "unsupported operator: {other:?}"
        ))),
    }
}

fn parse_options(raw: Option<&RawOptions>) -> Result<QueryOptions> {
    let Some(raw) = raw else {
        return Ok(QueryOptions::default());
    };

    let limit = match raw.limit {
        Some(limit) if limit < 0 => {
            return Err(DocError::InvalidQuery(format!("negative limit: {limit}")));
        }
        Some(limit) => Some(limit as usize),
        None => None,
    };
    let offset = match raw.offset {
        Some(offset) if offset < 0 => {
            return Err(DocError::InvalidQuery(format!("negative offset: {offset}")));
        }
        Some(offset) => Some(offset as usize),
        None => None,
    };

    let mut sort = Vec::with_capacity(raw.sort.len());
    for (i, key) in raw.sort.iter().enumerate() {
        let field = key
            .field
            .as_deref()
            .filter(|field| !field.is_empty())
            .ok_or_else(|| DocError::InvalidQuery(format!("sort key {i} is missing a field")))?;
        let direction = match key.direction.as_deref() {
            None | Some("asc") => SortDirection::Asc,
            Some("desc") => SortDirection::Desc,
            Some(other) => {
                return Err(DocError::InvalidQuery(format!(
                    "invalid sort direction: {other:?}"
                )));
            }
        };
        sort.push(SortKey {
            field: field.to_string(),
            direction,
        });
    }

    Ok(QueryOptions {
        limit,
        offset,
        sort,
    })
}
