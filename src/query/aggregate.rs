//! Aggregations over a merged result set.
//!
//! Numeric aggregations silently skip non-numeric values: `SUM`/`AVG` treat
//! them as absent, `MIN`/`MAX` return null when nothing numeric matched, and
//! `AVG` of an empty numeric set is 0. `GROUP_BY` partitions by the tuple of
//! values at the named paths, rendering undefined as the literal `"null"`.

use super::filter::lookup_path;
use super::parser::RawAggregation;
use crate::error::{DocError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationSpec {
    Count { field: Option<String> },
    Sum { field: String },
    Avg { field: String },
    Min { field: String },
    Max { field: String },
    GroupBy { fields: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Value>,
}

/// Validates the raw aggregation specs from a query request.
pub fn parse_aggregations(raw: &[RawAggregation]) -> Result<Vec<AggregationSpec>> {
    let mut specs = Vec::with_capacity(raw.len());
    for (i, agg) in raw.iter().enumerate() {
        let agg_type = agg
            .agg_type
            .as_deref()
            .ok_or_else(|| DocError::InvalidQuery(format!("aggregation {i} is missing a type")))?;

        let require_field = || {
            agg.field.clone().ok_or_else(|| {
                DocError::InvalidQuery(format!("aggregation {agg_type} requires a field"))
            })
        };

        let spec = match agg_type {
            "COUNT" => AggregationSpec::Count {
                field: agg.field.clone(),
            },
            "SUM" => AggregationSpec::Sum {
                field: require_field()?,
            },
            "AVG" => AggregationSpec::Avg {
                field: require_field()?,
            },
            "MIN" => AggregationSpec::Min {
                field: require_field()?,
            },
            "MAX" => AggregationSpec::Max {
                field: require_field()?,
            },
            "GROUP_BY" => {
                let mut fields = agg.fields.clone();
                if fields.is_empty() {
                    if let Some(field) = &agg.field {
                        fields.push(field.clone());
                    }
                }
                if fields.is_empty() {
                    return Err(DocError::InvalidQuery(
                        "GROUP_BY requires at least one field".into(),
                    ));
                }
                AggregationSpec::GroupBy { fields }
            }
            other => {
                return Err(DocError::InvalidQuery(format!(
                    "unsupported aggregation: {other:?}"
                )));
            }
        };
        specs.push(spec);
    }
    Ok(specs)
}

pub fn aggregate(rows: &[Value], specs: &[AggregationSpec]) -> Vec<AggregationResult> {
    specs.iter().map(|spec| run_one(rows, spec)).collect()
}

fn run_one(rows: &[Value], spec: &AggregationSpec) -> AggregationResult {
    match spec {
        AggregationSpec::Count { field } => {
            let value = match field {
                None => rows.len(),
                Some(path) => rows
                    .iter()
                    .filter(|row| lookup_path(row, path).is_some())
                    .count(),
            };
            AggregationResult {
                op: "COUNT".into(),
                field: field.clone(),
                value: json!(value),
                groups: None,
            }
        }
        AggregationSpec::Sum { field } => AggregationResult {
            op: "SUM".into(),
            field: Some(field.clone()),
            value: json!(numeric_values(rows, field).into_iter().sum::<f64>()),
            groups: None,
        },
        AggregationSpec::Avg { field } => {
            let numbers = numeric_values(rows, field);
            let value = if numbers.is_empty() {
                0.0
            } else {
                numbers.iter().sum::<f64>() / numbers.len() as f64
            };
            AggregationResult {
                op: "AVG".into(),
                field: Some(field.clone()),
                value: json!(value),
                groups: None,
            }
        }
        AggregationSpec::Min { field } => AggregationResult {
            op: "MIN".into(),
            field: Some(field.clone()),
            value: numeric_values(rows, field)
                .into_iter()
                .min_by(|a, b| a.total_cmp(b))
                .map(|n| json!(n))
                .unwrap_or(Value::Null),
            groups: None,
        },
        AggregationSpec::Max { field } => AggregationResult {
            op: "MAX".into(),
            field: Some(field.clone()),
            value: numeric_values(rows, field)
                .into_iter()
                .max_by(|a, b| a.total_cmp(b))
                .map(|n| json!(n))
                .unwrap_or(Value::Null),
            groups: None,
        },
        AggregationSpec::GroupBy { fields } => group_by(rows, fields),
    }
}

fn numeric_values(rows: &[Value], path: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|row| lookup_path(row, path).and_then(Value::as_f64))
        .collect()
}

fn group_by(rows: &[Value], fields: &[String]) -> AggregationResult {
    let mut groups: BTreeMap<String, (Map<String, Value>, Vec<Value>)> = BTreeMap::new();

    for row in rows {
        let values: Vec<Value> = fields
            .iter()
            .map(|field| {
                lookup_path(row, field)
                    .cloned()
                    .unwrap_or_else(|| Value::String("null".into()))
            })
            .collect();
        let key = values
            .iter()
            .map(render_key)
            .collect::<Vec<String>>()
            .join("|");

        let entry = groups.entry(key).or_insert_with(|| {
            let mut label = Map::new();
            for (field, value) in fields.iter().zip(values.iter()) {
                label.insert(field.clone(), value.clone());
            }
            (label, Vec::new())
        });
        entry.1.push(row.clone());
    }

    let group_count = groups.len();
    let mut rendered = Map::new();
    for (key, (label, documents)) in groups {
        let mut group = label;
        group.insert("count".into(), json!(documents.len()));
        group.insert("documents".into(), Value::Array(documents));
        rendered.insert(key, Value::Object(group));
    }

    AggregationResult {
        op: "GROUP_BY".into(),
        field: None,
        value: json!(group_count),
        groups: Some(Value::Object(rendered)),
    }
}

fn render_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
