//! Filter and sort evaluation over dynamic documents.
//!
//! Field access uses dotted paths (`a.b.c`) against the flattened document
//! JSON. A missing path resolves to *undefined*, which never compares: every
//! operator is false against it except `!=`, which is true. Comparisons are
//! only defined between two numbers, two strings, or two booleans; anything
//! else is incomparable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    #[serde(rename = "operator")]
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,
}

/// Resolves a dotted path against a JSON object tree.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Equality with numeric coercion: `25` and `25.0` are the same value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between two values, when one exists.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return Some(x.total_cmp(&y));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Filter {
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = lookup_path(doc, &self.field) else {
            // Undefined equals nothing and orders against nothing.
            return self.op == FilterOp::Ne;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Ne => !values_equal(actual, &self.value),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// AND semantics: every filter must hold.
pub fn matches_all(filters: &[Filter], doc: &Value) -> bool {
    filters.iter().all(|filter| filter.matches(doc))
}

/// Multi-key comparator. Incomparable or missing values tie and fall through
/// to the next key, so the caller's stable sort preserves input order.
pub fn compare_by_sort_keys(a: &Value, b: &Value, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let av = lookup_path(a, &key.field);
        let bv = lookup_path(b, &key.field);
        let ordering = match (av, bv) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        };
        let ordering = match key.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
