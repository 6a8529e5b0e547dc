//! Query filters
//!
//! A filter is the record-oriented query shape every operation accepts:
//! a list of conditions (implicitly AND-ed), an ordering, and an optional
//! limit/offset window. The router only ever inspects the top-level
//! conditions; the single-shard layer evaluates the whole thing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::Record;

/// A single predicate over record attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Evaluate this condition against a record.
    ///
    /// Missing attributes compare as null. Ordering comparisons between
    /// values of different kinds never match.
    pub fn matches(&self, record: &Record) -> bool {
        let get = |field: &str| record.get(field).unwrap_or(&Value::Null);

        match self {
            Condition::Eq(field, value) => values_equal(get(field), value),
            Condition::Ne(field, value) => !values_equal(get(field), value),
            Condition::Gt(field, value) => {
                compare_values(get(field), value) == Some(Ordering::Greater)
            }
            Condition::Gte(field, value) => matches!(
                compare_values(get(field), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(field, value) => compare_values(get(field), value) == Some(Ordering::Less),
            Condition::Lte(field, value) => matches!(
                compare_values(get(field), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::In(field, values) => values.iter().any(|v| values_equal(get(field), v)),
            Condition::And(all) => all.iter().all(|c| c.matches(record)),
            Condition::Or(any) => any.iter().any(|c| c.matches(record)),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Ordering clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

/// Record-oriented query filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "where", default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub order: Vec<Order>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl Filter {
    /// An empty filter: every record matches
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a single equality filter
    pub fn by(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().eq(field, value)
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(Condition::Eq(field.into(), value.into()))
    }

    /// Append a condition to the top-level conjunction
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a record satisfies every top-level condition
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Top-level equality conditions as a record, used to seed
    /// find-or-create payloads.
    pub fn equality_values(&self) -> Record {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                Condition::Eq(f, v) => Some((f.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Apply ordering and the limit/offset window to rows already known to match.
    pub fn apply_window(&self, mut rows: Vec<Record>) -> Vec<Record> {
        if !self.order.is_empty() {
            rows.sort_by(|a, b| {
                for order in &self.order {
                    let left = a.get(&order.field).unwrap_or(&Value::Null);
                    let right = b.get(&order.field).unwrap_or(&Value::Null);
                    let ord = compare_values(left, right).unwrap_or(Ordering::Equal);
                    let ord = match order.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        rows.into_iter().skip(offset).take(limit).collect()
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

/// Partial order over JSON scalars of the same kind
pub(crate) fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
