//! Query criteria handed to the storage collaborator.
//!
//! Search terms carry typed values; criteria carry storage primitives,
//! normalized through the field's declared type so `"42"` and `42` select
//! the same rows of a numeric column. `Like` patterns stay text whatever the
//! column type. In-memory evaluation lives here too so
//! the memory backend and the cache's purge-on-remove agree on semantics.

use std::cmp::Ordering;

use concord_core::{
    coerce, raw_text, to_primitive, EntityJoin, EntityModel, FieldValue, Operator, PersistResult,
    Record, SearchTerm, SearchValue,
};
use regex::Regex;
use serde_json::Value;

/// One condition on a stored field.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    /// Candidate values; a row matches `Equals` when it equals any of them.
    pub values: Vec<Value>,
    /// Entity the field lives on when resolved through a join.
    pub join_entity: Option<String>,
}

impl Criterion {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            values: vec![value],
            join_entity: None,
        }
    }

    /// Equality on `field`.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, Operator::Equals, value)
    }

    /// Translate a search term, normalizing values through the field type.
    pub fn from_term(model: &EntityModel, term: &SearchTerm) -> PersistResult<Self> {
        let normalize = |value: &FieldValue| -> PersistResult<Value> {
            let primitive = to_primitive(value);
            if term.join_entity.is_some() || term.operator == Operator::Like {
                return Ok(primitive);
            }
            match model.field(&term.field) {
                Some(def) if !primitive.is_null() => {
                    Ok(to_primitive(&coerce(&term.field, &primitive, &def.field_type)?))
                }
                _ => Ok(primitive),
            }
        };
        let values = match &term.value {
            SearchValue::Value(value) => vec![normalize(value)?],
            SearchValue::Range(range) => range
                .clone()
                .map(|member| normalize(&FieldValue::Long(member)))
                .collect::<PersistResult<_>>()?,
        };
        Ok(Self {
            field: term.field.clone(),
            operator: term.operator,
            values,
            join_entity: term.join_entity.clone(),
        })
    }

    /// Evaluate against one stored row. A missing field reads as `null`.
    pub fn matches(&self, record: &Record) -> bool {
        let stored = record.get(&self.field).unwrap_or(&Value::Null);
        match self.operator {
            Operator::Equals => self
                .values
                .iter()
                .any(|v| compare_values(stored, v) == Some(Ordering::Equal)),
            Operator::NotEquals => self
                .values
                .iter()
                .all(|v| compare_values(stored, v) != Some(Ordering::Equal)),
            Operator::GreaterThan => self.any_ordering(stored, |o| o == Ordering::Greater),
            Operator::GreaterThanOrEqual => self.any_ordering(stored, |o| o != Ordering::Less),
            Operator::LessThan => self.any_ordering(stored, |o| o == Ordering::Less),
            Operator::LessThanOrEqual => self.any_ordering(stored, |o| o != Ordering::Greater),
            Operator::Like => {
                !stored.is_null()
                    && self
                        .values
                        .iter()
                        .any(|pattern| like(&raw_text(stored), &raw_text(pattern)))
            }
        }
    }

    fn any_ordering(&self, stored: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
        self.values
            .iter()
            .any(|v| compare_values(stored, v).is_some_and(&accept))
    }
}

/// Criteria for every term.
pub fn criteria_for(model: &EntityModel, terms: &[SearchTerm]) -> PersistResult<Vec<Criterion>> {
    terms.iter().map(|term| Criterion::from_term(model, term)).collect()
}

/// Ordering of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub fields: Vec<String>,
    pub descending: bool,
}

impl OrderBy {
    pub fn new<I, S>(fields: I, descending: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            descending,
        }
    }
}

/// A load request: criteria, optional order and the entity's joins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub criteria: Vec<Criterion>,
    pub order: Option<OrderBy>,
    pub joins: Vec<EntityJoin>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_order(mut self, order: Option<OrderBy>) -> Self {
        self.order = order;
        self
    }

    pub fn with_joins(mut self, joins: Vec<EntityJoin>) -> Self {
        self.joins = joins;
        self
    }
}

/// Total-ish order over storage primitives.
///
/// Numbers compare numerically, strings and booleans naturally, `null`
/// equals only `null`. Mixed kinds fall back to comparing their text.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (x, y) => Some(raw_text(x).cmp(&raw_text(y))),
    }
}

/// Sort rows by the order's fields; nulls sort first.
pub fn sort_records(records: &mut [Record], order: &OrderBy) {
    records.sort_by(|a, b| {
        let mut result = Ordering::Equal;
        for field in &order.fields {
            let x = a.get(field).unwrap_or(&Value::Null);
            let y = b.get(field).unwrap_or(&Value::Null);
            result = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => compare_values(x, y).unwrap_or(Ordering::Equal),
            };
            if result != Ordering::Equal {
                break;
            }
        }
        if order.descending {
            result.reverse()
        } else {
            result
        }
    });
}

/// SQL `LIKE` with `%` wildcards; every other character matches itself.
fn like(text: &str, pattern: &str) -> bool {
    let body: Vec<String> = pattern.split('%').map(regex::escape).collect();
    Regex::new(&format!("(?s)^{}$", body.join(".*"))).is_ok_and(|re| re.is_match(text))
}
