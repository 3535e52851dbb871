//! Normalized search criteria.
//!
//! Criteria are a JSON object of filter terms. They are normalized on the way
//! in (keys sorted, scalar arrays sorted and de-duplicated) so two searches
//! asking the same thing compare equal no matter how the caller spelled them.

use crate::{Error, Object, ObjectId, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Terms whose effect on membership cannot be evaluated against a single
/// object.
const RANKING_KEYS: &[&str] = &["limit", "order", "offset"];

/// Filter terms of a search, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>", into = "BTreeMap<String, Value>")]
pub struct Criteria(BTreeMap<String, Value>);

impl Criteria {
    /// Empty criteria: everything in the table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds criteria from a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect::<BTreeMap<_, _>>().into()),
            Value::Null => Ok(Self::new()),
            other => Err(Error::InvalidCriteria(other.to_string())),
        }
    }

    /// Criteria selecting exactly the given ids.
    pub fn ids(ids: impl IntoIterator<Item = ObjectId>) -> Self {
        let list: Vec<Value> = ids.into_iter().map(|id| Value::from(id.get())).collect();
        Self::new().with("id", list)
    }

    /// Adds a term, normalizing its value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), normalize(value.into()));
        self
    }

    /// Returns a term.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Term names in sorted order; two criteria with the same keys have the
    /// same shape.
    pub fn shape(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// The explicit ids named by the `id` term, if any.
    pub fn explicit_ids(&self) -> Option<Vec<ObjectId>> {
        match self.0.get("id")? {
            Value::Number(n) => n.as_i64().map(|id| vec![ObjectId::new(id)]),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_i64().map(ObjectId::new))
                .collect(),
            _ => None,
        }
    }

    /// Evaluates the criteria against one object.
    ///
    /// Returns `None` when membership cannot be decided locally: a ranking
    /// term is present, the object lacks a filtered field, or a term is not a
    /// plain equality / membership test.
    pub fn matches(&self, object: &Object) -> Option<bool> {
        let mut decided = true;
        for (key, expected) in &self.0 {
            if RANKING_KEYS.contains(&key.as_str()) {
                decided = false;
                continue;
            }
            let Some(actual) = object.field(key) else {
                decided = false;
                continue;
            };
            match term_matches(expected, &actual) {
                Some(true) => {}
                Some(false) => return Some(false),
                None => decided = false,
            }
        }
        decided.then_some(true)
    }

    /// Like [`Criteria::matches`] but treats undecidable as a match.
    pub fn admits(&self, object: &Object) -> bool {
        self.matches(object) != Some(false)
    }

    /// The criteria as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect::<Map<_, _>>())
    }
}

impl From<BTreeMap<String, Value>> for Criteria {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map.into_iter().map(|(k, v)| (k, normalize(v))).collect())
    }
}

impl From<Criteria> for BTreeMap<String, Value> {
    fn from(criteria: Criteria) -> Self {
        criteria.0
    }
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut items: Vec<Value> = items.into_iter().map(normalize).collect();
            let numeric = items.iter().all(Value::is_number);
            let textual = items.iter().all(Value::is_string);
            if numeric || textual {
                items.sort_by(compare_scalars);
                items.dedup_by(|a, b| compare_scalars(a, b) == Ordering::Equal);
            }
            Value::Array(items)
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect(),
        ),
        other => other,
    }
}

fn compare_scalars(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_scalars(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

fn term_matches(expected: &Value, actual: &Value) -> Option<bool> {
    match (expected, actual) {
        (Value::Object(_), _) | (_, Value::Object(_)) => None,
        (Value::Array(wanted), Value::Array(have)) => {
            Some(have.iter().any(|h| wanted.iter().any(|w| scalar_eq(w, h))))
        }
        (Value::Array(wanted), scalar) => Some(wanted.iter().any(|w| scalar_eq(w, scalar))),
        (scalar, Value::Array(have)) => Some(have.iter().any(|h| scalar_eq(scalar, h))),
        (a, b) => Some(scalar_eq(a, b)),
    }
}
