//! Objects as stored on the server and in the local cache.

use crate::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-object version counter, bumped by the server on every write.
pub type Generation = u64;

/// A flat JSON record with a mandatory id and an optional generation number.
///
/// Serialized as `{"id": 5, "gn": 1, "title": "x", ...}`. Fields whose name
/// starts with `_` are client-side annotations and are stripped by
/// [`Object::intrinsic`] before the object is sent anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gn: Option<Generation>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Object {
    /// Creates an object with no fields and no generation number.
    pub fn new(id: impl Into<ObjectId>) -> Self {
        Self {
            id: id.into(),
            gn: None,
            fields: Map::new(),
        }
    }

    /// Sets the generation number.
    #[must_use]
    pub fn with_gn(mut self, gn: Generation) -> Self {
        self.gn = Some(gn);
        self
    }

    /// Sets a field.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Parses an object from a JSON value.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Looks up a field by name; `id` and `gn` resolve to the header fields.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::from(self.id.get())),
            "gn" => self.gn.map(Value::from),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Whether the id is still a client-assigned placeholder.
    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }

    /// Returns a copy without client-side (`_`-prefixed) fields.
    pub fn intrinsic(&self) -> Self {
        Self {
            id: self.id,
            gn: self.gn,
            fields: self
                .fields
                .iter()
                .filter(|(name, _)| !name.starts_with('_'))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}
