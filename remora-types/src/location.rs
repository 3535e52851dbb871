//! Where objects live.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of the on-device pseudo server. Locations using it never touch the
/// network.
pub const LOCAL_ADDRESS: &str = "local";

/// A table on a server: `{address, schema, table}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Server base URL, or [`LOCAL_ADDRESS`].
    pub address: String,
    /// Namespace within the server (a project, or `global`).
    pub schema: String,
    /// Object collection.
    pub table: String,
}

impl Location {
    /// Creates a location.
    pub fn new(
        address: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Creates a location on the local pseudo server.
    pub fn local(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(LOCAL_ADDRESS, schema, table)
    }

    /// Whether this location is served from the device only.
    pub fn is_local(&self) -> bool {
        self.address == LOCAL_ADDRESS
    }

    /// The `(address, schema)` pair this location belongs to.
    pub fn schema_key(&self) -> SchemaKey {
        SchemaKey::new(&self.address, &self.schema)
    }

    /// Resolves a `schema.table` notification key on `address`, splitting on
    /// the first dot.
    pub fn from_table_key(address: &str, key: &str) -> crate::Result<Self> {
        match key.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(address, schema, table))
            }
            _ => Err(crate::Error::InvalidTableKey(key.to_string())),
        }
    }

    /// The `schema.table` key used by change notifications.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.schema, self.table)
    }
}

/// A schema on a server; the unit of signature validation and cache purges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaKey {
    pub address: String,
    pub schema: String,
}

impl SchemaKey {
    pub fn new(address: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            schema: schema.into(),
        }
    }

    /// Whether `location` lies within this schema.
    pub fn contains(&self, location: &Location) -> bool {
        self.address == location.address && self.schema == location.schema
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.schema)
    }
}
