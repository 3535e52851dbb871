//! Object identifiers.
//!
//! The server issues positive integer ids. Objects created while the client
//! cannot reach the server get a temporary id below 1 until the storage call
//! returns the permanent one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an object within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(i64);

impl ObjectId {
    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Creates the `n`-th temporary id (`-n`).
    #[must_use]
    pub const fn temporary(n: u32) -> Self {
        Self(-(n as i64))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// Returns true for client-assigned ids that the server has not confirmed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.0 < 1
    }
}

impl From<i64> for ObjectId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}
