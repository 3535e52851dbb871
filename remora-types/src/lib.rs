//! Core type definitions for Remora.
//!
//! This crate defines the plain data types shared by the sync engine and the
//! code embedding it:
//! - Object identifiers (permanent server ids and temporary client ids)
//! - Locations (`address / schema / table`)
//! - Objects as flat JSON records carrying an id and a generation number
//! - Normalized search criteria
//! - Change notifications pushed by the server
//!
//! Nothing in here performs I/O.

mod criteria;
mod ids;
mod location;
mod notification;
mod object;

pub use criteria::Criteria;
pub use ids::ObjectId;
pub use location::{LOCAL_ADDRESS, Location, SchemaKey};
pub use notification::{ChangeNotification, TableChanges};
pub use object::{Generation, Object};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("criteria must be a JSON object, got {0}")]
    InvalidCriteria(String),

    #[error("invalid table key '{0}', expected 'schema.table'")]
    InvalidTableKey(String),

    #[error("mismatched change list for {table}: {ids} ids but {gns} generation numbers")]
    MismatchedChanges { table: String, ids: usize, gns: usize },
}
