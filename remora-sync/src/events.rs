//! Signals delivered to subscribers of [`crate::SyncCoordinator::subscribe`].

use crate::session::SessionKind;
use remora_types::{Criteria, Location};

/// Events emitted by the coordinator, always after the state change they
/// describe has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Data visible to searches changed; re-run `find`.
    Change,
    /// A session became authorized.
    Authorization { address: String, kind: SessionKind },
    /// A remote call needs a session that does not exist or is not
    /// authorized yet.
    AuthenticationRequired { address: String },
    /// The session expired or the server revoked it.
    Expiration { address: String },
    /// The user may not access a schema.
    Violation {
        address: String,
        schema: Option<String>,
    },
    /// A required search could not be satisfied by the server.
    Stupefaction {
        location: Location,
        criteria: Criteria,
    },
    /// The schema signature changed and its cached objects were dropped.
    SchemaPurged {
        address: String,
        schema: String,
        removed: usize,
    },
    /// A session was ended on request.
    SessionEnded { address: String },
}
