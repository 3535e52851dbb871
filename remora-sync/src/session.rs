//! Per-server authentication state.

use crate::coalesce::Coalescer;
use crate::transport::SessionInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Which device role a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// The session this device uses for its own requests.
    Primary,
    /// An activation handle issued for another (mobile) device.
    Mobile,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Primary => write!(f, "primary"),
            SessionKind::Mobile => write!(f, "mobile"),
        }
    }
}

/// Authentication state with one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub address: String,
    pub kind: SessionKind,
    pub handle: String,
    /// Set once the server has authorized the session.
    pub token: Option<String>,
    pub user_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A session that has a handle but no token yet.
    pub fn pending(address: impl Into<String>, kind: SessionKind, handle: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind,
            handle: handle.into(),
            token: None,
            user_id: None,
            expires_at: None,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.token.is_some()
    }

    /// Whether the session expires before `now + grace`.
    pub fn expires_within(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(grace)
            .is_none_or(|deadline| expires_at <= deadline)
    }

    /// Folds a server response into this session. Returns true if the
    /// session became authorized.
    pub fn apply(&mut self, info: SessionInfo) -> bool {
        let was_authorized = self.is_authorized();
        if let Some(handle) = info.handle {
            self.handle = handle;
        }
        if info.token.is_some() {
            self.token = info.token;
        }
        if info.user_id.is_some() {
            self.user_id = info.user_id;
        }
        if info.etime.is_some() {
            self.expires_at = info.etime;
        }
        !was_authorized && self.is_authorized()
    }
}

/// Sessions keyed by `(address, kind)`.
///
/// Created by the embedder (optionally pre-filled from persisted sessions)
/// and handed to [`crate::SyncCoordinator::new`].
pub struct SessionRegistry {
    sessions: Mutex<HashMap<(String, SessionKind), Session>>,
    pub(crate) calls: Coalescer<String, SessionInfo>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            calls: Coalescer::new(),
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.lock().len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from previously persisted sessions.
    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let registry = Self::new();
        for session in sessions {
            registry.insert(session);
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, SessionKind), Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, address: &str, kind: SessionKind) -> Option<Session> {
        self.lock().get(&(address.to_string(), kind)).cloned()
    }

    /// Stores a session, replacing any previous one of the same kind.
    pub fn insert(&self, session: Session) -> Option<Session> {
        self.lock()
            .insert((session.address.clone(), session.kind), session)
    }

    pub fn remove(&self, address: &str, kind: SessionKind) -> Option<Session> {
        self.lock().remove(&(address.to_string(), kind))
    }

    /// Removes every session with `address`.
    pub fn remove_all(&self, address: &str) -> Vec<Session> {
        let mut sessions = self.lock();
        let keys: Vec<_> = sessions
            .keys()
            .filter(|(a, _)| a == address)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| sessions.remove(&key))
            .collect()
    }

    /// Applies `update` to a stored session. Returns the updated copy.
    pub fn update(
        &self,
        address: &str,
        kind: SessionKind,
        update: impl FnOnce(&mut Session),
    ) -> Option<Session> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(&(address.to_string(), kind))?;
        update(session);
        Some(session.clone())
    }

    /// Every stored session, for persistence.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| {
            (&a.address, a.kind as u8).cmp(&(&b.address, b.kind as u8))
        });
        sessions
    }
}
