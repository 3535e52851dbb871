//! Remote transport abstraction.
//!
//! Defines the narrow contract the coordinator needs from the remote object
//! store (discovery, retrieval, storage, signatures) and from its session
//! service. [`crate::HttpTransport`] speaks it over HTTP; [`mock::MockRemote`]
//! serves it from memory.

use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remora_types::{Criteria, Generation, Location, Object, ObjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Ids and generation numbers of the objects matching a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub ids: Vec<ObjectId>,
    pub gns: Vec<Generation>,
}

impl Discovery {
    /// Maps each discovered id to its generation number.
    pub fn generations(&self) -> HashMap<ObjectId, Generation> {
        self.ids
            .iter()
            .copied()
            .zip(self.gns.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Body of a retrieval call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub ids: Vec<ObjectId>,
    /// Set for refreshes nobody is waiting on; servers may deprioritize them.
    pub background: bool,
}

/// Body of a storage call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub objects: Vec<Value>,
}

/// Response of a signature call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResponse {
    pub signature: String,
}

/// Body of a session creation call. `handle` is set when an authorized
/// device requests an activation handle for a mobile device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub area: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Body of a password authentication call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRequest {
    pub handle: String,
    pub username: String,
    pub password: String,
}

/// Session state as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Expiration time.
    #[serde(default)]
    pub etime: Option<DateTime<Utc>>,
}

/// `{"session": {...}}` wrapper used by every session endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub session: SessionInfo,
}

/// Remote object store and session service.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Lists ids and generation numbers of objects matching `criteria`.
    async fn discover(
        &self,
        location: &Location,
        criteria: &Criteria,
        token: &str,
    ) -> SyncResult<Discovery>;

    /// Fetches full objects by id.
    async fn retrieve(
        &self,
        location: &Location,
        ids: &[ObjectId],
        background: bool,
        token: &str,
    ) -> SyncResult<Vec<Object>>;

    /// Saves objects; the response lists the stored objects in request order.
    async fn store(
        &self,
        location: &Location,
        objects: &[Value],
        token: &str,
    ) -> SyncResult<Vec<Object>>;

    /// Fetches the opaque version token of a schema.
    async fn signature(&self, address: &str, schema: &str, token: &str) -> SyncResult<String>;

    /// Creates a session (or a mobile activation handle).
    async fn create_session(
        &self,
        address: &str,
        request: &SessionRequest,
    ) -> SyncResult<SessionInfo>;

    /// Polls a session by handle.
    async fn fetch_session(&self, address: &str, handle: &str) -> SyncResult<SessionInfo>;

    /// Authenticates a session with a username and password.
    async fn authenticate(
        &self,
        address: &str,
        request: &PasswordRequest,
    ) -> SyncResult<SessionInfo>;

    /// Terminates a session.
    async fn delete_session(&self, address: &str, handle: &str) -> SyncResult<()>;
}

/// An in-memory remote store for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use remora_types::SchemaKey;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::Semaphore;

    /// Remote calls, for counting and fault injection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Action {
        Discovery,
        Retrieval,
        Storage,
        Signature,
        Session,
    }

    #[derive(Debug, Default)]
    struct Account {
        password: String,
        user_id: i64,
    }

    #[derive(Debug)]
    struct MockState {
        tables: HashMap<Location, BTreeMap<ObjectId, Object>>,
        signatures: HashMap<SchemaKey, String>,
        next_id: i64,
        failures: VecDeque<(Action, SyncError)>,
        unreachable: bool,
        calls: HashMap<Action, usize>,
        retrieved: Vec<ObjectId>,
        stored: Vec<Vec<Value>>,
        sessions: HashMap<String, SessionInfo>,
        accounts: HashMap<String, Account>,
        next_handle: u64,
        gates: HashMap<Action, Arc<Semaphore>>,
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                tables: HashMap::new(),
                signatures: HashMap::new(),
                next_id: 1,
                failures: VecDeque::new(),
                unreachable: false,
                calls: HashMap::new(),
                retrieved: Vec::new(),
                stored: Vec::new(),
                sessions: HashMap::new(),
                accounts: HashMap::new(),
                next_handle: 1,
                gates: HashMap::new(),
            }
        }
    }

    /// An in-memory [`RemoteTransport`] serving every address from one set
    /// of tables.
    #[derive(Debug, Default)]
    pub struct MockRemote {
        state: Mutex<MockState>,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Puts objects on the server as-is.
        pub fn insert(&self, location: &Location, objects: impl IntoIterator<Item = Object>) {
            let mut state = self.state();
            let table = state.tables.entry(location.clone()).or_default();
            for object in objects {
                table.insert(object.id, object);
            }
        }

        /// Deletes an object on the server without telling anyone.
        pub fn delete(&self, location: &Location, id: ObjectId) {
            if let Some(table) = self.state().tables.get_mut(location) {
                table.remove(&id);
            }
        }

        /// Reads an object back.
        pub fn get(&self, location: &Location, id: ObjectId) -> Option<Object> {
            self.state()
                .tables
                .get(location)
                .and_then(|table| table.get(&id))
                .cloned()
        }

        /// Sets the id the next created object receives.
        pub fn set_next_id(&self, id: i64) {
            self.state().next_id = id;
        }

        /// Sets a schema signature.
        pub fn set_signature(&self, address: &str, schema: &str, signature: &str) {
            self.state()
                .signatures
                .insert(SchemaKey::new(address, schema), signature.to_string());
        }

        /// Makes the next call of `action` fail with `error`.
        pub fn fail_next(&self, action: Action, error: SyncError) {
            self.state().failures.push_back((action, error));
        }

        /// Makes every call fail with a network error until cleared.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.state().unreachable = unreachable;
        }

        /// Holds calls of `action` until [`MockRemote::resume`].
        pub fn pause(&self, action: Action) {
            self.state()
                .gates
                .insert(action, Arc::new(Semaphore::new(0)));
        }

        /// Releases calls held by [`MockRemote::pause`].
        pub fn resume(&self, action: Action) {
            if let Some(gate) = self.state().gates.remove(&action) {
                gate.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        }

        /// Number of calls made of `action`.
        pub fn calls(&self, action: Action) -> usize {
            self.state().calls.get(&action).copied().unwrap_or(0)
        }

        /// Every id requested through retrieval so far.
        pub fn retrieved_ids(&self) -> Vec<ObjectId> {
            self.state().retrieved.clone()
        }

        /// Bodies of every storage call so far.
        pub fn stored_batches(&self) -> Vec<Vec<Value>> {
            self.state().stored.clone()
        }

        /// Registers an account for password authentication.
        pub fn add_account(&self, username: &str, password: &str, user_id: i64) {
            self.state().accounts.insert(
                username.to_string(),
                Account {
                    password: password.to_string(),
                    user_id,
                },
            );
        }

        /// Authorizes a session out of band (as an OAuth callback would).
        pub fn approve_session(&self, handle: &str, user_id: i64) {
            let mut state = self.state();
            let token = format!("token-{handle}");
            if let Some(session) = state.sessions.get_mut(handle) {
                session.token = Some(token);
                session.user_id = Some(user_id);
            }
        }

        /// Whether the server still knows the session.
        pub fn has_session(&self, handle: &str) -> bool {
            self.state().sessions.contains_key(handle)
        }

        async fn enter(&self, action: Action) -> SyncResult<()> {
            let gate = {
                let mut state = self.state();
                *state.calls.entry(action).or_default() += 1;
                state.gates.get(&action).cloned()
            };
            // Stay in flight for at least one poll, like a real request.
            tokio::task::yield_now().await;
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let mut state = self.state();
            if state.unreachable {
                return Err(SyncError::Network("connection refused".into()));
            }
            if let Some(pos) = state.failures.iter().position(|(a, _)| *a == action) {
                if let Some((_, error)) = state.failures.remove(pos) {
                    return Err(error);
                }
            }
            Ok(())
        }

        fn new_handle(state: &mut MockState) -> String {
            let handle = format!("h{}", state.next_handle);
            state.next_handle += 1;
            handle
        }
    }

    #[async_trait]
    impl RemoteTransport for MockRemote {
        async fn discover(
            &self,
            location: &Location,
            criteria: &Criteria,
            _token: &str,
        ) -> SyncResult<Discovery> {
            self.enter(Action::Discovery).await?;
            let state = self.state();
            let mut discovery = Discovery::default();
            if let Some(table) = state.tables.get(location) {
                for object in table.values().filter(|o| criteria.admits(o)) {
                    discovery.ids.push(object.id);
                    discovery.gns.push(object.gn.unwrap_or(0));
                }
            }
            Ok(discovery)
        }

        async fn retrieve(
            &self,
            location: &Location,
            ids: &[ObjectId],
            _background: bool,
            _token: &str,
        ) -> SyncResult<Vec<Object>> {
            self.enter(Action::Retrieval).await?;
            let mut state = self.state();
            state.retrieved.extend_from_slice(ids);
            let Some(table) = state.tables.get(location) else {
                return Ok(Vec::new());
            };
            Ok(ids.iter().filter_map(|id| table.get(id)).cloned().collect())
        }

        async fn store(
            &self,
            location: &Location,
            objects: &[Value],
            _token: &str,
        ) -> SyncResult<Vec<Object>> {
            self.enter(Action::Storage).await?;
            let mut state = self.state();
            state.stored.push(objects.to_vec());
            let mut saved = Vec::with_capacity(objects.len());
            for value in objects {
                let id = value.get("id").and_then(Value::as_i64).map(ObjectId::new);
                let deleted = value.get("deleted").and_then(Value::as_bool) == Some(true);
                let id = match id {
                    Some(id) => id,
                    None => {
                        let id = ObjectId::new(state.next_id);
                        state.next_id += 1;
                        id
                    }
                };
                let table = state.tables.entry(location.clone()).or_default();
                let gn = table.get(&id).and_then(|o| o.gn).unwrap_or(0) + 1;
                if deleted {
                    table.remove(&id);
                    saved.push(Object::new(id).with_gn(gn).with("deleted", true));
                    continue;
                }
                let mut object = Object::from_value(value.clone())
                    .or_else(|_| {
                        let mut v = value.clone();
                        if let Value::Object(map) = &mut v {
                            map.insert("id".into(), Value::from(id.get()));
                        }
                        Object::from_value(v)
                    })
                    .map_err(|e| SyncError::Http {
                        status: 400,
                        message: e.to_string(),
                    })?;
                object.id = id;
                object.gn = Some(gn);
                table.insert(id, object.clone());
                saved.push(object);
            }
            Ok(saved)
        }

        async fn signature(&self, address: &str, schema: &str, _token: &str) -> SyncResult<String> {
            self.enter(Action::Signature).await?;
            Ok(self
                .state()
                .signatures
                .get(&SchemaKey::new(address, schema))
                .cloned()
                .unwrap_or_else(|| "initial".to_string()))
        }

        async fn create_session(
            &self,
            address: &str,
            request: &SessionRequest,
        ) -> SyncResult<SessionInfo> {
            self.enter(Action::Session).await?;
            let mut state = self.state();
            let handle = Self::new_handle(&mut state);
            let mut info = SessionInfo {
                handle: Some(handle.clone()),
                ..SessionInfo::default()
            };
            if let Some(parent) = &request.handle {
                let user_id = state
                    .sessions
                    .get(parent)
                    .filter(|s| s.token.is_some())
                    .and_then(|s| s.user_id)
                    .ok_or_else(|| SyncError::Unauthorized {
                        address: address.to_string(),
                    })?;
                info.token = Some(format!("token-{handle}"));
                info.user_id = Some(user_id);
            }
            state.sessions.insert(handle.clone(), info);
            Ok(SessionInfo {
                handle: Some(handle),
                ..SessionInfo::default()
            })
        }

        async fn fetch_session(&self, address: &str, handle: &str) -> SyncResult<SessionInfo> {
            self.enter(Action::Session).await?;
            self.state()
                .sessions
                .get(handle)
                .cloned()
                .ok_or_else(|| SyncError::Unauthorized {
                    address: address.to_string(),
                })
        }

        async fn authenticate(
            &self,
            address: &str,
            request: &PasswordRequest,
        ) -> SyncResult<SessionInfo> {
            self.enter(Action::Session).await?;
            let mut state = self.state();
            let user_id = match state.accounts.get(&request.username) {
                Some(account) if account.password == request.password => account.user_id,
                _ => {
                    return Err(SyncError::Unauthorized {
                        address: address.to_string(),
                    });
                }
            };
            let session = state.sessions.get_mut(&request.handle).ok_or_else(|| {
                SyncError::Unauthorized {
                    address: address.to_string(),
                }
            })?;
            session.token = Some(format!("token-{}", request.handle));
            session.user_id = Some(user_id);
            Ok(session.clone())
        }

        async fn delete_session(&self, _address: &str, handle: &str) -> SyncResult<()> {
            self.enter(Action::Session).await?;
            self.state().sessions.remove(handle);
            Ok(())
        }
    }
}
