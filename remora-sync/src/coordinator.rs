//! The sync coordinator: searches, the change queue, invalidation, and
//! session lifecycle over one local cache and one remote transport.

use crate::cache::LocalCache;
use crate::change::{ChangeEntry, ChangeOptions, ChangeRequest, ChangeSummary, PendingChange};
use crate::coalesce::Coalescer;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::identity::IdentityMap;
use crate::prefetch::{self, PrefetchScheduler};
use crate::search::{Query, SearchRequest, SearchStatus};
use crate::session::{Session, SessionKind, SessionRegistry};
use crate::transport::{PasswordRequest, RemoteTransport, SessionInfo, SessionRequest};
use chrono::Utc;
use futures::StreamExt;
use remora_types::{
    ChangeNotification, Criteria, Generation, LOCAL_ADDRESS, Location, Object, ObjectId,
    SchemaKey, TableChanges,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Schema and table under the local address where verified schema
/// signatures are kept.
const SIGNATURE_SCHEMA: &str = "remora";
const SIGNATURE_TABLE: &str = "signatures";

/// Generations of the objects one committed request stored.
#[derive(Debug)]
struct Committed {
    location: Location,
    objects: Vec<(ObjectId, Generation)>,
}

struct Watcher {
    location: Location,
    id: ObjectId,
    tx: oneshot::Sender<()>,
}

struct EngineState {
    /// Most recently used first.
    searches: Vec<SearchRequest>,
    /// Queued and dispatched requests in queue order.
    changes: Vec<ChangeRequest>,
    recent: VecDeque<Committed>,
    identities: IdentityMap,
    watchers: Vec<Watcher>,
    signatures: HashMap<SchemaKey, String>,
    online: bool,
    foreground: bool,
}

impl EngineState {
    fn search(&self, id: u64) -> Option<&SearchRequest> {
        self.searches.iter().find(|search| search.id == id)
    }

    fn search_mut(&mut self, id: u64) -> Option<&mut SearchRequest> {
        self.searches.iter_mut().find(|search| search.id == id)
    }

    fn change_mut(&mut self, id: u64) -> Option<&mut ChangeRequest> {
        self.changes.iter_mut().find(|change| change.id == id)
    }

    /// Whether `id` at `location` is a write of ours: in flight, or
    /// committed recently at a generation at least `gn`.
    fn is_own_change(&self, location: &Location, id: ObjectId, gn: Generation) -> bool {
        let in_flight = self
            .changes
            .iter()
            .any(|change| change.location == *location && change.is_dispatched() && change.touches(id));
        in_flight
            || self.recent.iter().any(|committed| {
                committed.location == *location
                    && committed
                        .objects
                        .iter()
                        .any(|(saved_id, saved_gn)| *saved_id == id && gn <= *saved_gn)
            })
    }

    /// Removes least recently used idle searches beyond `capacity`.
    fn evict_searches(&mut self, capacity: usize) {
        while self.searches.len() > capacity {
            let Some(index) = self.searches.iter().rposition(|search| !search.updating) else {
                break;
            };
            let evicted = self.searches.remove(index);
            debug!("evicted search {} at {}", evicted.id, evicted.location);
        }
    }
}

struct Inner {
    config: SyncConfig,
    cache: Arc<dyn LocalCache>,
    remote: Arc<dyn RemoteTransport>,
    sessions: SessionRegistry,
    state: Mutex<EngineState>,
    events: broadcast::Sender<SyncEvent>,
    refreshes: Coalescer<u64, ()>,
    validations: Coalescer<SchemaKey, bool>,
    prefetch: PrefetchScheduler,
    next_search_id: AtomicU64,
    next_change_id: AtomicU64,
    next_temporary: AtomicU32,
}

/// Mediates between the local cache and the remote store.
///
/// Cheap to clone; clones share all state. Must be used from within a Tokio
/// runtime, as writes and background refreshes run on spawned tasks.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.sessions)
            .finish()
    }
}

impl SyncCoordinator {
    /// Creates a coordinator. Fails if `config` is invalid.
    pub fn new(
        config: SyncConfig,
        cache: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteTransport>,
        sessions: SessionRegistry,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let prefetch = PrefetchScheduler::new(config.prefetch_debounce());
        let inner = Inner {
            config,
            cache,
            remote,
            sessions,
            state: Mutex::new(EngineState {
                searches: Vec::new(),
                changes: Vec::new(),
                recent: VecDeque::new(),
                identities: IdentityMap::new(),
                watchers: Vec::new(),
                signatures: HashMap::new(),
                online: true,
                foreground: true,
            }),
            events,
            refreshes: Coalescer::new(),
            validations: Coalescer::new(),
            prefetch,
            next_search_id: AtomicU64::new(1),
            next_change_id: AtomicU64::new(1),
            next_temporary: AtomicU32::new(0),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Receives [`SyncEvent`]s emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Hands out the next temporary id (-1, -2, ...) for an object created
    /// on this device.
    pub fn next_temporary_id(&self) -> ObjectId {
        let n = self.inner.next_temporary.fetch_add(1, Ordering::Relaxed) + 1;
        ObjectId::temporary(n)
    }

    // ── Searches ─────────────────────────────────────────────────

    /// Answers a query from the cache and, when the local answer is not good
    /// enough, from the server.
    ///
    /// The returned array is shared with the search; a repeated `find` that
    /// returns the same `Arc` (by [`Arc::ptr_eq`]) saw no change.
    pub async fn find(&self, query: Query) -> SyncResult<Arc<Vec<Object>>> {
        self.inner.find(query).await
    }

    /// Snapshot of the remembered searches, most recently used first.
    pub async fn searches(&self) -> Vec<SearchRequest> {
        self.inner.state.lock().await.searches.clone()
    }

    /// Compares the server's schema signature with the one last verified
    /// and purges the schema's cached objects on mismatch. Returns true if
    /// a purge happened.
    pub async fn validate_cache(&self, address: &str, schema: &str) -> SyncResult<bool> {
        let result = self
            .inner
            .validate_cache(&SchemaKey::new(address, schema))
            .await;
        if let Err(e) = &result {
            self.inner.on_remote_error(e);
        }
        result
    }

    // ── Changes ──────────────────────────────────────────────────

    /// Saves objects and waits for the server to store them. Resolves to an
    /// empty list if the write was canceled.
    pub async fn save(
        &self,
        location: &Location,
        objects: Vec<Object>,
        options: ChangeOptions,
    ) -> SyncResult<Arc<Vec<Object>>> {
        self.queue_save(location, objects, options).await?.wait().await
    }

    /// Removes objects and waits for the server to confirm.
    pub async fn remove(
        &self,
        location: &Location,
        objects: Vec<Object>,
    ) -> SyncResult<Arc<Vec<Object>>> {
        self.queue_remove(location, objects, ChangeOptions::default())
            .await?
            .wait()
            .await
    }

    /// Queues a save without waiting for it.
    pub async fn queue_save(
        &self,
        location: &Location,
        objects: Vec<Object>,
        options: ChangeOptions,
    ) -> SyncResult<PendingChange> {
        let entries = objects.into_iter().map(ChangeEntry::save).collect();
        self.inner.queue(location, entries, options).await
    }

    /// Queues a removal without waiting for it.
    pub async fn queue_remove(
        &self,
        location: &Location,
        objects: Vec<Object>,
        options: ChangeOptions,
    ) -> SyncResult<PendingChange> {
        let entries = objects.into_iter().map(ChangeEntry::remove).collect();
        self.inner.queue(location, entries, options).await
    }

    /// Queued and in-flight requests in queue order.
    pub async fn pending_changes(&self) -> Vec<ChangeSummary> {
        let state = self.inner.state.lock().await;
        state.changes.iter().map(ChangeSummary::from).collect()
    }

    /// Dispatches every queued request again, e.g. after a failure.
    pub async fn retry_changes(&self) {
        self.inner.pump_all().await;
    }

    /// Cancels a queued or in-flight request. A response to an in-flight
    /// request arriving later is ignored. Returns false if no such request
    /// exists.
    pub async fn cancel_change(&self, id: u64) -> bool {
        let location = {
            let mut state = self.inner.state.lock().await;
            let Some(index) = state.changes.iter().position(|c| c.answers_to(id)) else {
                return false;
            };
            let mut request = state.changes.remove(index);
            request.cancel();
            info!("canceled change {} at {}", request.id, request.location);
            request.location
        };
        self.inner.emit(SyncEvent::Change);
        self.inner.pump(&location);
        true
    }

    /// Permanent id issued for a temporary one.
    pub async fn permanent_id(&self, location: &Location, temporary: ObjectId) -> Option<ObjectId> {
        let state = self.inner.state.lock().await;
        state.identities.permanent_for(location, temporary)
    }

    /// Temporary id an object was created under.
    pub async fn temporary_id(&self, location: &Location, permanent: ObjectId) -> Option<ObjectId> {
        let state = self.inner.state.lock().await;
        state.identities.temporary_for(location, permanent)
    }

    // ── Invalidation ─────────────────────────────────────────────

    /// Marks data from `address` as changed. `None` means anything may have
    /// changed; otherwise `changes` lists `(id, gn)` per `schema.table`.
    pub async fn invalidate(
        &self,
        address: &str,
        changes: Option<&HashMap<String, TableChanges>>,
    ) -> SyncResult<()> {
        self.inner.invalidate(address, changes).await
    }

    /// Feeds a notification received from the server's push channel.
    pub async fn handle_notification(&self, notification: &ChangeNotification) -> SyncResult<()> {
        self.inner
            .invalidate(&notification.address, notification.changes.as_ref())
            .await
    }

    /// Waits until someone else changes `object`. Returns false on timeout.
    pub async fn await_change(&self, location: &Location, object: &Object, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        self.inner.state.lock().await.watchers.push(Watcher {
            location: location.clone(),
            id: object.id,
            tx,
        });
        let changed = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        if !changed {
            let mut state = self.inner.state.lock().await;
            state.watchers.retain(|watcher| !watcher.tx.is_closed());
        }
        changed
    }

    // ── Connectivity ─────────────────────────────────────────────

    /// Going online dispatches queued writes and re-validates remote
    /// searches.
    pub async fn set_online(&self, online: bool) {
        let resumed = {
            let mut state = self.inner.state.lock().await;
            let resumed = online && !state.online;
            state.online = online;
            if resumed {
                for search in state.searches.iter_mut().filter(|s| !s.location.is_local()) {
                    search.dirty = true;
                }
            }
            resumed
        };
        if resumed {
            info!("back online");
            self.inner.pump_all().await;
            self.inner.schedule_prefetch();
        }
    }

    pub async fn is_online(&self) -> bool {
        self.inner.state.lock().await.online
    }

    /// Prefetching only runs while the application is in the foreground.
    pub async fn set_foreground(&self, foreground: bool) {
        self.inner.state.lock().await.foreground = foreground;
        if foreground {
            self.inner.schedule_prefetch();
        }
    }

    // ── Sessions ─────────────────────────────────────────────────

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn session(&self, address: &str, kind: SessionKind) -> Option<Session> {
        self.inner.sessions.get(address, kind)
    }

    /// Adopts a session persisted by the embedder.
    pub fn restore_session(&self, session: Session) {
        debug!("restored {} session with {}", session.kind, session.address);
        self.inner.sessions.insert(session);
    }

    /// Starts a session with `address`. The session is authorized later by
    /// [`SyncCoordinator::submit_password`] or by an out-of-band login that
    /// [`SyncCoordinator::check_session`] picks up.
    pub async fn begin_session(&self, address: &str) -> SyncResult<Session> {
        let inner = self.inner.clone();
        let owned = address.to_string();
        self.inner
            .sessions
            .calls
            .run(format!("begin:{address}"), move || async move {
                let request = SessionRequest {
                    area: inner.config.area.clone(),
                    handle: None,
                };
                let info = inner.remote.create_session(&owned, &request).await?;
                let handle = info.handle.clone().ok_or_else(|| {
                    SyncError::Serialization("session response without handle".into())
                })?;
                let mut session = Session::pending(&owned, SessionKind::Primary, handle);
                let authorized = session.apply(info.clone());
                inner.sessions.insert(session);
                info!("began session with {owned}");
                if authorized {
                    inner.emit(SyncEvent::Authorization {
                        address: owned,
                        kind: SessionKind::Primary,
                    });
                }
                Ok(info)
            })
            .await?;
        self.session(address, SessionKind::Primary)
            .ok_or_else(|| SyncError::NoSession {
                address: address.to_string(),
            })
    }

    /// Asks the server whether the session has been authorized. Returns
    /// false when there is no session or it is still waiting.
    pub async fn check_session(&self, address: &str) -> SyncResult<bool> {
        let Some(session) = self.session(address, SessionKind::Primary) else {
            return Ok(false);
        };
        if session.is_authorized() {
            return Ok(true);
        }
        let inner = self.inner.clone();
        let owned = address.to_string();
        let result = self
            .inner
            .sessions
            .calls
            .run(format!("check:{address}"), move || async move {
                let info = inner.remote.fetch_session(&owned, &session.handle).await?;
                let authorized = inner
                    .sessions
                    .update(&owned, SessionKind::Primary, |s| {
                        s.apply(info.clone());
                    })
                    .is_some_and(|s| s.is_authorized());
                if authorized {
                    info!("session with {owned} authorized");
                    inner.emit(SyncEvent::Authorization {
                        address: owned,
                        kind: SessionKind::Primary,
                    });
                }
                Ok(info)
            })
            .await;
        match result {
            Ok(info) => Ok(info.token.is_some()),
            Err(SyncError::Unauthorized { .. }) => {
                debug!("server forgot session with {address}");
                self.inner.sessions.remove(address, SessionKind::Primary);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Authorizes the pending session with a username and password.
    pub async fn submit_password(
        &self,
        address: &str,
        username: &str,
        password: &str,
    ) -> SyncResult<()> {
        let session = self
            .session(address, SessionKind::Primary)
            .ok_or_else(|| SyncError::NoSession {
                address: address.to_string(),
            })?;
        let request = PasswordRequest {
            handle: session.handle,
            username: username.to_string(),
            password: password.to_string(),
        };
        let inner = self.inner.clone();
        let owned = address.to_string();
        self.inner
            .sessions
            .calls
            .run(format!("password:{address}:{username}"), move || async move {
                let info = inner.remote.authenticate(&owned, &request).await?;
                let authorized = inner
                    .sessions
                    .update(&owned, SessionKind::Primary, |s| {
                        s.apply(info.clone());
                    })
                    .is_some_and(|s| s.is_authorized());
                if !authorized {
                    return Err(SyncError::Unauthorized { address: owned });
                }
                info!("password accepted by {owned}");
                inner.emit(SyncEvent::Authorization {
                    address: owned,
                    kind: SessionKind::Primary,
                });
                Ok(info)
            })
            .await?;
        Ok(())
    }

    /// Ends the session with `address`, forgetting its searches and
    /// canceling writes still queued for it.
    pub async fn end_session(&self, address: &str) -> SyncResult<()> {
        let session = self.session(address, SessionKind::Primary);
        let inner = self.inner.clone();
        let owned = address.to_string();
        self.inner
            .sessions
            .calls
            .run(format!("end:{address}"), move || async move {
                if let Some(session) = session {
                    if let Err(e) = inner.remote.delete_session(&owned, &session.handle).await {
                        warn!("failed to end session with {owned}: {e}");
                    }
                }
                inner.sessions.remove_all(&owned);
                {
                    let mut state = inner.state.lock().await;
                    state.searches.retain(|search| search.location.address != owned);
                    let (doomed, kept): (Vec<_>, Vec<_>) = state
                        .changes
                        .drain(..)
                        .partition(|change| change.location.address == owned && change.is_queued());
                    state.changes = kept;
                    for mut change in doomed {
                        change.cancel();
                    }
                }
                info!("ended session with {owned}");
                inner.emit(SyncEvent::SessionEnded { address: owned });
                Ok(SessionInfo::default())
            })
            .await?;
        Ok(())
    }

    /// Requests an activation handle another device can use to sign in as
    /// the current user. Requires an authorized primary session.
    pub async fn begin_mobile_session(&self, address: &str) -> SyncResult<String> {
        let primary = self
            .session(address, SessionKind::Primary)
            .filter(Session::is_authorized)
            .ok_or_else(|| SyncError::NoSession {
                address: address.to_string(),
            })?;
        let inner = self.inner.clone();
        let owned = address.to_string();
        let info = self
            .inner
            .sessions
            .calls
            .run(format!("mobile:{address}"), move || async move {
                let request = SessionRequest {
                    area: inner.config.area.clone(),
                    handle: Some(primary.handle),
                };
                inner.remote.create_session(&owned, &request).await
            })
            .await?;
        let handle = info.handle.clone().ok_or_else(|| {
            SyncError::Serialization("session response without handle".into())
        })?;
        let mut session = Session::pending(address, SessionKind::Mobile, handle.clone());
        session.apply(info);
        self.inner.sessions.insert(session);
        Ok(handle)
    }

    /// Signs this device in with an activation handle issued by another
    /// device. The resulting session becomes the primary one.
    pub async fn acquire_mobile_session(&self, address: &str, handle: &str) -> SyncResult<Session> {
        let inner = self.inner.clone();
        let owned = address.to_string();
        let owned_handle = handle.to_string();
        let info: SessionInfo = self
            .inner
            .sessions
            .calls
            .run(format!("acquire:{address}:{handle}"), move || async move {
                inner.remote.fetch_session(&owned, &owned_handle).await
            })
            .await?;
        if info.token.is_none() {
            return Err(SyncError::Unauthorized {
                address: address.to_string(),
            });
        }
        let mut session = Session::pending(address, SessionKind::Primary, handle);
        session.apply(info);
        self.inner.sessions.insert(session.clone());
        info!("acquired mobile session with {address}");
        self.inner.emit(SyncEvent::Authorization {
            address: address.to_string(),
            kind: SessionKind::Primary,
        });
        Ok(session)
    }

    /// Forgets the activation handle and abandons any request for one still
    /// in flight. Returns true if a handle was held.
    pub fn release_mobile_session(&self, address: &str) -> bool {
        let pending = self.inner.sessions.calls.cancel(&format!("mobile:{address}"));
        self.inner
            .sessions
            .remove(address, SessionKind::Mobile)
            .is_some()
            || pending
    }
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Token for remote calls to `address`, signalling when there is none.
    /// Sessions about to expire are torn down.
    fn token_for(&self, address: &str) -> SyncResult<String> {
        let session = self.sessions.get(address, SessionKind::Primary);
        match session {
            Some(session) if session.expires_within(Utc::now(), self.config.session_grace()) => {
                info!("session with {address} is about to expire");
                self.expire(address);
                Err(SyncError::Unauthorized {
                    address: address.to_string(),
                })
            }
            Some(Session {
                token: Some(token), ..
            }) => Ok(token),
            _ => {
                self.emit(SyncEvent::AuthenticationRequired {
                    address: address.to_string(),
                });
                Err(SyncError::NoSession {
                    address: address.to_string(),
                })
            }
        }
    }

    /// Like [`Inner::token_for`] without side effects.
    fn peek_token(&self, address: &str) -> Option<String> {
        self.sessions
            .get(address, SessionKind::Primary)
            .filter(|s| !s.expires_within(Utc::now(), self.config.session_grace()))
            .and_then(|s| s.token)
    }

    fn expire(&self, address: &str) {
        if self.sessions.remove_all(address).is_empty() {
            return;
        }
        self.emit(SyncEvent::Expiration {
            address: address.to_string(),
        });
    }

    /// Raises the signal a failed remote call calls for.
    fn on_remote_error(&self, error: &SyncError) {
        match error {
            SyncError::Unauthorized { address } => {
                warn!("{address} rejected our session");
                self.expire(address);
            }
            SyncError::Forbidden { address, schema } => {
                warn!("{address} denied access to {schema:?}");
                self.emit(SyncEvent::Violation {
                    address: address.clone(),
                    schema: schema.clone(),
                });
            }
            e if e.is_unreachable() => debug!("remote unreachable: {e}"),
            _ => {}
        }
    }

    // ── Searches ─────────────────────────────────────────────────

    async fn find(self: &Arc<Self>, query: Query) -> SyncResult<Arc<Vec<Object>>> {
        if query.location.is_local() {
            let mut objects = self.cache.find(&query.location, &query.criteria).await?;
            objects.sort_by_key(|object| object.id);
            return Ok(Arc::new(objects));
        }

        let query = self.resolve_query(query).await;
        let (search_id, needs_local, online) = {
            let mut state = self.state.lock().await;
            let existing = state.searches.iter().position(|s| s.answers(&query));
            let search = match existing {
                Some(index) => {
                    let mut search = state.searches.remove(index);
                    search.adopt(&query);
                    search
                }
                None => {
                    let id = self.next_search_id.fetch_add(1, Ordering::Relaxed);
                    debug!("new search {id} at {}", query.location);
                    SearchRequest::new(id, &query)
                }
            };
            let ids = (search.id, !search.local_loaded, state.online);
            state.searches.insert(0, search);
            state.evict_searches(self.config.search_capacity);
            ids
        };

        if needs_local {
            let key = query.location.schema_key();
            if online && self.peek_token(&key.address).is_some() {
                if let Err(e) = self.validate_cache(&key).await {
                    debug!("signature check for {key} failed: {e}");
                    self.on_remote_error(&e);
                }
            }
            let objects = self.cache.find(&query.location, &query.criteria).await?;
            let mut state = self.state.lock().await;
            if let Some(search) = state.search_mut(search_id) {
                if !search.local_loaded {
                    search.load_local(objects);
                }
            }
        }

        let status = self.status_of(search_id).await;
        let blocks = query.blocking.blocks(status)
            || (query.required && status >= SearchStatus::Incomplete);
        if online && status != SearchStatus::Complete {
            if blocks {
                // Failures have been signalled; the cached answer stands.
                if let Err(e) = self.refresh(search_id, true).await {
                    debug!("answering {} from cache: {e}", query.location);
                }
            } else {
                let inner = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.refresh(search_id, false).await {
                        debug!("background refresh of search {search_id} failed: {e}");
                    }
                });
            }
        }

        let state = self.state.lock().await;
        let Some(search) = state.search(search_id) else {
            return Ok(Arc::new(Vec::new()));
        };
        if query.required && !search.is_satisfied(Instant::now(), self.config.refresh_interval()) {
            warn!("required search at {} unsatisfied", query.location);
            self.emit(SyncEvent::Stupefaction {
                location: query.location.clone(),
                criteria: query.criteria.clone(),
            });
            return Err(SyncError::NotFound {
                location: query.location,
            });
        }
        if !query.include_uncommitted {
            return Ok(search.results.clone());
        }
        let entries = state
            .changes
            .iter()
            .filter(|change| change.location == query.location)
            .flat_map(|change| change.entries.iter());
        Ok(search.with_uncommitted(entries))
    }

    /// Rewrites temporary ids in the criteria to their permanent ids.
    async fn resolve_query(&self, mut query: Query) -> Query {
        let Some(ids) = query.criteria.explicit_ids() else {
            return query;
        };
        if !ids.iter().any(ObjectId::is_temporary) {
            return query;
        }
        let state = self.state.lock().await;
        let resolved: Vec<_> = ids
            .into_iter()
            .map(|id| serde_json::Value::from(state.identities.resolve(&query.location, id).get()))
            .collect();
        query.criteria = query.criteria.with("id", resolved);
        query
    }

    async fn status_of(&self, search_id: u64) -> SearchStatus {
        let state = self.state.lock().await;
        state
            .search(search_id)
            .map(|search| search.classify(Instant::now(), self.config.refresh_interval()))
            .unwrap_or(SearchStatus::Insufficient)
    }

    /// Refreshes a search from the server, sharing an in-flight refresh of
    /// the same search. The work runs on its own task so the search is
    /// released even if every caller stops waiting.
    async fn refresh(self: &Arc<Self>, search_id: u64, blocking: bool) -> SyncResult<()> {
        let inner = self.clone();
        self.refreshes
            .run(search_id, move || {
                let task = tokio::spawn(async move { inner.refresh_search(search_id, !blocking).await });
                async move {
                    task.await
                        .map_err(|e| SyncError::Cache(format!("refresh task failed: {e}")))?
                }
            })
            .await
    }

    async fn refresh_search(self: Arc<Self>, search_id: u64, background: bool) -> SyncResult<()> {
        let (location, criteria) = {
            let mut state = self.state.lock().await;
            if !state.online {
                return Err(SyncError::Offline);
            }
            let Some(search) = state.search_mut(search_id) else {
                return Ok(());
            };
            search.updating = true;
            search.started_at = Some(Instant::now());
            (search.location.clone(), search.criteria.clone())
        };

        let result = self
            .fetch_search(search_id, &location, &criteria, background)
            .await;

        let mut state = self.state.lock().await;
        if let Some(search) = state.search_mut(search_id) {
            search.updating = false;
        }
        drop(state);
        if let Err(e) = &result {
            self.on_remote_error(e);
        }
        result
    }

    async fn fetch_search(
        self: &Arc<Self>,
        search_id: u64,
        location: &Location,
        criteria: &Criteria,
        background: bool,
    ) -> SyncResult<()> {
        let token = self.token_for(&location.address)?;
        self.validate_cache(&location.schema_key()).await?;

        let discovery = self.remote.discover(location, criteria, &token).await?;
        let diff = {
            let state = self.state.lock().await;
            let Some(search) = state.search(search_id) else {
                return Ok(());
            };
            search.diff(&discovery)
        };

        let retrieved = if diff.fetch.is_empty() {
            Vec::new()
        } else {
            self.remote
                .retrieve(location, &diff.fetch, background, &token)
                .await?
        };
        if !retrieved.is_empty() {
            self.cache.save(location, &retrieved).await?;
        }
        if criteria.explicit_ids().is_some() && !diff.evict.is_empty() {
            let doomed: Vec<Object> = diff.evict.iter().copied().map(Object::new).collect();
            self.cache.remove(location, &doomed).await?;
        }

        let changed = {
            let mut state = self.state.lock().await;
            let Some(search) = state.search_mut(search_id) else {
                return Ok(());
            };
            let changed = search.merge_remote(&discovery, &retrieved);
            search.local_loaded = true;
            search.finished_at = Some(Instant::now());
            search.dirty = false;
            changed
        };
        debug!(
            "refreshed search {search_id} at {location}: {} fetched, {} evicted",
            retrieved.len(),
            diff.evict.len()
        );
        if changed {
            self.emit(SyncEvent::Change);
        }
        Ok(())
    }

    // ── Signatures ───────────────────────────────────────────────

    async fn validate_cache(self: &Arc<Self>, key: &SchemaKey) -> SyncResult<bool> {
        if key.address == LOCAL_ADDRESS {
            return Ok(false);
        }
        let inner = self.clone();
        let owned = key.clone();
        self.validations
            .run(key.clone(), move || async move { inner.check_signature(owned).await })
            .await
    }

    async fn check_signature(self: Arc<Self>, key: SchemaKey) -> SyncResult<bool> {
        let token = self.token_for(&key.address)?;
        let signature = self
            .remote
            .signature(&key.address, &key.schema, &token)
            .await?;
        let stored = self.stored_signature(&key).await?;
        if stored.as_deref() == Some(signature.as_str()) {
            return Ok(false);
        }

        let removed = self.cache.clean(&key.address, &key.schema).await?;
        self.store_signature(&key, &signature).await?;
        {
            let mut state = self.state.lock().await;
            state.signatures.insert(key.clone(), signature);
            for search in state
                .searches
                .iter_mut()
                .filter(|search| key.contains(&search.location))
            {
                search.reset();
            }
        }
        if stored.is_some() {
            info!("schema {key} changed on the server, purged {removed} cached objects");
            self.emit(SyncEvent::SchemaPurged {
                address: key.address.clone(),
                schema: key.schema.clone(),
                removed,
            });
        } else {
            debug!("first signature for {key}, cleared {removed} unverified objects");
        }
        Ok(true)
    }

    fn signature_location() -> Location {
        Location::local(SIGNATURE_SCHEMA, SIGNATURE_TABLE)
    }

    fn signature_criteria(key: &SchemaKey) -> Criteria {
        Criteria::new()
            .with("address", key.address.clone())
            .with("schema", key.schema.clone())
    }

    async fn stored_signature(&self, key: &SchemaKey) -> SyncResult<Option<String>> {
        if let Some(signature) = self.state.lock().await.signatures.get(key) {
            return Ok(Some(signature.clone()));
        }
        let records = self
            .cache
            .find(&Self::signature_location(), &Self::signature_criteria(key))
            .await?;
        let signature = records
            .first()
            .and_then(|record| record.field("signature"))
            .and_then(|value| value.as_str().map(str::to_string));
        if let Some(signature) = &signature {
            self.state
                .lock()
                .await
                .signatures
                .insert(key.clone(), signature.clone());
        }
        Ok(signature)
    }

    async fn store_signature(&self, key: &SchemaKey, signature: &str) -> SyncResult<()> {
        let location = Self::signature_location();
        let all = self.cache.find(&location, &Criteria::new()).await?;
        let id = all
            .iter()
            .find(|record| {
                record.field("address").as_ref().and_then(|v| v.as_str()) == Some(key.address.as_str())
                    && record.field("schema").as_ref().and_then(|v| v.as_str())
                        == Some(key.schema.as_str())
            })
            .map(|record| record.id)
            .unwrap_or_else(|| {
                ObjectId::new(all.iter().map(|r| r.id.get()).max().unwrap_or(0) + 1)
            });
        let record = Object::new(id)
            .with("address", key.address.clone())
            .with("schema", key.schema.clone())
            .with("signature", signature);
        self.cache.save(&location, &[record]).await?;
        Ok(())
    }

    // ── Changes ──────────────────────────────────────────────────

    async fn queue(
        self: &Arc<Self>,
        location: &Location,
        entries: Vec<ChangeEntry>,
        options: ChangeOptions,
    ) -> SyncResult<PendingChange> {
        let id = self.next_change_id.fetch_add(1, Ordering::Relaxed);
        if location.is_local() {
            return self.write_local(id, location, entries, options).await;
        }

        let pending = {
            let mut state = self.state.lock().await;
            let entries = entries
                .into_iter()
                .map(|mut entry| {
                    entry.object.id = state.identities.resolve(location, entry.object.id);
                    entry
                })
                .collect();
            let (mut request, pending) = ChangeRequest::new(id, location.clone(), entries, options);
            let earlier = state
                .changes
                .iter()
                .rposition(|change| change.location == *location && change.is_queued());
            match earlier {
                Some(index) => {
                    let earlier = state.changes.remove(index);
                    debug!("merging change {} into {id}", earlier.id);
                    request.merge(earlier);
                    if request.entries.is_empty() {
                        request.cancel();
                    } else {
                        state.changes.insert(index, request);
                    }
                }
                None if request.entries.is_empty() => request.cancel(),
                None => state.changes.push(request),
            }
            pending
        };
        self.emit(SyncEvent::Change);
        self.pump(location);
        Ok(pending)
    }

    /// Writes to the local pseudo server go straight to the cache.
    async fn write_local(
        &self,
        id: u64,
        location: &Location,
        entries: Vec<ChangeEntry>,
        options: ChangeOptions,
    ) -> SyncResult<PendingChange> {
        let (saved, removed): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| !e.removed);
        let saved: Vec<Object> = saved.into_iter().map(|e| e.object).collect();
        let removed: Vec<Object> = removed.into_iter().map(|e| e.object).collect();
        if !saved.is_empty() {
            self.cache.save(location, &saved).await?;
        }
        if !removed.is_empty() {
            self.cache.remove(location, &removed).await?;
        }

        let mut stored = saved.clone();
        stored.extend(removed.iter().cloned());
        let entries = saved
            .into_iter()
            .map(ChangeEntry::save)
            .chain(removed.into_iter().map(ChangeEntry::remove))
            .collect();
        let (mut request, pending) = ChangeRequest::new(id, location.clone(), entries, options);
        request.commit(stored, &mut IdentityMap::new());
        self.emit(SyncEvent::Change);
        Ok(pending)
    }

    /// Starts dispatching queued requests at `location` on a new task.
    fn pump(self: &Arc<Self>, location: &Location) {
        let inner = self.clone();
        let location = location.clone();
        tokio::spawn(async move { inner.dispatch(location).await });
    }

    async fn pump_all(self: &Arc<Self>) {
        let locations: HashSet<Location> = {
            let state = self.state.lock().await;
            state
                .changes
                .iter()
                .filter(|change| change.is_queued())
                .map(|change| change.location.clone())
                .collect()
        };
        for location in locations {
            self.pump(&location);
        }
    }

    /// Sends queued requests at `location` one at a time until the queue is
    /// empty or a dispatch fails.
    async fn dispatch(self: Arc<Self>, location: Location) {
        let mut conflicted = HashSet::new();
        loop {
            let (id, payload) = {
                let mut state = self.state.lock().await;
                if !state.online {
                    return;
                }
                if state
                    .changes
                    .iter()
                    .any(|change| change.location == location && change.is_dispatched())
                {
                    return;
                }
                let Some(request) = state
                    .changes
                    .iter_mut()
                    .find(|change| change.location == location && change.is_queued())
                else {
                    return;
                };
                if request.stale_ids().is_empty() {
                    (request.id, Some(request.begin_dispatch()))
                } else {
                    (request.id, None)
                }
            };

            let Some(payload) = payload else {
                match self.reconcile_stale(&location, id).await {
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("could not reconcile change {id} at {location}: {e}");
                        self.on_remote_error(&e);
                        if let Some(request) = self.state.lock().await.change_mut(id) {
                            request.fail(e);
                        }
                        return;
                    }
                }
            };

            let result = match self.token_for(&location.address) {
                Ok(token) => self.remote.store(&location, &payload, &token).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(saved) => self.complete(&location, id, saved).await,
                Err(SyncError::Conflict(message)) if conflicted.insert(id) => {
                    warn!("change {id} at {location} conflicts: {message}");
                    if !self.reconcile_conflict(&location, id).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!("dispatch of change {id} at {location} failed: {e}");
                    self.on_remote_error(&e);
                    if let Some(request) = self.state.lock().await.change_mut(id) {
                        request.fail(e);
                    }
                    return;
                }
            }
        }
    }

    /// Settles a request the server refused with 409 against the server's
    /// copies. Returns true if it should be dispatched again.
    async fn reconcile_conflict(&self, location: &Location, id: u64) -> bool {
        let ids: Vec<ObjectId> = {
            let mut state = self.state.lock().await;
            let Some(request) = state.change_mut(id) else {
                return false;
            };
            request.requeue();
            request.object_ids().filter(|id| !id.is_temporary()).collect()
        };
        let remote = match self.fetch_remote(location, &ids).await {
            Ok(remote) => remote,
            Err(e) => {
                if let Some(request) = self.state.lock().await.change_mut(id) {
                    request.fail(e);
                }
                return false;
            }
        };
        let affected: HashSet<ObjectId> = ids.into_iter().collect();
        let survived = {
            let mut state = self.state.lock().await;
            let Some(index) = state.changes.iter().position(|c| c.id == id && c.is_queued()) else {
                return false;
            };
            let survived = state.changes[index].reconcile_with(&affected, &remote);
            if !survived {
                state.changes.remove(index);
                info!("change {id} at {location} dropped in favour of the server");
            }
            survived
        };
        self.emit(SyncEvent::Change);
        survived
    }

    /// Settles the ids of a queued request the server changed underneath
    /// us. Returns false if the request did not survive.
    async fn reconcile_stale(&self, location: &Location, id: u64) -> SyncResult<bool> {
        let ids = {
            let state = self.state.lock().await;
            let Some(request) = state.changes.iter().find(|c| c.id == id && c.is_queued()) else {
                return Ok(false);
            };
            request.stale_ids()
        };
        if ids.is_empty() {
            return Ok(true);
        }
        let remote = self.fetch_remote(location, &ids).await?;
        let fetched: HashSet<ObjectId> = ids.into_iter().collect();
        let survived = {
            let mut state = self.state.lock().await;
            let Some(index) = state.changes.iter().position(|c| c.id == id && c.is_queued()) else {
                return Ok(false);
            };
            let survived = state.changes[index].settle_stale(&fetched, &remote);
            if !survived {
                state.changes.remove(index);
                info!("change {id} at {location} dropped in favour of the server");
            }
            survived
        };
        self.emit(SyncEvent::Change);
        Ok(survived)
    }

    async fn fetch_remote(
        &self,
        location: &Location,
        ids: &[ObjectId],
    ) -> SyncResult<HashMap<ObjectId, Object>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let token = self.token_for(&location.address)?;
        let objects = self.remote.retrieve(location, ids, false, &token).await?;
        Ok(objects.into_iter().map(|object| (object.id, object)).collect())
    }

    /// Applies a storage response: identity pairs, search patches, cache,
    /// and the self-change history.
    async fn complete(&self, location: &Location, id: u64, saved: Vec<Object>) {
        let (stored, removed, remapped) = {
            let mut state = self.state.lock().await;
            let Some(index) = state.changes.iter().position(|c| c.id == id) else {
                debug!("ignoring response to canceled change {id}");
                return;
            };
            let mut request = state.changes.remove(index);
            let remapped = request.commit(saved.clone(), &mut state.identities);

            let mut stored = Vec::new();
            let mut removed = Vec::new();
            for (entry, object) in request.entries.iter().zip(&saved) {
                if entry.removed {
                    removed.push(entry.object.id);
                } else {
                    stored.push(object.clone());
                }
            }

            for other in state
                .changes
                .iter_mut()
                .filter(|change| change.location == *location && change.is_queued())
            {
                for (temporary, permanent) in &remapped {
                    other.remap(*temporary, *permanent);
                }
            }

            state.recent.push_back(Committed {
                location: location.clone(),
                objects: saved
                    .iter()
                    .filter_map(|object| object.gn.map(|gn| (object.id, gn)))
                    .collect(),
            });
            while state.recent.len() > self.config.change_history {
                state.recent.pop_front();
            }

            let temporaries: Vec<ObjectId> = remapped.iter().map(|(t, _)| *t).collect();
            for search in state
                .searches
                .iter_mut()
                .filter(|search| search.location == *location)
            {
                search.apply_removed(&temporaries);
                search.apply_saved(&stored);
                search.apply_removed(&removed);
            }
            (stored, removed, remapped)
        };

        if !stored.is_empty() {
            if let Err(e) = self.cache.save(location, &stored).await {
                warn!("failed to cache stored objects at {location}: {e}");
            }
        }
        let doomed: Vec<Object> = removed
            .iter()
            .copied()
            .chain(remapped.iter().map(|(t, _)| *t))
            .map(Object::new)
            .collect();
        if !doomed.is_empty() {
            if let Err(e) = self.cache.remove(location, &doomed).await {
                warn!("failed to uncache removed objects at {location}: {e}");
            }
        }
        info!(
            "committed change {id} at {location}: {} stored, {} removed",
            stored.len(),
            removed.len()
        );
        self.emit(SyncEvent::Change);
    }

    // ── Invalidation ─────────────────────────────────────────────

    async fn invalidate(
        self: &Arc<Self>,
        address: &str,
        changes: Option<&HashMap<String, TableChanges>>,
    ) -> SyncResult<()> {
        let Some(changes) = changes else {
            {
                let mut state = self.state.lock().await;
                for search in state
                    .searches
                    .iter_mut()
                    .filter(|search| search.location.address == address)
                {
                    search.dirty = true;
                }
            }
            debug!("invalidated everything from {address}");
            self.emit(SyncEvent::Change);
            self.schedule_prefetch();
            return Ok(());
        };

        let notification = ChangeNotification {
            address: address.to_string(),
            changes: Some(changes.clone()),
        };
        let listed = notification.by_location()?;

        let reconcile = {
            let mut state = self.state.lock().await;
            let mut external: Vec<(Location, ObjectId, Generation)> = Vec::new();
            let mut suppressed = 0;
            for (location, list) in &listed {
                for (id, gn) in list.pairs() {
                    if state.is_own_change(location, id, gn) {
                        suppressed += 1;
                    } else {
                        external.push((location.clone(), id, gn));
                    }
                }
            }
            if suppressed > 0 {
                debug!("suppressed {suppressed} self-made changes from {address}");
            }
            if external.is_empty() {
                return Ok(());
            }

            for search in &mut state.searches {
                let named = search.criteria.explicit_ids();
                for (location, id, gn) in &external {
                    if search.location != *location {
                        continue;
                    }
                    if named.as_ref().is_some_and(|ids| !ids.contains(id)) {
                        continue;
                    }
                    if search.generation_of(*id).is_none_or(|held| held < *gn) {
                        search.dirty = true;
                    }
                }
            }

            let (resolved, waiting): (Vec<_>, Vec<_>) =
                state.watchers.drain(..).partition(|watcher| {
                    external
                        .iter()
                        .any(|(location, id, _)| watcher.location == *location && watcher.id == *id)
                });
            state.watchers = waiting;
            for watcher in resolved {
                let _ = watcher.tx.send(());
            }

            let online = state.online;
            let mut reconcile = Vec::new();
            state.changes.retain_mut(|change| {
                if !change.is_queued() {
                    return true;
                }
                let affected: HashSet<ObjectId> = external
                    .iter()
                    .filter(|(location, id, _)| change.location == *location && change.touches(*id))
                    .map(|(_, id, _)| *id)
                    .collect();
                if affected.is_empty() {
                    return true;
                }
                if !change.has_conflict_handler() {
                    let survived = change.reconcile_with(&affected, &HashMap::new());
                    if !survived {
                        info!(
                            "change {} at {} dropped in favour of the server",
                            change.id, change.location
                        );
                    }
                    return survived;
                }
                change.mark_stale(affected);
                if online {
                    reconcile.push((change.location.clone(), change.id));
                }
                true
            });
            reconcile
        };

        self.emit(SyncEvent::Change);
        for (location, id) in reconcile {
            if let Err(e) = self.reconcile_stale(&location, id).await {
                warn!("could not reconcile change {id} at {location}: {e}");
                self.on_remote_error(&e);
            }
        }
        self.schedule_prefetch();
        Ok(())
    }

    // ── Prefetch ─────────────────────────────────────────────────

    fn schedule_prefetch(self: &Arc<Self>) {
        if self.prefetch.is_scheduled() {
            debug!("prefetch debounce restarted");
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        self.prefetch.schedule(move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let selected = {
                let state = inner.state.lock().await;
                if !(state.online && state.foreground) {
                    return;
                }
                prefetch::select(&state.searches)
            };
            if selected.is_empty() {
                return;
            }
            debug!("prefetching {} searches", selected.len());
            futures::stream::iter(selected)
                .for_each_concurrent(inner.config.prefetch_concurrency, |search_id| {
                    let inner = inner.clone();
                    async move {
                        if let Err(e) = inner.refresh(search_id, false).await {
                            debug!("prefetch of search {search_id} failed: {e}");
                        }
                    }
                })
                .await;
        });
    }
}
