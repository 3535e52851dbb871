//! Change requests: queued writes, their dispatch, and conflict
//! reconciliation.

use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityMap;
use remora_types::{Location, Object, ObjectId};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Callback deciding what happens to a local write the server contradicts.
pub type ConflictHandler = Arc<dyn Fn(&mut Conflict<'_>) + Send + Sync>;

/// A local write and the server's current copy of the same object.
///
/// Unless the handler calls [`Conflict::prevent_default`], the local write
/// is discarded and the server copy wins. The handler may edit `local`
/// before keeping it.
pub struct Conflict<'a> {
    pub local: &'a mut Object,
    /// `None` when the server no longer has the object.
    pub remote: Option<&'a Object>,
    prevented: bool,
}

impl Conflict<'_> {
    /// Keeps the local write.
    pub fn prevent_default(&mut self) {
        self.prevented = true;
    }

    pub fn is_prevented(&self) -> bool {
        self.prevented
    }
}

/// One object written or removed by a change request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub object: Object,
    pub removed: bool,
}

impl ChangeEntry {
    pub fn save(object: Object) -> Self {
        Self {
            object,
            removed: false,
        }
    }

    pub fn remove(object: Object) -> Self {
        Self {
            object,
            removed: true,
        }
    }

    /// The JSON delivered to the storage endpoint.
    fn deliverable(&self) -> Value {
        if self.removed {
            return json!({"id": self.object.id, "deleted": true});
        }
        let object = self.object.intrinsic();
        let mut map = Map::new();
        if !object.is_temporary() {
            map.insert("id".to_string(), Value::from(object.id.get()));
        }
        if let Some(gn) = object.gn {
            map.insert("gn".to_string(), Value::from(gn));
        }
        map.extend(object.fields);
        Value::Object(map)
    }
}

/// Lifecycle of a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeState {
    Queued,
    Dispatched,
    Committed,
    Canceled,
}

/// What observers of a change request see.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeStatus {
    Queued,
    Dispatched,
    /// Stored; carries the objects as the server returned them.
    Committed(Arc<Vec<Object>>),
    Canceled,
    /// The last dispatch failed; the request is queued again.
    Failed(SyncError),
}

/// Per-write options.
#[derive(Clone, Default)]
pub struct ChangeOptions {
    pub on_conflict: Option<ConflictHandler>,
}

impl ChangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_conflict(mut self, handler: impl Fn(&mut Conflict<'_>) + Send + Sync + 'static) -> Self {
        self.on_conflict = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for ChangeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeOptions")
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}

/// A logical write awaiting or undergoing dispatch.
pub struct ChangeRequest {
    pub id: u64,
    pub location: Location,
    pub entries: Vec<ChangeEntry>,
    /// Ids of earlier requests merged into this one.
    pub merged: Vec<u64>,
    on_conflict: Option<ConflictHandler>,
    /// Ids the server changed underneath us, settled before the next send.
    stale: HashSet<ObjectId>,
    state: ChangeState,
    observers: Vec<watch::Sender<ChangeStatus>>,
}

impl fmt::Debug for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRequest")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("entries", &self.entries)
            .field("merged", &self.merged)
            .field("stale", &self.stale)
            .field("state", &self.state)
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}

impl ChangeRequest {
    /// Creates a queued request and the handle its caller waits on.
    pub fn new(
        id: u64,
        location: Location,
        entries: Vec<ChangeEntry>,
        options: ChangeOptions,
    ) -> (Self, PendingChange) {
        let (tx, rx) = watch::channel(ChangeStatus::Queued);
        let request = Self {
            id,
            location,
            entries,
            merged: Vec::new(),
            on_conflict: options.on_conflict,
            stale: HashSet::new(),
            state: ChangeState::Queued,
            observers: vec![tx],
        };
        (request, PendingChange { id, rx })
    }

    pub fn state(&self) -> ChangeState {
        self.state
    }

    pub fn is_queued(&self) -> bool {
        self.state == ChangeState::Queued
    }

    pub fn is_dispatched(&self) -> bool {
        self.state == ChangeState::Dispatched
    }

    pub fn has_conflict_handler(&self) -> bool {
        self.on_conflict.is_some()
    }

    /// Remembers ids to settle against the server before the next dispatch.
    pub fn mark_stale(&mut self, ids: impl IntoIterator<Item = ObjectId>) {
        self.stale.extend(ids);
    }

    /// Stale ids this request still writes.
    pub fn stale_ids(&self) -> Vec<ObjectId> {
        self.object_ids().filter(|id| self.stale.contains(id)).collect()
    }

    /// Whether `id` names this request or one merged into it.
    pub fn answers_to(&self, id: u64) -> bool {
        self.id == id || self.merged.contains(&id)
    }

    /// Whether any entry writes `id`.
    pub fn touches(&self, id: ObjectId) -> bool {
        self.entries.iter().any(|entry| entry.object.id == id)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries.iter().map(|entry| entry.object.id)
    }

    fn notify(&self, status: ChangeStatus) {
        for observer in &self.observers {
            observer.send_replace(status.clone());
        }
    }

    /// Absorbs an earlier queued request on the same location.
    ///
    /// Later writes to an id win. Removing an object whose creation is still
    /// pending drops both entries. The earlier request's observers and
    /// conflict handler carry over.
    pub fn merge(&mut self, earlier: ChangeRequest) {
        let mut entries = earlier.entries;
        for entry in self.entries.drain(..) {
            match entries.iter().position(|e| e.object.id == entry.object.id) {
                Some(index)
                    if entry.removed
                        && !entries[index].removed
                        && entry.object.is_temporary() =>
                {
                    entries.remove(index);
                }
                Some(index) => entries[index] = entry,
                None => entries.push(entry),
            }
        }
        self.entries = entries;
        self.merged.push(earlier.id);
        self.merged.extend(earlier.merged);
        self.observers.extend(earlier.observers);
        self.stale.extend(earlier.stale);
        if self.on_conflict.is_none() {
            self.on_conflict = earlier.on_conflict;
        }
    }

    /// Marks the request dispatched and returns the storage payload:
    /// client-only fields stripped, temporary ids dropped, removals as
    /// `{id, deleted: true}`.
    pub fn begin_dispatch(&mut self) -> Vec<Value> {
        self.state = ChangeState::Dispatched;
        self.notify(ChangeStatus::Dispatched);
        self.entries.iter().map(ChangeEntry::deliverable).collect()
    }

    /// Completes a dispatch. Saved objects pair with entries by position;
    /// temporary ids get their permanent counterparts recorded. Returns the
    /// `(temporary, permanent)` pairs learned.
    pub fn commit(
        &mut self,
        saved: Vec<Object>,
        identity: &mut IdentityMap,
    ) -> Vec<(ObjectId, ObjectId)> {
        let mut remapped = Vec::new();
        for (entry, object) in self.entries.iter().zip(&saved) {
            if entry.object.is_temporary() && !object.id.is_temporary() {
                identity.record(&self.location, entry.object.id, object.id);
                remapped.push((entry.object.id, object.id));
            }
        }
        self.state = ChangeState::Committed;
        self.notify(ChangeStatus::Committed(Arc::new(saved)));
        remapped
    }

    /// Returns a dispatched request to the queue after a failure.
    pub fn fail(&mut self, error: SyncError) {
        self.state = ChangeState::Queued;
        self.notify(ChangeStatus::Failed(error));
    }

    /// Returns a dispatched request to the queue without reporting a
    /// failure, as when it is about to be reconciled and resent.
    pub fn requeue(&mut self) {
        self.state = ChangeState::Queued;
        self.notify(ChangeStatus::Queued);
    }

    /// Terminal; observers resolve to an empty result.
    pub fn cancel(&mut self) {
        self.state = ChangeState::Canceled;
        self.notify(ChangeStatus::Canceled);
    }

    /// Rewrites entries holding `temporary` to `permanent`.
    pub fn remap(&mut self, temporary: ObjectId, permanent: ObjectId) {
        for entry in &mut self.entries {
            if entry.object.id == temporary {
                entry.object.id = permanent;
            }
        }
    }

    /// Settles entries the server changed underneath us, given the server's
    /// copies. Returns false if nothing survived and the request canceled.
    pub fn reconcile_with(
        &mut self,
        affected: &HashSet<ObjectId>,
        remote: &HashMap<ObjectId, Object>,
    ) -> bool {
        let handler = self.on_conflict.clone();
        self.stale.retain(|id| !affected.contains(id));
        self.entries.retain_mut(|entry| {
            if !affected.contains(&entry.object.id) {
                return true;
            }
            let Some(handler) = &handler else {
                return false;
            };
            let mut conflict = Conflict {
                remote: remote.get(&entry.object.id),
                local: &mut entry.object,
                prevented: false,
            };
            handler(&mut conflict);
            conflict.is_prevented()
        });
        if self.entries.is_empty() {
            self.cancel();
            return false;
        }
        true
    }

    /// Settles the stale ids among `fetched`. Ids settled since the fetch
    /// began are left alone.
    pub fn settle_stale(
        &mut self,
        fetched: &HashSet<ObjectId>,
        remote: &HashMap<ObjectId, Object>,
    ) -> bool {
        let affected: HashSet<ObjectId> = self.stale.intersection(fetched).copied().collect();
        if affected.is_empty() {
            return true;
        }
        self.reconcile_with(&affected, remote)
    }

    /// Like [`ChangeRequest::reconcile_with`] but fetches the server's
    /// copies of the affected entries first.
    pub async fn reconcile<F, Fut>(
        &mut self,
        affected: &HashSet<ObjectId>,
        fetch_remote: F,
    ) -> SyncResult<bool>
    where
        F: FnOnce(Vec<ObjectId>) -> Fut,
        Fut: Future<Output = SyncResult<Vec<Object>>>,
    {
        let ids: Vec<ObjectId> = self.object_ids().filter(|id| affected.contains(id)).collect();
        if ids.is_empty() {
            return Ok(true);
        }
        let remote: HashMap<ObjectId, Object> = fetch_remote(ids)
            .await?
            .into_iter()
            .map(|object| (object.id, object))
            .collect();
        Ok(self.reconcile_with(affected, &remote))
    }
}

/// Read-only view of a queued or in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSummary {
    pub id: u64,
    pub location: Location,
    pub state: ChangeState,
    pub ids: Vec<ObjectId>,
}

impl From<&ChangeRequest> for ChangeSummary {
    fn from(request: &ChangeRequest) -> Self {
        Self {
            id: request.id,
            location: request.location.clone(),
            state: request.state,
            ids: request.object_ids().collect(),
        }
    }
}

/// Handle to a queued write.
#[derive(Debug)]
pub struct PendingChange {
    id: u64,
    rx: watch::Receiver<ChangeStatus>,
}

impl PendingChange {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Latest status.
    pub fn status(&self) -> ChangeStatus {
        self.rx.borrow().clone()
    }

    /// Waits until the write settles: the stored objects once committed, an
    /// empty list if canceled, the error if dispatch failed.
    pub async fn wait(mut self) -> SyncResult<Arc<Vec<Object>>> {
        loop {
            let settled = match &*self.rx.borrow_and_update() {
                ChangeStatus::Committed(objects) => Some(Ok(objects.clone())),
                ChangeStatus::Canceled => Some(Ok(Arc::new(Vec::new()))),
                ChangeStatus::Failed(error) => Some(Err(error.clone())),
                ChangeStatus::Queued | ChangeStatus::Dispatched => None,
            };
            if let Some(result) = settled {
                return result;
            }
            if self.rx.changed().await.is_err() {
                return Err(SyncError::Canceled);
            }
        }
    }
}
