use pretty_assertions::assert_eq;
use remora_sync::{
    ChangeEntry, ChangeOptions, ChangeRequest, ChangeState, ChangeStatus, IdentityMap, SyncError,
};
use remora_types::{Location, Object, ObjectId};
use serde_json::json;
use std::collections::{HashMap, HashSet};

fn tasks() -> Location {
    Location::new("https://example.net", "project", "task")
}

fn request(id: u64, entries: Vec<ChangeEntry>) -> (ChangeRequest, remora_sync::PendingChange) {
    ChangeRequest::new(id, tasks(), entries, ChangeOptions::default())
}

fn affected(ids: &[i64]) -> HashSet<ObjectId> {
    ids.iter().copied().map(ObjectId::new).collect()
}

// ── Merging ─────────────────────────────────────────────────────

#[test]
fn later_write_to_same_id_wins() {
    let (earlier, _) = request(1, vec![ChangeEntry::save(Object::new(5).with("title", "a"))]);
    let (mut later, _) = request(
        2,
        vec![
            ChangeEntry::save(Object::new(5).with("title", "b")),
            ChangeEntry::save(Object::new(6)),
        ],
    );
    later.merge(earlier);
    assert_eq!(later.entries.len(), 2);
    assert_eq!(later.entries[0].object.field("title"), Some(json!("b")));
    assert_eq!(later.merged, vec![1]);
    assert!(later.answers_to(1));
    assert!(later.answers_to(2));
}

#[test]
fn removing_pending_create_cancels_both() {
    let (earlier, _) = request(1, vec![ChangeEntry::save(Object::new(-1).with("title", "new"))]);
    let (mut later, _) = request(2, vec![ChangeEntry::remove(Object::new(-1))]);
    later.merge(earlier);
    assert!(later.entries.is_empty());
}

#[test]
fn removing_permanent_object_after_edit_keeps_removal() {
    let (earlier, _) = request(1, vec![ChangeEntry::save(Object::new(7).with("title", "x"))]);
    let (mut later, _) = request(2, vec![ChangeEntry::remove(Object::new(7))]);
    later.merge(earlier);
    assert_eq!(later.entries, vec![ChangeEntry::remove(Object::new(7))]);
}

#[tokio::test]
async fn merged_observers_see_commit() {
    let (earlier, first) = request(1, vec![ChangeEntry::save(Object::new(5))]);
    let (mut later, second) = request(2, vec![ChangeEntry::save(Object::new(6))]);
    later.merge(earlier);
    later.begin_dispatch();
    later.commit(
        vec![Object::new(5).with_gn(2), Object::new(6).with_gn(1)],
        &mut IdentityMap::new(),
    );
    assert_eq!(first.wait().await.unwrap().len(), 2);
    assert_eq!(second.wait().await.unwrap().len(), 2);
}

// ── Dispatch ────────────────────────────────────────────────────

#[test]
fn deliverable_strips_client_fields_and_temporary_ids() {
    let (mut req, pending) = request(
        1,
        vec![
            ChangeEntry::save(Object::new(-1).with("title", "new").with("_draft", true)),
            ChangeEntry::save(Object::new(4).with_gn(3).with("title", "edit")),
            ChangeEntry::remove(Object::new(9).with("title", "gone")),
        ],
    );
    let payload = req.begin_dispatch();
    assert_eq!(
        payload,
        vec![
            json!({"title": "new"}),
            json!({"id": 4, "gn": 3, "title": "edit"}),
            json!({"id": 9, "deleted": true}),
        ]
    );
    assert_eq!(req.state(), ChangeState::Dispatched);
    assert_eq!(pending.status(), ChangeStatus::Dispatched);
}

#[tokio::test]
async fn commit_records_identity_pairs() {
    let (mut req, pending) = request(1, vec![ChangeEntry::save(Object::new(-1).with("title", "x"))]);
    req.begin_dispatch();
    let mut identity = IdentityMap::new();
    let remapped = req.commit(vec![Object::new(42).with_gn(1).with("title", "x")], &mut identity);

    assert_eq!(remapped, vec![(ObjectId::new(-1), ObjectId::new(42))]);
    assert_eq!(identity.permanent_for(&tasks(), ObjectId::new(-1)), Some(ObjectId::new(42)));
    assert_eq!(identity.temporary_for(&tasks(), ObjectId::new(42)), Some(ObjectId::new(-1)));
    assert_eq!(req.state(), ChangeState::Committed);

    let saved = pending.wait().await.unwrap();
    assert_eq!(saved[0].id, ObjectId::new(42));
}

#[tokio::test]
async fn failure_is_reported_and_request_requeued() {
    let (mut req, pending) = request(1, vec![ChangeEntry::save(Object::new(3))]);
    req.begin_dispatch();
    req.fail(SyncError::Network("reset".into()));
    assert_eq!(req.state(), ChangeState::Queued);
    assert_eq!(
        pending.wait().await,
        Err(SyncError::Network("reset".into()))
    );
}

#[tokio::test]
async fn cancel_resolves_empty() {
    let (mut req, pending) = request(1, vec![ChangeEntry::save(Object::new(3))]);
    req.cancel();
    assert_eq!(req.state(), ChangeState::Canceled);
    assert!(pending.wait().await.unwrap().is_empty());
}

#[test]
fn remap_rewrites_temporary_ids() {
    let (mut req, _) = request(1, vec![ChangeEntry::remove(Object::new(-2))]);
    req.remap(ObjectId::new(-2), ObjectId::new(50));
    assert!(req.touches(ObjectId::new(50)));
    assert!(!req.touches(ObjectId::new(-2)));
}

// ── Reconciliation ──────────────────────────────────────────────

#[tokio::test]
async fn without_handler_affected_entries_are_dropped() {
    let (mut req, pending) = request(
        1,
        vec![
            ChangeEntry::save(Object::new(1).with("title", "mine")),
            ChangeEntry::save(Object::new(2).with("title", "mine")),
        ],
    );
    assert!(req.reconcile_with(&affected(&[1]), &HashMap::new()));
    assert_eq!(req.object_ids().collect::<Vec<_>>(), vec![ObjectId::new(2)]);

    assert!(!req.reconcile_with(&affected(&[2]), &HashMap::new()));
    assert_eq!(req.state(), ChangeState::Canceled);
    assert!(pending.wait().await.unwrap().is_empty());
}

#[test]
fn handler_can_keep_and_edit_local_copy() {
    let options = ChangeOptions::new().on_conflict(|conflict| {
        let remote_gn = conflict.remote.and_then(|remote| remote.gn);
        if let Some(gn) = remote_gn {
            conflict.local.gn = Some(gn);
            conflict.prevent_default();
        }
    });
    let (mut req, _) = ChangeRequest::new(
        1,
        tasks(),
        vec![
            ChangeEntry::save(Object::new(1).with_gn(1).with("title", "mine")),
            ChangeEntry::save(Object::new(2).with_gn(1).with("title", "mine")),
        ],
        options,
    );
    let remote = HashMap::from([(ObjectId::new(1), Object::new(1).with_gn(4))]);
    assert!(req.reconcile_with(&affected(&[1, 2]), &remote));
    // Object 2 vanished remotely: no remote copy, handler lets it drop.
    assert_eq!(req.entries.len(), 1);
    assert_eq!(req.entries[0].object.gn, Some(4));
    assert_eq!(req.entries[0].object.field("title"), Some(json!("mine")));
}

#[tokio::test]
async fn reconcile_fetches_only_affected_entries() {
    let (mut req, _) = request(
        1,
        vec![
            ChangeEntry::save(Object::new(1)),
            ChangeEntry::save(Object::new(2)),
        ],
    );
    let survived = req
        .reconcile(&affected(&[2, 3]), |ids| async move {
            assert_eq!(ids, vec![ObjectId::new(2)]);
            Ok(vec![Object::new(2).with_gn(9)])
        })
        .await
        .unwrap();
    assert!(survived);
    assert_eq!(req.object_ids().collect::<Vec<_>>(), vec![ObjectId::new(1)]);
}

#[tokio::test]
async fn reconcile_propagates_fetch_errors_untouched() {
    let (mut req, _) = request(1, vec![ChangeEntry::save(Object::new(1))]);
    let result = req
        .reconcile(&affected(&[1]), |_| async { Err(SyncError::Timeout) })
        .await;
    assert_eq!(result, Err(SyncError::Timeout));
    assert_eq!(req.entries.len(), 1);
}

#[test]
fn stale_ids_are_settled_once() {
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = calls.clone();
    let options = ChangeOptions::new().on_conflict(move |conflict| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        conflict.prevent_default();
    });
    let (mut req, _) = ChangeRequest::new(
        1,
        tasks(),
        vec![
            ChangeEntry::save(Object::new(1).with_gn(1)),
            ChangeEntry::save(Object::new(2).with_gn(1)),
        ],
        options,
    );
    assert!(req.has_conflict_handler());
    req.mark_stale(affected(&[2, 7]));
    assert_eq!(req.stale_ids(), vec![ObjectId::new(2)]);

    let fetched = affected(&[2]);
    let remote = HashMap::from([(ObjectId::new(2), Object::new(2).with_gn(3))]);
    assert!(req.settle_stale(&fetched, &remote));
    assert!(req.stale_ids().is_empty());
    assert!(req.settle_stale(&fetched, &remote));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(req.entries.len(), 2);
}

#[test]
fn stale_ids_survive_merging() {
    let (mut earlier, _) = request(1, vec![ChangeEntry::save(Object::new(5))]);
    earlier.mark_stale(affected(&[5]));
    let (mut later, _) = request(2, vec![ChangeEntry::save(Object::new(6))]);
    later.merge(earlier);
    assert!(!later.has_conflict_handler());
    assert_eq!(later.stale_ids(), vec![ObjectId::new(5)]);
}
