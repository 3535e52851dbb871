use pretty_assertions::assert_eq;
use remora_sync::transport::mock::{Action, MockRemote};
use remora_sync::{
    BlockingPolicy, ChangeOptions, ChangeState, LocalCache, MemoryCache, Query, Session, SessionKind,
    SessionRegistry, SyncConfig, SyncCoordinator, SyncError, SyncEvent,
};
use remora_types::{ChangeNotification, Criteria, Location, Object, ObjectId, TableChanges};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const HOST: &str = "https://example.net";

struct Harness {
    coordinator: SyncCoordinator,
    remote: Arc<MockRemote>,
    cache: Arc<MemoryCache>,
}

fn authorized() -> Session {
    Session {
        address: HOST.to_string(),
        kind: SessionKind::Primary,
        handle: "h0".to_string(),
        token: Some("token-h0".to_string()),
        user_id: Some(1),
        expires_at: None,
    }
}

/// Routes engine logs to the test output; `RUST_LOG=remora_sync=debug`
/// shows the sync decisions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(config: SyncConfig, sessions: SessionRegistry) -> Harness {
    init_tracing();
    let remote = Arc::new(MockRemote::new());
    let cache = Arc::new(MemoryCache::new());
    let coordinator =
        SyncCoordinator::new(config, cache.clone(), remote.clone(), sessions).unwrap();
    Harness {
        coordinator,
        remote,
        cache,
    }
}

fn harness() -> Harness {
    harness_with(
        SyncConfig::default(),
        SessionRegistry::with_sessions([authorized()]),
    )
}

fn tasks() -> Location {
    Location::new(HOST, "project", "task")
}

fn task(id: i64, gn: u64, title: &str) -> Object {
    Object::new(id).with_gn(gn).with("title", title)
}

fn ids(objects: &[Object]) -> Vec<i64> {
    objects.iter().map(|o| o.id.get()).collect()
}

fn changes(pairs: &[(i64, u64)]) -> HashMap<String, TableChanges> {
    HashMap::from([(
        "project.task".to_string(),
        TableChanges::from_pairs(pairs.iter().map(|(id, gn)| (ObjectId::new(*id), *gn))),
    )])
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Polls `check` until it holds, yielding to spawned tasks in between.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ── Finding ─────────────────────────────────────────────────────

#[tokio::test]
async fn find_by_id_fetches_and_caches() {
    let h = harness();
    h.remote.insert(&tasks(), [task(5, 1, "x")]);

    let found = h
        .coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(5)])))
        .await
        .unwrap();

    assert_eq!(*found, vec![task(5, 1, "x")]);
    assert_eq!(h.cache.get(&tasks(), ObjectId::new(5)).await, Some(task(5, 1, "x")));
    assert_eq!(h.remote.retrieved_ids(), vec![ObjectId::new(5)]);
}

#[tokio::test]
async fn fresh_search_is_answered_locally() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a"), task(2, 1, "b")]);
    let query = Query::new(tasks(), Criteria::new());

    let first = h.coordinator.find(query.clone()).await.unwrap();
    let second = h.coordinator.find(query).await.unwrap();

    assert_eq!(ids(&first), vec![1, 2]);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.remote.calls(Action::Discovery), 1);
}

#[tokio::test]
async fn criteria_spelling_does_not_split_searches() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a"), task(2, 1, "b")]);
    let a = Criteria::new().with("id", json!([2, 1, 2]));
    let b = Criteria::from_value(json!({"id": [1, 2]})).unwrap();

    h.coordinator.find(Query::new(tasks(), a)).await.unwrap();
    h.coordinator.find(Query::new(tasks(), b)).await.unwrap();

    assert_eq!(h.coordinator.searches().await.len(), 1);
}

#[tokio::test]
async fn stale_results_are_returned_while_refreshing() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    let query = Query::new(tasks(), Criteria::new());
    let before = h.coordinator.find(query.clone()).await.unwrap();

    h.remote.insert(&tasks(), [task(1, 2, "b")]);
    h.coordinator.invalidate(HOST, None).await.unwrap();
    let stale = h.coordinator.find(query).await.unwrap();
    assert!(Arc::ptr_eq(&before, &stale));

    let coordinator = h.coordinator.clone();
    assert!(
        eventually(|| {
            let coordinator = coordinator.clone();
            async move { coordinator.searches().await[0].results[0].gn == Some(2) }
        })
        .await
    );
}

#[tokio::test]
async fn unverified_cache_is_cleared_on_first_signature() {
    let h = harness();
    h.cache.save(&tasks(), &[task(1, 1, "cached")]).await.unwrap();
    h.remote.insert(&tasks(), [task(1, 2, "remote")]);

    let found = h
        .coordinator
        .find(
            Query::new(tasks(), Criteria::ids([ObjectId::new(1)]))
                .blocking(BlockingPolicy::Never),
        )
        .await
        .unwrap();
    assert!(found.is_empty());

    let coordinator = h.coordinator.clone();
    assert!(
        eventually(|| {
            let coordinator = coordinator.clone();
            async move {
                coordinator.searches().await[0]
                    .results
                    .first()
                    .is_some_and(|o| o.gn == Some(2))
            }
        })
        .await
    );
}

#[tokio::test]
async fn required_search_without_match_is_stupefied() {
    let h = harness();
    let mut events = h.coordinator.subscribe();

    let result = h
        .coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(77)])).required())
        .await;

    assert_eq!(result, Err(SyncError::NotFound { location: tasks() }));
    assert!(drain(&mut events).contains(&SyncEvent::Stupefaction {
        location: tasks(),
        criteria: Criteria::ids([ObjectId::new(77)]),
    }));
}

#[tokio::test]
async fn local_address_never_touches_the_network() {
    let h = harness();
    let prefs = Location::local("settings", "prefs");

    h.coordinator
        .save(&prefs, vec![Object::new(1).with("theme", "dark")], ChangeOptions::default())
        .await
        .unwrap();
    let found = h
        .coordinator
        .find(Query::new(prefs.clone(), Criteria::new()))
        .await
        .unwrap();

    assert_eq!(found[0].field("theme"), Some(json!("dark")));
    assert_eq!(h.remote.calls(Action::Storage), 0);
    assert_eq!(h.remote.calls(Action::Discovery), 0);

    h.coordinator.remove(&prefs, vec![Object::new(1)]).await.unwrap();
    assert!(h.cache.get(&prefs, ObjectId::new(1)).await.is_none());
}

#[tokio::test]
async fn uncommitted_writes_can_be_layered() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    let query = Query::new(tasks(), Criteria::new());
    h.coordinator.find(query.clone()).await.unwrap();

    h.coordinator.set_online(false).await;
    let temp = h.coordinator.next_temporary_id();
    let _pending = h
        .coordinator
        .queue_save(&tasks(), vec![Object::new(temp).with("title", "draft")], ChangeOptions::default())
        .await
        .unwrap();

    let plain = h.coordinator.find(query.clone()).await.unwrap();
    let layered = h
        .coordinator
        .find(query.include_uncommitted())
        .await
        .unwrap();
    assert_eq!(ids(&plain), vec![1]);
    assert_eq!(ids(&layered), vec![-1, 1]);
}

#[tokio::test]
async fn least_recently_used_search_is_evicted() {
    let config = SyncConfig {
        search_capacity: 2,
        ..SyncConfig::default()
    };
    let h = harness_with(config, SessionRegistry::with_sessions([authorized()]));
    for id in 1..=3 {
        h.coordinator
            .find(Query::new(tasks(), Criteria::ids([ObjectId::new(id)])))
            .await
            .unwrap();
    }
    let searches = h.coordinator.searches().await;
    assert_eq!(searches.len(), 2);
    assert!(
        searches
            .iter()
            .all(|s| s.criteria != Criteria::ids([ObjectId::new(1)]))
    );
}

// ── Writing ─────────────────────────────────────────────────────

#[tokio::test]
async fn temporary_id_becomes_permanent() {
    let h = harness();
    h.remote.set_next_id(42);
    let temp = h.coordinator.next_temporary_id();
    assert_eq!(temp, ObjectId::new(-1));

    let saved = h
        .coordinator
        .save(&tasks(), vec![Object::new(temp).with("title", "new")], ChangeOptions::default())
        .await
        .unwrap();

    assert_eq!(saved[0].id, ObjectId::new(42));
    assert_eq!(h.remote.stored_batches(), vec![vec![json!({"title": "new"})]]);
    assert_eq!(
        h.coordinator.permanent_id(&tasks(), temp).await,
        Some(ObjectId::new(42))
    );
    assert_eq!(
        h.coordinator.temporary_id(&tasks(), ObjectId::new(42)).await,
        Some(temp)
    );

    // A caller still holding the temporary id finds the stored object.
    let found = h
        .coordinator
        .find(Query::new(tasks(), Criteria::ids([temp])))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec![42]);
}

#[tokio::test]
async fn committed_write_patches_searches() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    let query = Query::new(tasks(), Criteria::new());
    let before = h.coordinator.find(query.clone()).await.unwrap();

    h.coordinator
        .save(&tasks(), vec![task(1, 1, "renamed")], ChangeOptions::default())
        .await
        .unwrap();

    let after = h.coordinator.find(query).await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after[0].field("title"), Some(json!("renamed")));
    assert_eq!(after[0].gn, Some(2));
    assert_eq!(before[0].field("title"), Some(json!("a")));
}

#[tokio::test]
async fn removal_evicts_from_searches_and_cache() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a"), task(2, 1, "b")]);
    let query = Query::new(tasks(), Criteria::new());
    h.coordinator.find(query.clone()).await.unwrap();

    h.coordinator.remove(&tasks(), vec![Object::new(2)]).await.unwrap();

    let found = h.coordinator.find(query).await.unwrap();
    assert_eq!(ids(&found), vec![1]);
    assert!(h.cache.get(&tasks(), ObjectId::new(2)).await.is_none());
    assert!(h.remote.get(&tasks(), ObjectId::new(2)).is_none());
}

#[tokio::test]
async fn offline_writes_wait_and_merge() {
    let h = harness();
    h.coordinator.set_online(false).await;

    let first = h
        .coordinator
        .queue_save(&tasks(), vec![Object::new(1).with("title", "a")], ChangeOptions::default())
        .await
        .unwrap();
    let second = h
        .coordinator
        .queue_save(&tasks(), vec![Object::new(2).with("title", "b")], ChangeOptions::default())
        .await
        .unwrap();
    tokio::task::yield_now().await;

    let pending = h.coordinator.pending_changes().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, ChangeState::Queued);
    assert_eq!(h.remote.calls(Action::Storage), 0);

    h.coordinator.set_online(true).await;
    assert_eq!(first.wait().await.unwrap().len(), 2);
    assert_eq!(second.wait().await.unwrap().len(), 2);
    assert_eq!(h.remote.stored_batches().len(), 1);
}

#[tokio::test]
async fn removing_an_unsent_creation_sends_nothing() {
    let h = harness();
    h.coordinator.set_online(false).await;
    let temp = h.coordinator.next_temporary_id();

    let create = h
        .coordinator
        .queue_save(&tasks(), vec![Object::new(temp).with("title", "oops")], ChangeOptions::default())
        .await
        .unwrap();
    let remove = h
        .coordinator
        .queue_remove(&tasks(), vec![Object::new(temp)], ChangeOptions::default())
        .await
        .unwrap();

    assert!(create.wait().await.unwrap().is_empty());
    assert!(remove.wait().await.unwrap().is_empty());
    assert!(h.coordinator.pending_changes().await.is_empty());
    h.coordinator.set_online(true).await;
    tokio::task::yield_now().await;
    assert_eq!(h.remote.calls(Action::Storage), 0);
}

#[tokio::test]
async fn canceled_change_resolves_empty() {
    let h = harness();
    h.coordinator.set_online(false).await;
    let pending = h
        .coordinator
        .queue_save(&tasks(), vec![Object::new(3)], ChangeOptions::default())
        .await
        .unwrap();

    assert!(h.coordinator.cancel_change(pending.id()).await);
    assert!(!h.coordinator.cancel_change(pending.id()).await);
    assert!(pending.wait().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_dispatch_can_be_retried() {
    let h = harness();
    h.remote
        .fail_next(Action::Storage, SyncError::Network("connection reset".into()));

    let result = h
        .coordinator
        .save(&tasks(), vec![Object::new(8).with("title", "x")], ChangeOptions::default())
        .await;
    assert_eq!(result, Err(SyncError::Network("connection reset".into())));
    assert_eq!(h.coordinator.pending_changes().await.len(), 1);

    h.coordinator.retry_changes().await;
    let coordinator = h.coordinator.clone();
    assert!(
        eventually(|| {
            let coordinator = coordinator.clone();
            async move { coordinator.pending_changes().await.is_empty() }
        })
        .await
    );
    assert!(h.remote.get(&tasks(), ObjectId::new(8)).is_some());
}

// ── Conflicts ───────────────────────────────────────────────────

#[tokio::test]
async fn conflict_without_handler_lets_server_win() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 5, "server")]);
    h.remote
        .fail_next(Action::Storage, SyncError::Conflict("stale gn".into()));

    let saved = h
        .coordinator
        .save(&tasks(), vec![task(1, 1, "mine")], ChangeOptions::default())
        .await
        .unwrap();

    assert!(saved.is_empty());
    assert_eq!(h.remote.get(&tasks(), ObjectId::new(1)), Some(task(1, 5, "server")));
    assert!(h.coordinator.pending_changes().await.is_empty());
}

#[tokio::test]
async fn conflict_handler_can_keep_local_write() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 5, "server")]);
    h.remote
        .fail_next(Action::Storage, SyncError::Conflict("stale gn".into()));
    let options = ChangeOptions::new().on_conflict(|conflict| {
        if let Some(gn) = conflict.remote.and_then(|remote| remote.gn) {
            conflict.local.gn = Some(gn);
        }
        conflict.prevent_default();
    });

    let saved = h
        .coordinator
        .save(&tasks(), vec![task(1, 1, "mine")], options)
        .await
        .unwrap();

    assert_eq!(saved[0].field("title"), Some(json!("mine")));
    assert_eq!(saved[0].gn, Some(6));
    assert_eq!(h.remote.calls(Action::Storage), 2);
}

// ── Invalidation ────────────────────────────────────────────────

#[tokio::test]
async fn own_committed_changes_are_suppressed() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();
    h.coordinator
        .save(&tasks(), vec![task(1, 1, "mine")], ChangeOptions::default())
        .await
        .unwrap();
    // Let the dispatch task finish announcing the commit.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut events = h.coordinator.subscribe();

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 2)])))
        .await
        .unwrap();
    assert!(!h.coordinator.searches().await[0].dirty);
    assert!(drain(&mut events).is_empty());

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 3)])))
        .await
        .unwrap();
    assert!(h.coordinator.searches().await[0].dirty);
    assert_eq!(drain(&mut events), vec![SyncEvent::Change]);
}

#[tokio::test]
async fn in_flight_changes_are_suppressed() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();

    h.remote.pause(Action::Storage);
    let pending = h
        .coordinator
        .queue_save(&tasks(), vec![task(1, 1, "mine")], ChangeOptions::default())
        .await
        .unwrap();
    let coordinator = h.coordinator.clone();
    assert!(
        eventually(|| {
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .pending_changes()
                    .await
                    .first()
                    .is_some_and(|c| c.state == ChangeState::Dispatched)
            }
        })
        .await
    );

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 99)])))
        .await
        .unwrap();
    assert!(!h.coordinator.searches().await[0].dirty);

    h.remote.resume(Action::Storage);
    assert_eq!(pending.wait().await.unwrap().len(), 1);
}

#[tokio::test]
async fn external_change_reconciles_queued_write() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 4, "theirs")]);
    h.coordinator.set_online(false).await;
    let pending = h
        .coordinator
        .queue_save(&tasks(), vec![task(1, 1, "mine")], ChangeOptions::default())
        .await
        .unwrap();

    let notification = ChangeNotification {
        address: HOST.to_string(),
        changes: Some(changes(&[(1, 4)])),
    };
    h.coordinator.handle_notification(&notification).await.unwrap();

    assert!(pending.wait().await.unwrap().is_empty());
    assert!(h.coordinator.pending_changes().await.is_empty());
}

#[tokio::test]
async fn unhandled_write_is_dropped_without_asking_the_server() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 4, "theirs")]);
    h.coordinator.set_online(false).await;
    let pending = h
        .coordinator
        .queue_save(&tasks(), vec![task(1, 1, "mine")], ChangeOptions::default())
        .await
        .unwrap();
    h.remote
        .fail_next(Action::Retrieval, SyncError::Network("connection reset".into()));

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 4)])))
        .await
        .unwrap();
    assert!(h.coordinator.pending_changes().await.is_empty());
    assert!(pending.wait().await.unwrap().is_empty());

    h.coordinator.set_online(true).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.remote.calls(Action::Retrieval), 0);
    assert_eq!(h.remote.calls(Action::Storage), 0);
    assert_eq!(h.remote.get(&tasks(), ObjectId::new(1)), Some(task(1, 4, "theirs")));
}

fn keep_local(calls: Arc<AtomicUsize>) -> ChangeOptions {
    ChangeOptions::new().on_conflict(move |conflict| {
        calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gn) = conflict.remote.and_then(|remote| remote.gn) {
            conflict.local.gn = Some(gn);
        }
        conflict.prevent_default();
    })
}

#[tokio::test]
async fn offline_handled_write_reconciles_before_dispatch() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 4, "theirs")]);
    h.coordinator.set_online(false).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let pending = h
        .coordinator
        .queue_save(&tasks(), vec![task(1, 1, "mine")], keep_local(handled.clone()))
        .await
        .unwrap();

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 4)])))
        .await
        .unwrap();
    assert_eq!(h.remote.calls(Action::Retrieval), 0);
    assert_eq!(h.coordinator.pending_changes().await.len(), 1);

    h.coordinator.set_online(true).await;
    let saved = pending.wait().await.unwrap();

    assert_eq!(saved[0].field("title"), Some(json!("mine")));
    assert_eq!(saved[0].gn, Some(5));
    assert_eq!(h.remote.calls(Action::Retrieval), 1);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_reconcile_is_retried_before_dispatch() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 4, "theirs")]);
    h.remote
        .fail_next(Action::Storage, SyncError::Network("connection reset".into()));
    let handled = Arc::new(AtomicUsize::new(0));
    let pending = h
        .coordinator
        .queue_save(&tasks(), vec![task(1, 1, "mine")], keep_local(handled.clone()))
        .await
        .unwrap();
    assert!(pending.wait().await.is_err());

    h.remote
        .fail_next(Action::Retrieval, SyncError::Network("connection reset".into()));
    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 4)])))
        .await
        .unwrap();
    assert_eq!(h.coordinator.pending_changes().await.len(), 1);
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    h.coordinator.retry_changes().await;
    let coordinator = h.coordinator.clone();
    assert!(
        eventually(|| {
            let coordinator = coordinator.clone();
            async move { coordinator.pending_changes().await.is_empty() }
        })
        .await
    );
    let stored = h.remote.get(&tasks(), ObjectId::new(1)).unwrap();
    assert_eq!(stored.field("title"), Some(json!("mine")));
    assert_eq!(stored.gn, Some(5));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn explicit_id_search_ignores_other_ids() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a"), task(2, 1, "b")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(1)])))
        .await
        .unwrap();

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(2, 2)])))
        .await
        .unwrap();
    assert!(!h.coordinator.searches().await[0].dirty);

    h.coordinator
        .invalidate(HOST, Some(&changes(&[(1, 2)])))
        .await
        .unwrap();
    assert!(h.coordinator.searches().await[0].dirty);
}

#[tokio::test]
async fn blanket_invalidation_dirties_address() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();
    h.coordinator.invalidate(HOST, None).await.unwrap();
    assert!(h.coordinator.searches().await[0].dirty);
}

#[tokio::test]
async fn malformed_notification_is_rejected() {
    let h = harness();
    let bad = HashMap::from([("notatable".to_string(), TableChanges::default())]);
    assert!(h.coordinator.invalidate(HOST, Some(&bad)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn await_change_resolves_on_external_change() {
    let h = harness();
    let object = task(1, 1, "a");
    let table = tasks();

    let (changed, _) = tokio::join!(
        h.coordinator
            .await_change(&table, &object, Duration::from_secs(5)),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.coordinator
                .invalidate(HOST, Some(&changes(&[(1, 2)])))
                .await
                .unwrap();
        }
    );
    assert!(changed);
}

#[tokio::test(start_paused = true)]
async fn await_change_times_out() {
    let h = harness();
    let changed = h
        .coordinator
        .await_change(&tasks(), &task(1, 1, "a"), Duration::from_secs(1))
        .await;
    assert!(!changed);
}

#[tokio::test(start_paused = true)]
async fn invalidation_prefetches_dirty_searches() {
    let config = SyncConfig {
        prefetch_debounce_ms: 100,
        ..SyncConfig::default()
    };
    let h = harness_with(config, SessionRegistry::with_sessions([authorized()]));
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();

    h.remote.insert(&tasks(), [task(2, 1, "b")]);
    h.coordinator
        .invalidate(HOST, Some(&changes(&[(2, 1)])))
        .await
        .unwrap();

    let coordinator = h.coordinator.clone();
    assert!(
        eventually(|| {
            let coordinator = coordinator.clone();
            async move { ids(&coordinator.searches().await[0].results) == vec![1, 2] }
        })
        .await
    );
    assert_eq!(h.remote.calls(Action::Discovery), 2);
}

#[tokio::test(start_paused = true)]
async fn no_prefetch_in_background() {
    let config = SyncConfig {
        prefetch_debounce_ms: 100,
        ..SyncConfig::default()
    };
    let h = harness_with(config, SessionRegistry::with_sessions([authorized()]));
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();
    h.coordinator.set_foreground(false).await;

    h.coordinator.invalidate(HOST, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.remote.calls(Action::Discovery), 1);
}

// ── Schema signatures ───────────────────────────────────────────

#[tokio::test]
async fn signature_change_purges_schema() {
    let h = harness();
    h.remote.set_signature(HOST, "project", "v1");
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();
    assert!(h.cache.get(&tasks(), ObjectId::new(1)).await.is_some());
    let mut events = h.coordinator.subscribe();

    assert!(!h.coordinator.validate_cache(HOST, "project").await.unwrap());

    h.remote.set_signature(HOST, "project", "v2");
    assert!(h.coordinator.validate_cache(HOST, "project").await.unwrap());

    assert!(h.cache.get(&tasks(), ObjectId::new(1)).await.is_none());
    assert!(drain(&mut events).contains(&SyncEvent::SchemaPurged {
        address: HOST.to_string(),
        schema: "project".to_string(),
        removed: 1,
    }));
    let search = &h.coordinator.searches().await[0];
    assert!(search.results.is_empty());
    assert!(search.dirty);
}

#[tokio::test]
async fn new_search_after_signature_change_sees_purge() {
    let h = harness();
    h.remote.set_signature(HOST, "project", "v1");
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    h.coordinator
        .find(Query::new(tasks(), Criteria::new()))
        .await
        .unwrap();
    let mut events = h.coordinator.subscribe();

    h.remote.set_signature(HOST, "project", "v2");
    h.remote.delete(&tasks(), ObjectId::new(1));
    let found = h
        .coordinator
        .find(Query::new(tasks(), Criteria::new().with("title", "a")))
        .await
        .unwrap();

    assert!(found.is_empty());
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::SchemaPurged { .. }))
    );
}

// ── Remote failures ─────────────────────────────────────────────

#[tokio::test]
async fn unauthorized_destroys_session() {
    let h = harness();
    let mut events = h.coordinator.subscribe();
    h.remote.fail_next(
        Action::Discovery,
        SyncError::Unauthorized {
            address: HOST.to_string(),
        },
    );

    let found = h
        .coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(5)])))
        .await
        .unwrap();

    assert!(found.is_empty());
    assert!(h.coordinator.session(HOST, SessionKind::Primary).is_none());
    assert!(drain(&mut events).contains(&SyncEvent::Expiration {
        address: HOST.to_string()
    }));
}

#[tokio::test]
async fn forbidden_raises_violation() {
    let h = harness();
    let mut events = h.coordinator.subscribe();
    h.remote.fail_next(
        Action::Discovery,
        SyncError::Forbidden {
            address: HOST.to_string(),
            schema: Some("project".to_string()),
        },
    );

    h.coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(5)])))
        .await
        .unwrap();

    assert!(drain(&mut events).contains(&SyncEvent::Violation {
        address: HOST.to_string(),
        schema: Some("project".to_string()),
    }));
    assert!(h.coordinator.session(HOST, SessionKind::Primary).is_some());
}

#[tokio::test]
async fn missing_session_asks_for_authentication() {
    let h = harness_with(SyncConfig::default(), SessionRegistry::new());
    let mut events = h.coordinator.subscribe();

    let found = h
        .coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(5)])))
        .await
        .unwrap();

    assert!(found.is_empty());
    assert!(drain(&mut events).contains(&SyncEvent::AuthenticationRequired {
        address: HOST.to_string()
    }));
}

#[tokio::test]
async fn expiring_session_is_torn_down() {
    let mut session = authorized();
    session.expires_at = Some(chrono::Utc::now() + chrono::Duration::seconds(60));
    let h = harness_with(SyncConfig::default(), SessionRegistry::with_sessions([session]));
    let mut events = h.coordinator.subscribe();

    h.coordinator
        .find(Query::new(tasks(), Criteria::ids([ObjectId::new(5)])))
        .await
        .unwrap();

    assert!(h.coordinator.session(HOST, SessionKind::Primary).is_none());
    let expirations = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::Expiration { .. }))
        .count();
    assert_eq!(expirations, 1);
}

#[tokio::test]
async fn unreachable_server_degrades_to_cache() {
    let h = harness();
    h.remote.insert(&tasks(), [task(1, 1, "a")]);
    let query = Query::new(tasks(), Criteria::new()).blocking(BlockingPolicy::Stale);
    h.coordinator.find(query.clone()).await.unwrap();

    h.remote.set_unreachable(true);
    h.coordinator.invalidate(HOST, None).await.unwrap();
    let found = h.coordinator.find(query).await.unwrap();

    assert_eq!(ids(&found), vec![1]);
    assert!(h.coordinator.searches().await[0].dirty);
}
