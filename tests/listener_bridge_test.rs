//! Native callbacks reaching a single-threaded host through the listener
//! bridge, with the in-memory engine supplying real native threads.

use std::sync::Arc;
use std::time::Duration;

use couchbase_lite_node::binding::{ConflictResolverFunction, FilterFunction, ReplicatorEndpoint};
use couchbase_lite_node::engine::{
    Conflict, DocumentReplication, FilterRequest, ReplicatorActivity, ReplicatorStatus,
    ReplicatorType, Resolution,
};
use couchbase_lite_node::host::LoopFunction;
use couchbase_lite_node::listener::ListenerState;
use couchbase_lite_node::value::{Dict, NativeValue};
use couchbase_lite_node::{
    Binding, BindingConfig, HandleId, HostFunction, HostLoop, ListenerRegistration, MemoryEngine,
    ReplicatorOptions,
};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(10);

fn setup() -> (Arc<MemoryEngine>, Binding) {
    let engine = Arc::new(MemoryEngine::new());
    let binding = Binding::new(engine.clone(), BindingConfig::default());
    (engine, binding)
}

fn save_json(binding: &Binding, db: HandleId, id: &str, json: &str) {
    let doc = binding.create_document(Some(id)).unwrap();
    binding.set_document_json(doc, json).unwrap();
    binding.save_document(db, doc).unwrap();
    binding.release_handle(doc);
}

fn document_json(binding: &Binding, db: HandleId, id: &str) -> Option<String> {
    let doc = binding.get_document(db, id).unwrap()?;
    let json = binding.get_document_json(doc).unwrap();
    binding.release_handle(doc);
    Some(json)
}

/// Record every status the replicator reports on the host thread.
fn watch_status(
    host: &HostLoop,
    binding: &Binding,
    replicator: HandleId,
) -> (Arc<Mutex<Vec<ReplicatorStatus>>>, ListenerRegistration) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let registration = binding
        .add_replicator_change_listener(
            replicator,
            host.function(move |status: ReplicatorStatus| sink.lock().push(status)),
        )
        .unwrap();
    (seen, registration)
}

fn run_until_stopped(host: &HostLoop, seen: &Mutex<Vec<ReplicatorStatus>>) -> bool {
    host.run_until(TIMEOUT, || {
        seen.lock()
            .last()
            .is_some_and(|status| status.activity == ReplicatorActivity::Stopped)
    })
}

fn props(pairs: &[(&str, &str)]) -> Dict {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), NativeValue::String(v.to_string())))
        .collect()
}

#[test]
fn test_database_changes_arrive_in_order_on_the_host() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let db = binding.open_database("changes", None).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let registration = binding
        .add_database_change_listener(
            db,
            host.function(move |ids: Vec<String>| sink.lock().push(ids)),
        )
        .unwrap();

    save_json(&binding, db, "first", r#"{"n":1}"#);
    save_json(&binding, db, "second", r#"{"n":2}"#);
    engine.flush_notifications();
    // nothing runs until the host thread drains its queue
    assert!(seen.lock().is_empty());

    host.run_pending();
    // one delivery per save, in commit order
    assert_eq!(
        *seen.lock(),
        vec![vec!["first".to_string()], vec!["second".to_string()]]
    );

    assert!(registration.stop());
    assert!(!registration.stop());
    assert_eq!(registration.state(), ListenerState::Stopped);

    save_json(&binding, db, "third", r#"{"n":3}"#);
    engine.flush_notifications();
    host.run_pending();
    assert_eq!(seen.lock().len(), 2);
    assert_eq!(engine.stats().live_listeners, 0);
}

#[test]
fn test_stop_discards_deliveries_already_queued() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let db = binding.open_database("queued", None).unwrap();

    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    let registration = binding
        .add_document_change_listener(
            db,
            "watched",
            host.function(move |_: String| *sink.lock() += 1),
        )
        .unwrap();

    save_json(&binding, db, "watched", r#"{"v":1}"#);
    save_json(&binding, db, "other", r#"{"v":1}"#);
    engine.flush_notifications();
    assert_eq!(host.queued(), 1);

    registration.stop();
    host.run_pending();
    assert_eq!(*seen.lock(), 0);
}

#[test]
fn test_query_listener_receives_current_and_changed_results() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let db = binding.open_database("live-query", None).unwrap();
    save_json(&binding, db, "a", r#"{"kind":"task","title":"write"}"#);

    let query = binding
        .create_query(db, 1, "SELECT title FROM _ WHERE kind = 'task' ORDER BY title")
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _registration = binding
        .add_query_change_listener(
            query,
            host.function(move |rows: String| sink.lock().push(rows)),
        )
        .unwrap();

    engine.flush_notifications();
    host.run_pending();
    save_json(&binding, db, "b", r#"{"kind":"task","title":"test"}"#);
    engine.flush_notifications();
    host.run_pending();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&seen[0]).unwrap();
    let second: serde_json::Value = serde_json::from_str(&seen[1]).unwrap();
    assert_eq!(first, serde_json::json!([{"title": "write"}]));
    assert_eq!(
        second,
        serde_json::json!([{"title": "test"}, {"title": "write"}])
    );
}

#[test]
fn test_one_shot_pull_reaches_stopped() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let remote = binding.open_database("pull-remote", None).unwrap();
    save_json(&binding, remote, "r1", r#"{"from":"remote"}"#);
    save_json(&binding, remote, "r2", r#"{"from":"remote"}"#);
    engine
        .register_remote("ws://localhost:4984/pull-remote", "pull-remote", None)
        .unwrap();

    let local = binding.open_database("pull-local", None).unwrap();
    let mut options = ReplicatorOptions::new(
        local,
        ReplicatorEndpoint::Url("ws://localhost:4984/pull-remote".into()),
    );
    options.replicator_type = ReplicatorType::Pull;
    let replicator = binding.create_replicator(options).unwrap();

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    let documents = Arc::new(Mutex::new(Vec::new()));
    let sink = documents.clone();
    let _documents_registration = binding
        .add_document_replication_listener(
            replicator,
            host.function(move |event: DocumentReplication| {
                assert!(!event.is_push);
                sink.lock().extend(event.documents.into_iter().map(|d| d.id));
            }),
        )
        .unwrap();

    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));
    engine.flush_notifications();
    host.run_pending();

    for status in seen.lock().iter() {
        assert!((0.0..=1.0).contains(&status.progress.complete));
    }
    let last = seen.lock().last().cloned().unwrap();
    assert!(last.error.is_none(), "{:?}", last.error);
    assert_eq!(last.progress.complete, 1.0);

    assert_eq!(binding.database_count(local).unwrap(), 2);
    let mut ids = documents.lock().clone();
    ids.sort();
    assert_eq!(ids, vec!["r1".to_string(), "r2".to_string()]);
}

#[test]
fn test_unknown_remote_stops_with_an_error() {
    let (_engine, binding) = setup();
    let host = HostLoop::new();
    let local = binding.open_database("nowhere-local", None).unwrap();
    let mut options = ReplicatorOptions::new(
        local,
        ReplicatorEndpoint::Url("ws://localhost:4984/nowhere".into()),
    );
    options.max_attempts = 1;
    let replicator = binding.create_replicator(options).unwrap();

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));
    assert!(seen.lock().last().unwrap().error.is_some());
}

/// A pull of one document that also changed locally.
fn conflicting_pull(
    binding: &Binding,
    engine: &MemoryEngine,
    name: &str,
    resolver: Option<ConflictResolverFunction>,
) -> (HandleId, HandleId) {
    let remote_name = format!("{}-remote", name);
    let url = format!("ws://localhost:4984/{}", remote_name);
    let remote = binding.open_database(&remote_name, None).unwrap();
    save_json(binding, remote, "x", r#"{"side":"remote"}"#);
    engine.register_remote(&url, &remote_name, None).unwrap();

    let local = binding.open_database(name, None).unwrap();
    save_json(binding, local, "x", r#"{"side":"local"}"#);

    let mut options = ReplicatorOptions::new(local, ReplicatorEndpoint::Url(url));
    options.replicator_type = ReplicatorType::Pull;
    options.conflict_resolver = resolver;
    let replicator = binding.create_replicator(options).unwrap();
    (local, replicator)
}

#[test]
fn test_conflict_resolver_answer_wins() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let resolver: ConflictResolverFunction = host.exchange(move |conflict: Conflict| -> Resolution {
        sink.lock().push(conflict.document_id.clone());
        Some(props(&[("side", "merged")]))
    });
    let (local, replicator) = conflicting_pull(&binding, &engine, "resolve-merge", Some(resolver));

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));

    assert_eq!(*calls.lock(), vec!["x".to_string()]);
    let json = document_json(&binding, local, "x").unwrap();
    assert!(json.contains("merged"), "{}", json);
}

#[test]
fn test_conflict_resolver_can_delete() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let resolver: ConflictResolverFunction = host.exchange(|_: Conflict| -> Resolution { None });
    let (local, replicator) = conflicting_pull(&binding, &engine, "resolve-delete", Some(resolver));

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));

    assert_eq!(document_json(&binding, local, "x"), None);
}

#[test]
fn test_aborted_resolver_lets_the_remote_win() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let function: Arc<LoopFunction<_>> = host.exchange(|_: Conflict| -> Resolution {
        panic!("an aborted resolver must not run");
    });
    function.abort();
    let resolver: ConflictResolverFunction = function;
    let (local, replicator) = conflicting_pull(&binding, &engine, "resolve-gone", Some(resolver));

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));

    let json = document_json(&binding, local, "x").unwrap();
    assert!(json.contains("remote"), "{}", json);
}

#[test]
fn test_pull_filter_decides_per_document() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let remote = binding.open_database("filter-remote", None).unwrap();
    save_json(&binding, remote, "keep", r#"{"public":true}"#);
    save_json(&binding, remote, "skip", r#"{"public":false}"#);
    engine
        .register_remote("ws://localhost:4984/filter-remote", "filter-remote", None)
        .unwrap();

    let local = binding.open_database("filter-local", None).unwrap();
    let mut options = ReplicatorOptions::new(
        local,
        ReplicatorEndpoint::Url("ws://localhost:4984/filter-remote".into()),
    );
    options.replicator_type = ReplicatorType::Pull;
    let filter: FilterFunction = host.exchange(|request: FilterRequest| {
        request.properties.get("public") == Some(&NativeValue::Bool(true))
    });
    options.pull_filter = Some(filter);
    let replicator = binding.create_replicator(options).unwrap();

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));

    assert!(document_json(&binding, local, "keep").is_some());
    assert_eq!(document_json(&binding, local, "skip"), None);
}

#[test]
fn test_push_filter_to_a_local_database() {
    let (_engine, binding) = setup();
    let host = HostLoop::new();
    let source = binding.open_database("push-source", None).unwrap();
    let target = binding.open_database("push-target", None).unwrap();
    save_json(&binding, source, "yes", r#"{"n":1}"#);
    save_json(&binding, source, "no", r#"{"n":2}"#);

    let mut options = ReplicatorOptions::new(source, ReplicatorEndpoint::Database(target));
    options.replicator_type = ReplicatorType::Push;
    let filter: FilterFunction = host.exchange(|request: FilterRequest| request.document_id == "yes");
    options.push_filter = Some(filter);
    let replicator = binding.create_replicator(options).unwrap();

    let (seen, _registration) = watch_status(&host, &binding, replicator);
    binding.start_replicator(replicator, false).unwrap();
    assert!(run_until_stopped(&host, &seen));

    assert!(document_json(&binding, target, "yes").is_some());
    assert_eq!(document_json(&binding, target, "no"), None);
    assert!(binding.documents_pending_replication(replicator).unwrap().is_empty());
}

#[test]
fn test_releasing_a_replicator_stops_its_callbacks() {
    let (engine, binding) = setup();
    let host = HostLoop::new();
    let source = binding.open_database("release-source", None).unwrap();
    let target = binding.open_database("release-target", None).unwrap();

    let function = host.exchange(|_: FilterRequest| true);
    let filter: FilterFunction = function.clone();
    let mut options = ReplicatorOptions::new(source, ReplicatorEndpoint::Database(target));
    options.push_filter = Some(filter);
    let replicator = binding.create_replicator(options).unwrap();
    assert!(!function.is_aborted());

    assert!(binding.release_handle(replicator));
    assert!(function.is_aborted());
    assert!(!binding.release_handle(replicator));
    assert_eq!(engine.stats().double_releases, 0);
}
