mod common;

use common::{cached_executor, init_tracing, RecordingBackend};
use query_core::tree::{BinaryOperator, CommandKind, CommandNode, MethodKind, SelectNode, SourceRef};
use query_core::{CancellationToken, DataType, NodeRef, QueryError, QueryNode};
use query_cache::SweepReport;
use query_executor::{CacheOptions, QueryRequest};
use std::sync::Arc;
use std::time::Duration;

fn people_named(name: &str) -> NodeRef {
    let predicate = QueryNode::binary(
        BinaryOperator::Equal,
        QueryNode::member(
            QueryNode::parameter("t0", DataType::Entity("Person".into())),
            "Name",
            DataType::Utf8,
        ),
        QueryNode::constant(name),
    );
    SelectNode::new(SourceRef::new("Person", "t0"))
        .filter(predicate)
        .into_node()
}

fn age_update() -> NodeRef {
    QueryNode::call(
        Some(SelectNode::new(SourceRef::new("Person", "t0")).into_node()),
        MethodKind::UpdateWhere,
        vec![QueryNode::record(vec![("Age", QueryNode::constant(1))])],
        DataType::Int64,
    )
}

#[test]
fn test_result_keys_are_deterministic() {
    let executor = cached_executor(Arc::new(RecordingBackend::new()));
    let keys: Vec<_> = (0..3)
        .map(|_| {
            executor
                .result_key(&QueryRequest::new(people_named("ann")))
                .unwrap()
        })
        .collect();
    assert!(keys[0].is_some());
    assert!(keys.iter().all(|k| *k == keys[0]));

    let other = executor
        .result_key(&QueryRequest::new(people_named("bob")))
        .unwrap();
    assert_ne!(other, keys[0]);
}

#[test]
fn test_empty_update_never_reaches_the_backend() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().with_people(2));
    let executor = cached_executor(backend.clone());
    let tree = CommandNode::new(CommandKind::Update, "Person")
        .filter(QueryNode::constant(true))
        .into_node();

    let output = executor.compile_and_execute(&QueryRequest::new(tree)).unwrap();
    assert_eq!(output.affected(), Some(-1));
    assert!(backend.commands().is_empty());
}

#[test]
fn test_mutations_bypass_the_result_cache() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().with_people(3));
    let executor = cached_executor(backend.clone());
    let request = QueryRequest::new(QueryNode::cache_directive(
        age_update(),
        true,
        Some(Duration::from_secs(60)),
    ))
    .with_options(CacheOptions::new().with_execution(true, None));

    assert_eq!(executor.result_key(&request).unwrap(), None);
    executor.compile_and_execute(&request).unwrap();
    executor.compile_and_execute(&request).unwrap();

    // Both updates were sent; nothing was read from or written to results
    assert_eq!(backend.commands().len(), 2);
    assert_eq!(executor.result_cache_stats().hits(), 0);
    assert!(executor.references().entity_types("").unwrap().is_empty());
    assert!(!executor.is_sweep_started(""));
}

#[test]
fn test_invalidation_stays_within_the_tenant() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().with_people(3));
    let executor = cached_executor(backend.clone());
    let shared = QueryRequest::new(people_named("ann"));
    let acme = QueryRequest::new(people_named("ann"))
        .with_options(CacheOptions::new().with_key_prefix("acme"));
    executor.compile_and_execute(&shared).unwrap();
    executor.compile_and_execute(&acme).unwrap();
    assert_eq!(backend.queries(), 2);

    let shared_key = executor.result_key(&shared).unwrap().unwrap();
    let acme_key = executor.result_key(&acme).unwrap().unwrap();
    let removed = executor.invalidate_entity_types("acme", &["Person".to_string()]);

    assert_eq!(removed, 1);
    assert!(!executor.contains_result(&acme_key));
    assert!(executor.contains_result(&shared_key));
    assert_eq!(executor.references().keys_for("", "Person").unwrap(), vec![shared_key]);

    // Unknown types are a no-op
    assert_eq!(executor.invalidate_entity_types("", &["Invoice".to_string()]), 0);
}

#[test]
fn test_sweep_is_idempotent() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().with_people(3));
    let executor = cached_executor(backend);
    let short_lived = QueryRequest::new(QueryNode::cache_directive(
        people_named("ann"),
        true,
        Some(Duration::from_millis(20)),
    ));
    let long_lived = QueryRequest::new(people_named("bob"));
    executor.compile_and_execute(&short_lived).unwrap();
    executor.compile_and_execute(&long_lived).unwrap();
    assert_eq!(executor.references().keys_for("", "Person").unwrap().len(), 2);

    std::thread::sleep(Duration::from_millis(60));
    let first = executor.sweep_now("");
    assert_eq!(first.buckets, 1);
    assert_eq!(first.pruned, 1);
    assert_eq!(first.removed_buckets, 0);

    let second = executor.sweep_now("");
    assert_eq!(
        second,
        SweepReport {
            buckets: 1,
            ..Default::default()
        }
    );
    assert_eq!(executor.references().keys_for("", "Person").unwrap().len(), 1);
    assert_eq!(executor.result_cache_stats().sweeps(), 2);
}

#[tokio::test]
async fn test_cancelled_token_stops_before_the_backend() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().with_people(3));
    let executor = cached_executor(backend.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = executor
        .compile_and_execute_async(&QueryRequest::new(people_named("ann")), &cancel)
        .await;
    assert!(matches!(result, Err(QueryError::Cancelled)));
    assert!(backend.commands().is_empty());

    // A failed call leaves nothing cached
    let key = executor
        .result_key(&QueryRequest::new(people_named("ann")))
        .unwrap()
        .unwrap();
    assert!(!executor.contains_result(&key));
}

#[test]
fn test_inline_directive_beats_call_options() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().with_people(3));
    let executor = cached_executor(backend.clone());
    let off = CacheOptions::new().with_execution(false, None);

    let plain = QueryRequest::new(people_named("ann")).with_options(off.clone());
    executor.compile_and_execute(&plain).unwrap();
    executor.compile_and_execute(&plain).unwrap();
    assert_eq!(backend.queries(), 2);

    let directed = QueryRequest::new(QueryNode::cache_directive(people_named("ann"), true, None))
        .with_options(off);
    executor.compile_and_execute(&directed).unwrap();
    executor.compile_and_execute(&directed).unwrap();
    assert_eq!(backend.queries(), 3);

    // And a directive can switch caching off against the configuration
    let disabled = QueryRequest::new(QueryNode::cache_directive(people_named("bob"), false, None));
    assert_eq!(executor.result_key(&disabled).unwrap(), None);
}
