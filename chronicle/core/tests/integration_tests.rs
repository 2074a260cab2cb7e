//! Integration tests for the query path
//!
//! Exercise the Log Store, Query Evaluator and Engine together against a
//! temporary log root.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use chronicle_core::{
    Engine, EngineConfig, ErrorKind, LogHandle, QueryError, QueryKind, QueryOptions, QueryOutput,
    QueryRequest, ReadOptions, StoreError,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

async fn engine() -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::with_root(dir.path());
    let engine = Engine::open(&config).await.unwrap();
    (dir, engine)
}

async fn demo_engine() -> (TempDir, Engine) {
    let (dir, engine) = engine().await;
    engine
        .create_log(
            "demo",
            "abc",
            &[
                json!({"type": "user"}),
                json!({"type": "assistant"}),
                json!({"type": "user"}),
            ],
        )
        .await
        .unwrap();
    (dir, engine)
}

fn sorted_by_type(values: &[Value]) -> Vec<Value> {
    let mut values = values.to_vec();
    values.sort_by_key(|v| v["type"].as_str().map(str::to_string));
    values
}

// =============================================================================
// Log Store
// =============================================================================

#[tokio::test]
async fn test_written_entries_read_back_in_order() {
    let (_dir, engine) = engine().await;
    let first: Vec<Value> = (0..5).map(|i| json!({"type": "user", "n": i})).collect();
    let handle = engine.create_log("rt", "session", &first).await.unwrap();
    let more: Vec<Value> = (5..8).map(|i| json!({"type": "assistant", "n": i})).collect();
    assert_eq!(engine.append(&handle, &more).await.unwrap(), 3);

    let outcome = engine.read_log(&handle, &ReadOptions::default()).await.unwrap();
    let read: Vec<Value> = outcome.entries.into_iter().map(|e| e.into_value()).collect();
    let expected: Vec<Value> = first.into_iter().chain(more).collect();
    assert_eq!(read, expected);
    assert!(outcome.diagnostics.is_empty());
}

#[tokio::test]
async fn test_traversal_is_rejected_before_reading() {
    let (_dir, engine) = demo_engine().await;
    for handle in [
        LogHandle::new("..", "abc"),
        LogHandle::new("demo", "../../etc/passwd"),
        LogHandle::new("demo/..", "abc"),
    ] {
        let error = engine.store().open_for_read(&handle).await.unwrap_err();
        assert!(
            matches!(error, StoreError::PathViolation { .. }),
            "{handle}: {error}"
        );
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinked_collection_outside_root_is_a_violation() {
    let (dir, engine) = engine().await;
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.jsonl"), "{\"type\":\"user\"}\n").unwrap();
    std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

    let error = engine
        .store()
        .open_for_read(&LogHandle::new("escape", "secret"))
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::PathViolation { .. }));
    assert!(!error.to_string().contains(&*outside.path().to_string_lossy()));

    let request = QueryRequest::new(".").with_target("escape/secret");
    let error = engine.query(&request).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::PathViolation);
}

#[tokio::test]
async fn test_new_collection_lists_empty() {
    let (_dir, engine) = engine().await;
    engine.store().create_collection("fresh").await.unwrap();
    assert!(engine.list_logs("fresh").await.unwrap().is_empty());
    let names: Vec<String> = engine
        .list_collections()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["fresh"]);
}

// =============================================================================
// Query Evaluator
// =============================================================================

#[tokio::test]
async fn test_demo_per_record_and_grouped() {
    let (_dir, engine) = demo_engine().await;

    let per_record = QueryRequest::new(".[] | select(.type == \"user\")").with_target("demo/abc");
    let result = engine.query(&per_record).await.unwrap();
    assert_eq!(result.strategy, QueryKind::PerRecord);
    assert_eq!(result.results, vec![json!({"type": "user"}), json!({"type": "user"})]);
    assert_eq!(result.logs_processed, 1);
    assert_eq!(result.lines_processed, 3);

    let grouped = QueryRequest::new("group_by(.type) | map({type: .[0].type, count: length})")
        .with_target("demo");
    let result = engine.query(&grouped).await.unwrap();
    assert_eq!(result.strategy, QueryKind::Aggregating);
    assert_eq!(result.results.len(), 1);
    let groups = result.results[0].as_array().unwrap();
    assert_eq!(
        sorted_by_type(groups),
        vec![
            json!({"type": "assistant", "count": 1}),
            json!({"type": "user", "count": 2}),
        ]
    );
}

#[tokio::test]
async fn test_object_over_whole_collection_is_aggregating() {
    let (_dir, engine) = engine().await;
    engine
        .create_log("ids", "log", &[json!({"id": 1}), json!({"id": 2})])
        .await
        .unwrap();

    let request = QueryRequest::new("{ids: [.[].id]}").with_target("ids/log");
    let result = engine.query(&request).await.unwrap();
    assert_eq!(result.strategy, QueryKind::Aggregating);
    assert_eq!(result.results, vec![json!({"ids": [1, 2]})]);
    assert!(result.diagnostics.is_empty());
}

#[tokio::test]
async fn test_malformed_line_is_one_diagnostic() {
    let (dir, engine) = demo_engine().await;
    let path = dir.path().join("mixed").join("log.jsonl");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"n\":1}\n{\"n\":2}\n{not json\n\n{\"n\":3}\n").unwrap();

    let reader = engine
        .store()
        .open_for_read(&LogHandle::new("mixed", "log"))
        .await
        .unwrap();
    let evaluation = engine
        .evaluator()
        .evaluate_stream(reader, ".n", &QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(evaluation.results, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(evaluation.diagnostics.len(), 1);
    assert_eq!(evaluation.diagnostics[0].line, Some(3));
    assert_eq!(evaluation.lines_processed, 4);
}

#[tokio::test]
async fn test_slow_query_times_out_without_results() {
    let (_dir, engine) = engine().await;
    let document = Value::Array((0..10_000).map(|i| json!({"n": i})).collect());
    let options = QueryOptions::default().with_timeout(Duration::from_millis(50));

    let error = engine
        .evaluator()
        .evaluate(".[] | [range(0;5000)] | length", document, &options)
        .await
        .unwrap_err();
    assert!(matches!(error, QueryError::Timeout { .. }), "{error}");
}

#[tokio::test]
async fn test_runaway_queries_do_not_starve_the_evaluator() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::with_root(dir.path());
    config.query.max_workers = 2;
    let engine = Engine::open(&config).await.unwrap();
    let evaluator = engine.evaluator();
    let short = QueryOptions::default().with_timeout(Duration::from_millis(100));

    let runaways = (0..4).map(|_| evaluator.evaluate("last(range(1e12))", json!({}), &short));
    for result in futures::future::join_all(runaways).await {
        let error = assert_err!(result);
        assert!(
            matches!(error, QueryError::Timeout { .. } | QueryError::Busy { .. }),
            "{error}"
        );
    }

    let options = QueryOptions::default().with_timeout(Duration::from_secs(5));
    let output = assert_ok!(evaluator.evaluate(".n + 1", json!({"n": 1}), &options).await);
    assert_eq!(output, QueryOutput::Single(json!(2)));
    assert_err!(evaluator.validate("[range(1e12)] | length").await);
    assert_eq!(evaluator.worker_stats().busy, 0);
}

#[tokio::test]
async fn test_empty_and_null_results_differ() {
    let (_dir, engine) = engine().await;
    let evaluator = engine.evaluator();
    let options = QueryOptions::default();

    let empty = evaluator.evaluate("empty", json!({}), &options).await.unwrap();
    assert_eq!(empty, QueryOutput::Empty);
    let null = evaluator.evaluate(".missing", json!({}), &options).await.unwrap();
    assert_eq!(null, QueryOutput::Single(Value::Null));
}

#[tokio::test]
async fn test_validation_shapes_and_denylist() {
    let (_dir, engine) = engine().await;
    let evaluator = engine.evaluator();

    assert_ok!(evaluator.validate(".type").await);
    // Fails on an object, succeeds on an array
    assert_ok!(evaluator.validate(".[0]").await);
    assert_ok!(evaluator.validate("map(.type) | unique").await);

    for denied in ["input", "$ENV.HOME", "\"../etc\"", "[.[] | debug]", "env.PATH"] {
        assert!(
            matches!(evaluator.validate(denied).await, Err(QueryError::InvalidQuery { .. })),
            "{denied} should be rejected"
        );
    }
    let error = assert_err!(evaluator.validate(".[ | ").await);
    assert!(matches!(error, QueryError::InvalidQuery { .. }));
}

#[tokio::test]
async fn test_query_over_every_log_with_limit() {
    let (_dir, engine) = demo_engine().await;
    engine
        .create_log("other", "xyz", &[json!({"type": "user"}), json!({"type": "user"})])
        .await
        .unwrap();

    let all = QueryRequest::new(".[] | select(.type == \"user\")");
    let result = engine.query(&all).await.unwrap();
    assert_eq!(result.logs_processed, 2);
    assert_eq!(result.results.len(), 4);
    assert!(!result.truncated);

    let limited = QueryRequest::new(".[] | select(.type == \"user\")").with_limit(3);
    let result = engine.query(&limited).await.unwrap();
    assert_eq!(result.results.len(), 3);
    assert!(result.truncated);
}

#[tokio::test]
async fn test_missing_log_among_targets_is_isolated() {
    let (_dir, engine) = demo_engine().await;
    let request = QueryRequest::new(".type")
        .with_target("demo/abc")
        .with_target("demo/gone");
    let result = engine.query(&request).await.unwrap();
    assert_eq!(result.logs_processed, 1);
    assert_eq!(result.results.len(), 3);
    assert_eq!(result.diagnostics.len(), 1);

    let only_missing = QueryRequest::new(".type").with_target("demo/gone");
    let error = engine.query(&only_missing).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Cache control
// =============================================================================

#[tokio::test]
async fn test_clearing_cache_twice() {
    let (_dir, engine) = demo_engine().await;
    let request = QueryRequest::new(".[] | .type").with_target("demo");
    engine.query(&request).await.unwrap();
    assert!(engine.query(&request).await.unwrap().cached);

    let stats = engine.cache_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);

    assert_eq!(engine.clear_cache(), 1);
    assert_eq!(engine.clear_cache(), 0);
    assert_eq!(engine.cache_stats().entries, 0);
    assert!(!engine.query(&request).await.unwrap().cached);
}

#[tokio::test]
async fn test_delete_drops_log_and_cached_results() {
    let (_dir, engine) = demo_engine().await;
    let handle = LogHandle::new("demo", "abc");
    let request = QueryRequest::new(".[] | .type").with_target("demo/abc");
    engine.query(&request).await.unwrap();

    engine.delete(&handle).await.unwrap();
    assert_eq!(engine.cache_stats().entries, 0);
    assert_eq!(engine.query(&request).await.unwrap_err().kind(), ErrorKind::NotFound);
}
