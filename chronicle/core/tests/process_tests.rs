//! Process Orchestrator tests
//!
//! `/bin/sh` scripts stand in for the conversational tool.

#![cfg(unix)]

use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use chronicle_core::process::ProcessEvent;
use chronicle_core::{
    ChatRequest, Engine, EngineConfig, EnvelopeKind, ErrorKind, OrchestratorConfig, ProcessError,
    ProcessOrchestrator, ProcessRequest, ProcessState, RateLimitConfig, TransportConfig,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

fn script_config(script: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default().with_program(
        "/bin/sh",
        vec!["-c".to_string(), script.to_string(), "sh".to_string()],
    );
    config.buffered_args = Vec::new();
    config.streaming_args = Vec::new();
    config.kill_grace = Duration::from_millis(200);
    config
}

async fn engine_running(script: &str) -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::with_root(dir.path());
    config.process = script_config(script);
    config.stream = TransportConfig {
        rate_limit: RateLimitConfig::disabled(),
        ..TransportConfig::default()
    };
    let engine = Engine::open(&config).await.unwrap();
    (dir, engine)
}

async fn wait_until_idle(orchestrator: &ProcessOrchestrator) {
    let idle = async {
        while orchestrator.stats().active > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), idle)
        .await
        .expect("process table did not drain");
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_three_chunks_then_clean_exit() {
    let (_dir, engine) =
        engine_running("echo '{\"n\":1}'; echo '{\"n\":2}'; echo '{\"n\":3}'").await;
    let stream = engine
        .stream_chat(&ChatRequest::new("hello").streaming())
        .await
        .unwrap();
    let envelopes: Vec<_> = stream.collect().await;

    let kinds: Vec<_> = envelopes.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EnvelopeKind::Start,
            EnvelopeKind::Data,
            EnvelopeKind::Data,
            EnvelopeKind::Data,
            EnvelopeKind::End,
        ]
    );

    let token = envelopes[0].payload["resume_token"].as_str().unwrap();
    assert!(!token.is_empty());
    assert!(envelopes[0].payload["process_id"].is_string());
    assert_eq!(envelopes[1].payload["structured"], json!({"n": 1}));
    assert_eq!(envelopes[3].payload["line"], json!("{\"n\":3}"));
    assert_eq!(envelopes[4].payload["exit_code"], json!(0));
    assert_eq!(envelopes[4].payload["resume_token"], json!(token));
    assert_eq!(envelopes[4].payload["stats"]["envelopes"], json!(5));

    wait_until_idle(engine.orchestrator()).await;
}

#[tokio::test]
async fn test_disconnect_terminates_process() {
    let (_dir, engine) = engine_running("echo one; echo two; sleep 30; echo three").await;
    let mut stream = engine
        .stream_chat(&ChatRequest::new("hello").streaming())
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().kind, EnvelopeKind::Start);
    assert_eq!(stream.next().await.unwrap().payload["line"], json!("one"));
    assert_eq!(stream.next().await.unwrap().payload["line"], json!("two"));
    assert_eq!(engine.process_stats().active, 1);
    drop(stream);

    wait_until_idle(engine.orchestrator()).await;
    assert!(engine.process_stats().active_ids.is_empty());
}

#[tokio::test]
async fn test_failure_ends_with_error_envelope() {
    let (_dir, engine) = engine_running("echo partial; echo 'bad thing' >&2; exit 4").await;
    let envelopes: Vec<_> = engine
        .stream_chat(&ChatRequest::new("hello").streaming())
        .await
        .unwrap()
        .collect()
        .await;

    let last = envelopes.last().unwrap();
    assert_eq!(envelopes.len(), 3);
    assert_eq!(last.kind, EnvelopeKind::Error);
    assert_eq!(last.payload["kind"], json!("process_exit_failure"));
    assert!(last.payload["detail"].as_str().unwrap().contains("bad thing"));
}

// =============================================================================
// Buffered
// =============================================================================

#[tokio::test]
async fn test_buffered_result_prefers_reported_session() {
    let (_dir, engine) =
        engine_running("printf '{\"session_id\":\"s-1\",\"echo\":\"%s\"}\\n' \"$(cat)\"").await;
    let output = engine.chat(&ChatRequest::new("hello")).await.unwrap();

    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.resume_token, "s-1");
    assert_eq!(output.structured, Some(json!({"session_id": "s-1", "echo": "hello"})));
    assert_eq!(engine.process_stats().active, 0);
}

#[tokio::test]
async fn test_resume_token_is_passed_as_argument() {
    let (_dir, engine) = engine_running("echo \"$@\"").await;
    let output = engine
        .chat(&ChatRequest::new("hi").with_resume_token("conv-42"))
        .await
        .unwrap();
    assert_eq!(output.stdout.trim(), "--resume conv-42");
    assert_eq!(output.resume_token, "conv-42");

    let fresh = engine.chat(&ChatRequest::new("hi")).await.unwrap();
    let minted = fresh.stdout.trim().strip_prefix("--session-id ").unwrap();
    assert_eq!(minted, fresh.resume_token);
}

#[tokio::test]
async fn test_nonzero_exit_carries_stderr() {
    let orchestrator = ProcessOrchestrator::new(script_config("echo oops >&2; exit 3"));
    let error = orchestrator
        .run_buffered(ProcessRequest::new("hi"))
        .await
        .unwrap_err();
    match error {
        ProcessError::ExitFailure { exit_code, stderr } => {
            assert_eq!(exit_code, Some(3));
            assert!(stderr.contains("oops"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(orchestrator.stats().active, 0);
}

#[tokio::test]
async fn test_timeout_terminates_process() {
    let config = script_config("sleep 10").with_timeout(Duration::from_millis(300));
    let orchestrator = ProcessOrchestrator::new(config);
    let started = std::time::Instant::now();
    let error = orchestrator
        .run_buffered(ProcessRequest::new("hi"))
        .await
        .unwrap_err();

    assert!(matches!(error, ProcessError::TimedOut { .. }), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(orchestrator.stats().active, 0);
}

#[tokio::test]
async fn test_timeout_fires_while_consumer_stalls() {
    let script = "i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done; sleep 30";
    let mut config = script_config(script).with_timeout(Duration::from_millis(300));
    config.chunk_capacity = 1;
    let orchestrator = ProcessOrchestrator::new(config);
    let stream = orchestrator
        .spawn_streaming(ProcessRequest::new("hi"))
        .await
        .unwrap();

    // The stream stays alive but unread until the slot is released
    wait_until_idle(&orchestrator).await;

    let events: Vec<ProcessEvent> = stream.collect().await;
    match events.last() {
        Some(ProcessEvent::Exited(outcome)) => assert_eq!(outcome.state, ProcessState::TimedOut),
        other => panic!("unexpected final event: {other:?}"),
    }
}

// =============================================================================
// Admission and cancellation
// =============================================================================

#[tokio::test]
async fn test_ceiling_plus_one_is_overloaded_once() {
    let orchestrator = ProcessOrchestrator::new(script_config("sleep 5").with_max_concurrent(2));
    let request = || {
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator
                .spawn_streaming(ProcessRequest::new("hi"))
                .await
        }
    };
    let results = futures::future::join_all([request(), request(), request()]).await;

    let overloaded = results
        .iter()
        .filter(|r| matches!(r, Err(ProcessError::Overloaded { ceiling: 2 })))
        .count();
    assert_eq!(overloaded, 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    assert_eq!(orchestrator.stats().active, 2);

    let error = chronicle_core::EngineError::from(ProcessError::Overloaded { ceiling: 2 });
    assert_eq!(error.kind(), ErrorKind::Overloaded);

    drop(results);
    wait_until_idle(&orchestrator).await;
}

#[tokio::test]
async fn test_cancel_running_process() {
    let orchestrator = ProcessOrchestrator::new(script_config("sleep 10"));
    let mut stream = orchestrator
        .spawn_streaming(ProcessRequest::new("hi"))
        .await
        .unwrap();
    let id = stream.id();
    assert_eq!(orchestrator.state(id), Some(ProcessState::Running));

    assert!(orchestrator.cancel(id));
    let Some(ProcessEvent::Exited(outcome)) = stream.next().await else {
        panic!("expected the exit event");
    };
    assert_eq!(outcome.state, ProcessState::Killed);
    assert!(stream.next().await.is_none());

    assert!(!orchestrator.cancel(id));
    assert_eq!(orchestrator.stats().active, 0);
}

#[tokio::test]
async fn test_workdir_outside_allowed_root() {
    let allowed = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let mut config = script_config("pwd");
    config.allowed_workdir_root = Some(allowed.path().to_path_buf());
    let orchestrator = ProcessOrchestrator::new(config);

    let error = orchestrator
        .run_buffered(ProcessRequest::new("hi").with_working_dir(elsewhere.path()))
        .await
        .unwrap_err();
    assert!(matches!(error, ProcessError::PathViolation { .. }));

    let output = orchestrator
        .run_buffered(ProcessRequest::new("hi").with_working_dir(allowed.path()))
        .await
        .unwrap();
    let canonical = std::fs::canonicalize(allowed.path()).unwrap();
    assert_eq!(output.stdout.trim(), canonical.to_string_lossy());
}
