use std::time::Duration;
use std::time::Instant;

use assert_matches::assert_matches;
use core_test_support::TestEngine;
use core_test_support::write_executable;
use pretty_assertions::assert_eq;
use sqlcell_core::ExecEngine;
use sqlcell_core::ExecRequest;
use sqlcell_core::SqlCellErr;
use tracing_test::traced_test;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn opening_a_session_twice_reuses_the_process() {
    let test = TestEngine::fake();
    let engine = test.engine();

    let first = engine.open_session("s", None).await.expect("open");
    let second = engine.open_session("s", None).await.expect("reopen");
    assert!(first.pid.is_some());
    assert_eq!(first.pid, second.pid);
    assert!(second.alive);

    let sessions = engine.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, "s");
    assert!(logs_contain("session started"));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_a_session_removes_it() {
    let test = TestEngine::fake();
    let engine = test.engine();

    engine.open_session("a", None).await.expect("open a");
    engine.open_session("b", None).await.expect("open b");
    assert!(engine.close_session("a").await);
    assert!(!engine.close_session("a").await);

    let names: Vec<_> = engine
        .sessions()
        .await
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec!["b".to_string()]);
    engine.shutdown().await;
    assert!(engine.sessions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_dead_session_is_replaced_on_next_use() {
    let test = TestEngine::fake();
    let engine = test.engine();

    let before = engine.open_session("s", None).await.expect("open");
    engine
        .run_sync(ExecRequest::new("die 0").in_session("s"))
        .await
        .expect("run");
    assert_eq!(engine.cleanup_dead().await, 1);

    let after = engine.open_session("s", None).await.expect("reopen");
    assert_ne!(before.pid, after.pid);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_forgets_finished_executions() {
    let test = TestEngine::fake();
    let engine = test.engine();

    let result = engine
        .run_sync(ExecRequest::new("emit 1").in_session("s"))
        .await
        .expect("run");
    assert!(engine.record(result.exec_id).is_some());

    assert_eq!(engine.cleanup_dead().await, 0);
    assert!(engine.record(result.exec_id).is_none());
    assert_eq!(engine.sessions().await.len(), 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_slow_startup_does_not_block_other_sessions() {
    let test = TestEngine::fake();
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  */slow.db) exec sleep 30 ;;\nesac\nexec '{}' \"$@\"\n",
        test.engine_path().display()
    );
    let mut config = test.config();
    config.engine_path = write_executable(test.dir(), "stalling.sh", &script);
    config.startup_timeout_ms = 3_000;
    let engine = ExecEngine::new(config);

    engine
        .open_session("fast", Some(test.dir().join("fast.db")))
        .await
        .expect("open fast");

    let stalled = engine.clone();
    let slow_db = test.dir().join("slow.db");
    let slow = tokio::spawn(async move { stalled.open_session("slow", Some(slow_db)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    engine
        .run_sync(ExecRequest::new("emit 1").in_session("fast"))
        .await
        .expect("run on fast");
    let names: Vec<_> = engine
        .sessions()
        .await
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(names, vec!["fast".to_string()]);

    let err = slow.await.expect("join").expect_err("slow startup");
    assert_matches!(err, SqlCellErr::StartupTimeout { ref session, .. } if session == "slow");
    assert_eq!(engine.sessions().await.len(), 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_engine_fails_startup_without_registering() {
    let test = TestEngine::fake();
    let mut config = test.config();
    config.engine_path = test.dir().join("no-such-engine");
    let engine = ExecEngine::new(config);

    let err = engine.open_session("s", None).await.expect_err("startup");
    assert_matches!(
        err,
        SqlCellErr::StartupTimeout { ref session, ref detail, .. }
            if session == "s" && detail.starts_with("failed to spawn")
    );
    assert!(engine.sessions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_engine_times_out() {
    let test = TestEngine::hanging();
    let mut config = test.config();
    config.startup_timeout_ms = 300;
    let engine = ExecEngine::new(config);

    let err = engine
        .run_sync(ExecRequest::new("SELECT 1").in_session("s"))
        .await
        .expect_err("startup");
    assert_matches!(
        err,
        SqlCellErr::StartupTimeout { waited, .. } if waited == Duration::from_millis(300)
    );
    assert!(engine.sessions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn early_exit_reports_the_engine_output() {
    let test = TestEngine::crashing();
    let engine = test.engine();

    let err = engine.open_session("s", None).await.expect_err("startup");
    let SqlCellErr::StartupTimeout { detail, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(
        detail,
        "engine exited before becoming ready: IO Error: Cannot open database"
    );
}
