use std::time::Duration;

use dbgp_session::{ControlAction, SessionState};
use dbgp_wire::mock::MockDbgpEngineConfig;

use crate::harness::{engine, listen_address, options, project, start_with_mock};

#[tokio::test]
async fn a_transaction_id_mismatch_fails_the_session() {
    let root = project();
    let engine = engine(root.path());
    let (started, mock) = start_with_mock(
        &engine,
        options(true),
        MockDbgpEngineConfig {
            mismatch_transaction_on: Some("step_over".to_string()),
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    started.unwrap();

    let err = engine.control(ControlAction::StepOver).await.unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");

    let info = engine.status();
    assert_eq!(info.state, SessionState::Error);
    assert_eq!(info.last_error.map(|e| e.code), Some("PROTOCOL_ERROR"));
    assert_eq!(info.available_actions, vec![ControlAction::Stop]);
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);

    let err = engine.inspect("$x", 1).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    assert_eq!(engine.stop().await.unwrap().state, SessionState::Stopped);
}

#[tokio::test]
async fn a_malformed_frame_fails_the_session() {
    let root = project();
    let engine = engine(root.path());
    let (started, mock) = start_with_mock(
        &engine,
        options(true),
        MockDbgpEngineConfig {
            malformed_frame_on: Some("property_get".to_string()),
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    started.unwrap();

    let err = engine.inspect("$x", 1).await.unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");
    assert_eq!(engine.state(), SessionState::Error);
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn a_mismatch_during_the_handshake_fails_start() {
    let root = project();
    let engine = engine(root.path());
    let (started, _mock) = start_with_mock(
        &engine,
        options(true),
        MockDbgpEngineConfig {
            mismatch_transaction_on: Some("feature_set".to_string()),
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    assert_eq!(started.unwrap_err().code(), "PROTOCOL_ERROR");
    assert_eq!(engine.state(), SessionState::Error);
}

#[tokio::test]
async fn stop_preempts_a_continuation_that_never_answers() {
    let root = project();
    let engine = engine(root.path());
    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start(options(true)).await }
    });
    let addr = listen_address(&engine).await;
    let mock = dbgp_wire::mock::MockDbgpEngine::connect_with_config(
        addr,
        MockDbgpEngineConfig {
            hang_on_continuation: true,
            ..MockDbgpEngineConfig::default()
        },
    )
    .await
    .unwrap();

    // `start` is now blocked on the entry step.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !mock.command_names().await.contains(&"step_into".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("step_into never sent");
    assert!(!task.is_finished());

    let stopped = tokio::time::timeout(Duration::from_secs(2), engine.stop())
        .await
        .expect("stop blocked behind the continuation")
        .unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "SESSION_STOPPED");
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn stop_preempts_a_background_run() {
    let root = project();
    let engine = engine(root.path());
    let (started, mock) = start_with_mock(
        &engine,
        options(false),
        MockDbgpEngineConfig {
            hang_on_continuation: true,
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    assert_eq!(started.unwrap().state, SessionState::Running);

    let stopped = tokio::time::timeout(Duration::from_secs(2), engine.stop())
        .await
        .expect("stop blocked behind run")
        .unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
}
