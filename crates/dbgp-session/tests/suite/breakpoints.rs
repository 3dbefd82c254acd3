use std::time::Duration;

use dbgp_session::{ControlAction, DebugError, PauseReason, SessionState};
use dbgp_wire::mock::MockDbgpEngineConfig;

use crate::harness::{engine, options, project, start_with_mock, wait_for_state};

#[tokio::test]
async fn breakpoints_set_before_connecting_are_installed_once_in_order() {
    let root = project();
    let engine = engine(root.path());
    let first = engine.set_breakpoint("index.php", 4, None).await.unwrap();
    let second = engine
        .set_breakpoint("app/Foo.php", 10, Some("$x > 1".to_string()))
        .await
        .unwrap();
    assert!(first.warnings.is_empty());
    assert_eq!(
        second.breakpoint.remote_file.as_deref(),
        Some("/var/www/html/app/Foo.php")
    );
    assert!(!second.breakpoint.installed);

    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    let info = started.unwrap();

    let installed = mock.breakpoints().await;
    assert_eq!(installed.len(), 2);
    assert_eq!(installed[0].file.as_deref(), Some("/var/www/html/index.php"));
    assert_eq!(installed[0].line, Some(4));
    assert_eq!(installed[0].condition, None);
    assert_eq!(installed[1].file.as_deref(), Some("/var/www/html/app/Foo.php"));
    assert_eq!(installed[1].line, Some(10));
    assert_eq!(installed[1].condition.as_deref(), Some("$x > 1"));

    assert_eq!(
        mock.command_names().await,
        vec![
            "feature_set",
            "feature_set",
            "feature_set",
            "breakpoint_set",
            "breakpoint_set",
            "step_into"
        ]
    );
    assert!(info.breakpoints.iter().all(|bp| bp.installed));
    assert_eq!(
        info.breakpoints
            .iter()
            .map(|bp| bp.engine_id.as_deref())
            .collect::<Vec<_>>(),
        vec![Some("100001"), Some("100002")]
    );

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn run_stops_at_the_breakpoint_and_continue_finishes() {
    let root = project();
    let engine = engine(root.path());
    engine.set_breakpoint("app/Foo.php", 10, None).await.unwrap();

    let (started, mock) =
        start_with_mock(&engine, options(false), MockDbgpEngineConfig::default()).await;
    started.unwrap();

    let info = wait_for_state(&engine, SessionState::Paused).await;
    let location = info.location.expect("location");
    assert_eq!(location.line, 10);
    assert_eq!(location.reason, PauseReason::Breakpoint);
    assert_eq!(
        location.local_file.as_deref(),
        Some(root.path().join("app/Foo.php").to_str().unwrap())
    );
    assert_eq!(info.step, 1);

    let finished = engine.control(ControlAction::Continue).await.unwrap();
    assert_eq!(finished.state, SessionState::Stopped);
    assert!(finished.breakpoints.is_empty());
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn a_breakpoint_set_while_paused_is_installed_immediately() {
    let root = project();
    let engine = engine(root.path());
    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();

    let outcome = engine.set_breakpoint("app/Foo.php", 11, None).await.unwrap();
    assert!(outcome.breakpoint.installed);
    assert_eq!(outcome.breakpoint.engine_id.as_deref(), Some("100001"));
    assert!(outcome.warnings.is_empty());
    assert_eq!(mock.breakpoints().await.len(), 1);

    let info = engine.control(ControlAction::Continue).await.unwrap();
    assert_eq!(info.state, SessionState::Paused);
    assert_eq!(info.location.map(|l| l.line), Some(11));
    assert_eq!(info.step, 2);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn an_unmapped_file_is_installed_with_its_local_path() {
    let root = project();
    let engine = engine(root.path());

    let outcome = engine
        .set_breakpoint("/opt/vendor/lib.php", 7, None)
        .await
        .unwrap();
    assert_eq!(outcome.breakpoint.remote_file, None);
    assert_eq!(
        outcome.warnings.iter().map(|w| w.code).collect::<Vec<_>>(),
        vec!["PATH_MAPPING_FAILURE"]
    );

    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    let installed = mock.breakpoints().await;
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].file.as_deref(), Some("/opt/vendor/lib.php"));
    assert_eq!(installed[0].line, Some(7));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn a_breakpoint_rejected_during_the_handshake_fails_start() {
    let root = project();
    let engine = engine(root.path());
    engine.set_breakpoint("index.php", 4, None).await.unwrap();

    let (started, mock) = start_with_mock(
        &engine,
        options(true),
        MockDbgpEngineConfig {
            reject_breakpoints: true,
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    let err = started.unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");

    let info = engine.status();
    assert_eq!(info.state, SessionState::Error);
    assert_eq!(info.last_error.map(|e| e.code), Some("PROTOCOL_ERROR"));
    assert!(!info.breakpoints[0].installed);
    assert!(info.breakpoints[0].install_error.is_some());
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
    assert!(!mock.command_names().await.contains(&"step_into".to_string()));
}

#[tokio::test]
async fn a_breakpoint_rejected_while_paused_ends_the_session() {
    let root = project();
    let engine = engine(root.path());
    let (started, mock) = start_with_mock(
        &engine,
        options(true),
        MockDbgpEngineConfig {
            reject_breakpoints: true,
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    assert_eq!(started.unwrap().state, SessionState::Paused);

    let err = engine
        .set_breakpoint("app/Foo.php", 10, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");
    let DebugError::BreakpointRejected { breakpoint, .. } = &err else {
        panic!("expected a rejected breakpoint, got {err:?}");
    };
    assert_eq!(breakpoint.line, 10);
    assert!(!breakpoint.installed);
    assert!(breakpoint.install_error.is_some());

    let info = engine.status();
    assert_eq!(info.state, SessionState::Error);
    assert_eq!(info.available_actions, vec![ControlAction::Stop]);
    assert_eq!(info.breakpoints.len(), 1);
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn a_breakpoint_set_while_running_waits_for_the_next_pause() {
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

    let outcome = engine.set_breakpoint("app/Foo.php", 10, None).await.unwrap();
    assert!(!outcome.breakpoint.installed);
    assert_eq!(
        outcome.warnings.iter().map(|w| w.code).collect::<Vec<_>>(),
        vec!["BREAKPOINT_DEFERRED"]
    );
    assert!(mock.breakpoints().await.is_empty());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn removing_an_installed_breakpoint_removes_it_from_the_engine() {
    let root = project();
    let engine = engine(root.path());
    let id = engine
        .set_breakpoint("app/Foo.php", 10, None)
        .await
        .unwrap()
        .breakpoint
        .id;

    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    assert_eq!(mock.breakpoints().await.len(), 1);

    let removed = engine.remove_breakpoint(id).await.unwrap();
    assert_eq!(removed.id, id);
    assert!(mock.breakpoints().await.is_empty());
    assert!(mock
        .command_names()
        .await
        .contains(&"breakpoint_remove".to_string()));

    let err = engine.remove_breakpoint(id).await.unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_BREAKPOINT");

    // Nothing left to stop at.
    let info = engine.control(ControlAction::Continue).await.unwrap();
    assert_eq!(info.state, SessionState::Stopped);
}

#[tokio::test]
async fn breakpoint_ids_are_never_reused() {
    let root = project();
    let engine = engine(root.path());
    let first = engine.set_breakpoint("index.php", 4, None).await.unwrap();
    engine.remove_breakpoint(first.breakpoint.id).await.unwrap();
    let second = engine.set_breakpoint("index.php", 4, None).await.unwrap();
    assert!(second.breakpoint.id > first.breakpoint.id);
}
