use std::time::Duration;

use dbgp_session::{
    ControlAction, DebugEngine, EngineConfig, PauseReason, SessionState, StartOptions,
};
use dbgp_wire::mock::{MockDbgpEngine, MockDbgpEngineConfig, MockPosition};

use crate::harness::{
    engine, engine_config, free_port, listen_address, options, project, start_with_mock,
    wait_for_state,
};

#[tokio::test]
async fn stop_on_entry_pauses_at_the_first_line() {
    let root = project();
    let engine = engine(root.path());

    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    let info = started.expect("start");

    assert_eq!(info.state, SessionState::Paused);
    assert!(info.active);
    assert_eq!(info.step, 1);
    assert_eq!(info.available_actions, ControlAction::ALL.to_vec());
    let location = info.location.expect("location");
    assert_eq!(location.remote_file, "/var/www/html/index.php");
    assert_eq!(
        location.local_file.as_deref(),
        Some(root.path().join("index.php").to_str().unwrap())
    );
    assert_eq!(location.line, 3);
    assert_eq!(location.reason, PauseReason::Entry);
    assert_eq!(info.engine.expect("engine info").file, "/var/www/html/index.php");

    assert_eq!(
        mock.command_names().await,
        vec!["feature_set", "feature_set", "feature_set", "step_into"]
    );

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn a_second_start_is_rejected_while_a_session_is_active() {
    let root = project();
    let engine = engine(root.path());
    let (started, _mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();

    let err = engine.start(options(true)).await.unwrap_err();
    assert_eq!(err.code(), "SESSION_ALREADY_ACTIVE");
    assert_eq!(engine.state(), SessionState::Paused);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_releases_the_port_for_the_next_session() {
    let root = project();
    let engine = DebugEngine::new(EngineConfig {
        port: free_port(),
        ..engine_config(root.path())
    });

    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    let stopped = engine.stop().await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert!(!stopped.active);
    assert!(stopped.available_actions.is_empty());
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);

    // Same fixed port again.
    let (restarted, _mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    let info = restarted.expect("restart on the same port");
    assert_eq!(info.state, SessionState::Paused);
    assert_eq!(info.step, 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_accepted_in_every_state() {
    let root = project();
    let engine = engine(root.path());

    let idle = engine.stop().await.unwrap();
    assert_eq!(idle.state, SessionState::Stopped);
    assert!(!idle.active);

    let (started, _mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    assert_eq!(engine.stop().await.unwrap().state, SessionState::Stopped);
    assert_eq!(engine.stop().await.unwrap().state, SessionState::Stopped);
    assert_eq!(
        engine.control(ControlAction::Stop).await.unwrap().state,
        SessionState::Stopped
    );
}

#[tokio::test]
async fn stop_cancels_a_start_that_is_still_listening() {
    let root = project();
    let engine = engine(root.path());
    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start(options(false)).await }
    });
    let addr = listen_address(&engine).await;
    assert_eq!(engine.state(), SessionState::Listening);
    assert_eq!(engine.status().available_actions, vec![ControlAction::Stop]);

    let stopped = engine.stop().await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(stopped.listen_address, None);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "SESSION_STOPPED");
    // The listener is gone once `stop` returns.
    tokio::net::TcpListener::bind(addr)
        .await
        .expect("port released");
}

#[tokio::test]
async fn no_connection_within_the_timeout_is_an_error() {
    let root = project();
    let engine = DebugEngine::new(EngineConfig {
        connect_timeout: Duration::from_millis(200),
        ..engine_config(root.path())
    });

    let err = engine
        .start(StartOptions {
            command: "sleep 5".to_string(),
            ..StartOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONNECTION_TIMEOUT");

    let info = engine.status();
    assert_eq!(info.state, SessionState::Error);
    assert_eq!(info.last_error.map(|e| e.code), Some("CONNECTION_TIMEOUT"));
    assert_eq!(info.available_actions, vec![ControlAction::Stop]);

    // The trigger is killed with the session.
    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.status().trigger.is_some_and(|t| t.running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("trigger still running");

    assert_eq!(engine.stop().await.unwrap().state, SessionState::Stopped);
}

#[tokio::test]
async fn a_session_can_start_again_after_an_error() {
    let root = project();
    let engine = DebugEngine::new(EngineConfig {
        connect_timeout: Duration::from_millis(300),
        ..engine_config(root.path())
    });
    engine.start(options(true)).await.unwrap_err();
    assert_eq!(engine.state(), SessionState::Error);

    let (started, _mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    assert_eq!(started.unwrap().state, SessionState::Paused);
    assert_eq!(engine.status().last_error, None);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_on_exception_pauses_where_the_exception_is_raised() {
    let root = project();
    let engine = engine(root.path());
    let entry = "/var/www/html/index.php";

    let (started, mock) = start_with_mock(
        &engine,
        StartOptions {
            stop_on_exception: true,
            ..options(false)
        },
        MockDbgpEngineConfig {
            trace: vec![
                MockPosition::new(entry, 3),
                MockPosition::new(entry, 4).throws("RuntimeException"),
                MockPosition::new(entry, 5),
            ],
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    started.unwrap();

    let installed = mock.breakpoints().await;
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].kind, "exception");
    assert_eq!(installed[0].exception.as_deref(), Some("*"));

    let info = wait_for_state(&engine, SessionState::Paused).await;
    assert_eq!(
        mock.command_names().await,
        vec!["feature_set", "feature_set", "feature_set", "breakpoint_set", "run"]
    );
    let location = info.location.clone().expect("location");
    assert_eq!(location.line, 4);
    assert_eq!(location.reason, PauseReason::Exception);
    assert_eq!(location.exception.as_deref(), Some("RuntimeException"));
    assert_eq!(location.message.as_deref(), Some("mock exception"));

    let status = serde_json::to_value(&info).unwrap();
    assert_eq!(status["location"]["reason"], "exception");
    assert_eq!(status["location"]["exception"], "RuntimeException");

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn a_script_that_runs_to_completion_stops_the_session() {
    let root = project();
    let engine = engine(root.path());
    // Never reached by the scripted trace.
    engine.set_breakpoint("app/Foo.php", 99, None).await.unwrap();

    let (started, mock) =
        start_with_mock(&engine, options(false), MockDbgpEngineConfig::default()).await;
    started.unwrap();

    let info = wait_for_state(&engine, SessionState::Stopped).await;
    assert!(info.breakpoints.is_empty());
    assert_eq!(info.location, None);
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
    assert_eq!(mock.command_names().await.last().map(String::as_str), Some("stop"));
}

#[tokio::test]
async fn the_debuggee_can_connect_before_the_trigger_exits() {
    let root = project();
    let engine = engine(root.path());
    let task = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .start(StartOptions {
                    command: "sleep 5".to_string(),
                    stop_on_entry: true,
                    ..StartOptions::default()
                })
                .await
        }
    });
    let addr = listen_address(&engine).await;
    let _mock = MockDbgpEngine::connect(addr).await.unwrap();
    let info = task.await.unwrap().unwrap();
    assert_eq!(info.state, SessionState::Paused);
    assert!(info.trigger.expect("trigger").running);

    engine.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.status().trigger.is_some_and(|t| t.running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stop kills the trigger");
}
