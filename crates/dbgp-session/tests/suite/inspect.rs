use std::time::Duration;

use dbgp_session::{call_tool, ControlAction, SessionState};
use dbgp_wire::mock::MockDbgpEngineConfig;
use serde_json::json;

use crate::harness::{engine, options, project, start_with_mock, wait_for_state};

#[tokio::test]
async fn each_inspection_is_recorded_at_its_step() {
    let root = project();
    let engine = engine(root.path());
    engine.set_breakpoint("index.php", 4, None).await.unwrap();
    engine.set_breakpoint("app/Foo.php", 10, None).await.unwrap();

    let (started, _mock) =
        start_with_mock(&engine, options(false), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    let paused = wait_for_state(&engine, SessionState::Paused).await;
    assert_eq!(paused.location.map(|l| l.line), Some(4));

    assert_eq!(paused.step, 1);

    // Inspecting advances the step just like pausing does.
    let first = engine.inspect("$x", 1).await.unwrap();
    assert_eq!(first.value, json!(1));
    assert_eq!(first.kind, "int");
    assert_eq!(first.step, 2);
    assert_eq!(engine.status().step, 2);

    let info = engine.control(ControlAction::Continue).await.unwrap();
    assert_eq!(info.location.map(|l| l.line), Some(10));
    assert_eq!(info.step, 3);
    let second = engine.inspect("$x", 1).await.unwrap();
    assert_eq!(second.value, json!(2));
    assert_eq!(second.step, 4);

    let values = |entries: Vec<dbgp_session::HistoryEntry>| {
        entries
            .into_iter()
            .map(|entry| (entry.step, entry.value))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        values(engine.query_history("$x", 0, 5)),
        vec![(4, json!(2)), (2, json!(1))]
    );
    assert_eq!(values(engine.query_history("$x", 1, 5)), vec![(2, json!(1))]);
    assert_eq!(values(engine.query_history("$x", 0, 1)), vec![(4, json!(2))]);
    assert!(engine.query_history("$x", 5, 5).is_empty());
    assert!(engine.query_history("$never", 0, 5).is_empty());

    // History belongs to the session.
    engine.stop().await.unwrap();
    assert!(engine.query_history("$x", 0, 5).is_empty());
}

#[tokio::test]
async fn repeated_inspections_at_one_pause_are_told_apart_by_step() {
    let root = project();
    let engine = engine(root.path());
    engine.set_breakpoint("index.php", 4, None).await.unwrap();
    let (started, _mock) =
        start_with_mock(&engine, options(false), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    wait_for_state(&engine, SessionState::Paused).await;

    let first = engine.inspect("$x", 1).await.unwrap();
    let second = engine.inspect("$x", 1).await.unwrap();
    assert_eq!((first.step, second.step), (2, 3));

    let previous = engine.query_history("$x", 1, 1);
    assert_eq!(previous.len(), 1);
    assert_eq!(previous[0].step, first.step);
    assert_eq!(previous[0].value, json!(1));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn objects_are_shown_as_structure_until_filtered() {
    let root = project();
    let engine = engine(root.path());
    engine.set_breakpoint("app/Foo.php", 10, None).await.unwrap();
    let (started, _mock) =
        start_with_mock(&engine, options(false), MockDbgpEngineConfig::default()).await;
    started.unwrap();
    wait_for_state(&engine, SessionState::Paused).await;

    let shallow = call_tool(&engine, "inspect_variable", json!({"name": "$user"}))
        .await
        .unwrap();
    assert_eq!(shallow["type"], "object");
    assert_eq!(shallow["classname"], "App\\User");
    assert_eq!(
        shallow["structure"],
        json!({
            "__class": "App\\User",
            "id": "int",
            "name": "string",
            "roles": "array(2)",
        })
    );
    assert!(shallow.get("value").is_none());

    let name = call_tool(
        &engine,
        "inspect_variable",
        json!({"name": "$user", "filter": "$.name"}),
    )
    .await
    .unwrap();
    assert_eq!(name["value"], "alice");
    assert_eq!(name["found"], true);

    let role = call_tool(
        &engine,
        "inspect_variable",
        json!({"name": "$user", "filter": "$.roles[1]", "depth": 2}),
    )
    .await
    .unwrap();
    assert_eq!(role["value"], "dev");

    let missing = call_tool(
        &engine,
        "inspect_variable",
        json!({"name": "$user", "filter": "$.email"}),
    )
    .await
    .unwrap();
    assert_eq!(missing["found"], false);
    assert_eq!(missing["value"], serde_json::Value::Null);

    // Every fetch is recorded, with the full value.
    let history = engine.query_history("$user", 0, 10);
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].value["roles"], "array(2)");
    assert_eq!(history[1].value["roles"], json!(["admin", "dev"]));

    let roles = call_tool(
        &engine,
        "inspect_variable",
        json!({"name": "$user", "filter": "$.roles[*]", "depth": 2}),
    )
    .await
    .unwrap();
    assert_eq!(roles["found"], true);
    assert_eq!(roles["value"], json!(["admin", "dev"]));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn inspecting_is_only_possible_while_paused() {
    let root = project();
    let engine = engine(root.path());
    let (started, _mock) = start_with_mock(
        &engine,
        options(false),
        MockDbgpEngineConfig {
            hang_on_continuation: true,
            ..MockDbgpEngineConfig::default()
        },
    )
    .await;
    started.unwrap();
    assert_eq!(engine.state(), SessionState::Running);

    let err = engine.inspect("$x", 1).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
    let err = engine.control(ControlAction::StepOver).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn a_rejected_inspection_ends_the_session() {
    let root = project();
    let engine = engine(root.path());
    let (started, mock) =
        start_with_mock(&engine, options(true), MockDbgpEngineConfig::default()).await;
    started.unwrap();

    let err = engine.inspect("$nope", 1).await.unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");

    let info = engine.status();
    assert_eq!(info.state, SessionState::Error);
    assert_eq!(info.step, 1);
    assert_eq!(info.last_error.map(|e| e.code), Some("PROTOCOL_ERROR"));
    assert!(engine.query_history("$nope", 0, 5).is_empty());
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);

    let err = engine.control(ControlAction::StepOver).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    engine.stop().await.unwrap();
}
