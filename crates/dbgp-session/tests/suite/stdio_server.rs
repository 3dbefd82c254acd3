use std::time::Duration;

use dbgp_session::{server, SessionState};
use dbgp_wire::mock::MockDbgpEngine;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

use crate::harness::{engine, listen_address, project};

struct Client {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
}

impl Client {
    async fn send(&mut self, request: Value) {
        let mut line = serde_json::to_vec(&request).unwrap();
        line.push(b'\n');
        self.input.write_all(&line).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.input.write_all(line.as_bytes()).await.unwrap();
        self.input.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
            .await
            .expect("no response")
            .unwrap()
            .expect("server closed output");
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, id: u64, tool: &str, arguments: Value) -> Value {
        self.send(json!({"id": id, "tool": tool, "arguments": arguments}))
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], id);
        response
    }
}

fn spawn_server(
    engine: dbgp_session::DebugEngine,
) -> (Client, tokio::task::JoinHandle<std::io::Result<()>>) {
    let (client_in, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, client_out) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(server::run(engine, server_in, server_out));
    let client = Client {
        input: client_in,
        output: BufReader::new(client_out).lines(),
    };
    (client, handle)
}

#[tokio::test]
async fn answers_each_request_line_with_a_response_line() {
    let root = project();
    let (mut client, handle) = spawn_server(engine(root.path()));

    let status = client.call(1, "get_session_status", json!({})).await;
    assert_eq!(status["result"]["state"], "idle");

    let unknown = client.call(2, "reticulate_splines", json!({})).await;
    assert_eq!(unknown["error"]["code"], "UNKNOWN_TOOL");

    let invalid = client
        .call(3, "set_breakpoint", json!({"file": "index.php", "line": -2}))
        .await;
    assert_eq!(invalid["error"]["code"], "INVALID_ARGUMENT");

    client.send_raw("{not json").await;
    let malformed = client.recv().await;
    assert_eq!(malformed["id"], Value::Null);
    assert_eq!(malformed["error"]["code"], "INVALID_REQUEST");

    let set = client
        .call(4, "set_breakpoint", json!({"file": "index.php", "line": 4}))
        .await;
    assert_eq!(set["result"]["breakpoint"]["id"], 1);
    assert_eq!(set["result"]["breakpoint"]["localFileExists"], true);
    assert_eq!(
        set["result"]["breakpoint"]["remotePath"],
        "/var/www/html/index.php"
    );

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn a_full_session_over_the_line_protocol() {
    let root = project();
    let engine = engine(root.path());
    let (mut client, handle) = spawn_server(engine.clone());

    client
        .call(1, "set_breakpoint", json!({"file": "app/Foo.php", "line": 10}))
        .await;
    client
        .send(json!({
            "id": 2,
            "tool": "start_debug_session",
            "arguments": {"command": "true"},
        }))
        .await;
    let addr = listen_address(&engine).await;
    let mock = MockDbgpEngine::connect(addr).await.unwrap();
    let started = client.recv().await;
    assert_eq!(started["id"], 2);
    assert_eq!(started["result"]["success"], true);

    // Status is answered while the debuggee runs to the breakpoint.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = client.call(3, "get_session_status", Value::Null).await;
            if status["result"]["state"] == "paused" {
                assert_eq!(status["result"]["location"]["line"], 10);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("never paused");

    let inspected = client
        .call(4, "inspect_variable", json!({"name": "$x", "filter": "$"}))
        .await;
    assert_eq!(inspected["result"]["value"], 2);
    assert_eq!(inspected["result"]["step"], 2);

    let stepped = client
        .call(5, "control_execution", json!({"action": "step_over"}))
        .await;
    assert_eq!(stepped["result"]["session"]["step"], 3);
    client
        .call(6, "inspect_variable", json!({"name": "$x", "filter": "$"}))
        .await;

    let history = client
        .call(7, "query_history", json!({"variable_name": "$x", "steps_ago": 0}))
        .await;
    assert_eq!(history["result"]["count"], 2);
    assert_eq!(history["result"]["entries"][0]["value"], 3);
    assert_eq!(history["result"]["entries"][1]["value"], 2);

    // Closing input ends the session.
    drop(client);
    handle.await.unwrap().unwrap();
    assert_eq!(engine.state(), SessionState::Stopped);
    assert!(mock.wait_disconnected(Duration::from_secs(2)).await);
}
