//! Line-delimited JSON tool server.
//!
//! Each input line is one request, `{"id": .., "tool": "..", "arguments": {..}}`;
//! each output line answers one, `{"id": .., "result": ..}` or
//! `{"id": .., "error": {"code": .., "message": ..}}`. Requests run
//! concurrently, so `control_execution` waiting on a running debuggee does
//! not block `get_session_status` or a `stop`. Responses may therefore come
//! back out of order; callers correlate them by `id`.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinSet,
};

use crate::{
    session::DebugEngine,
    tools::{call_tool, error_payload},
};

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    arguments: Value,
}

pub async fn run_stdio(engine: DebugEngine) -> anyhow::Result<()> {
    run(engine, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

/// Serve requests from `reader` until it reaches EOF, then stop the session
/// and wait for in-flight requests to finish.
pub async fn run<R, W>(engine: DebugEngine, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = out_rx.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(target = "dbgp.server", error = %err, "failed to encode response");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = writer.write_all(&line).await {
                tracing::warn!(target = "dbgp.server", error = %err, "output closed");
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: ToolRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(target = "dbgp.server", error = %err, "malformed request");
                let id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|value| value.get("id").cloned())
                    .unwrap_or(Value::Null);
                let _ = out_tx.send(json!({
                    "id": id,
                    "error": {"code": "INVALID_REQUEST", "message": err.to_string()},
                }));
                continue;
            }
        };

        let engine = engine.clone();
        let out_tx = out_tx.clone();
        in_flight.spawn(async move {
            let response = handle_request(&engine, request).await;
            let _ = out_tx.send(response);
        });

        while let Some(joined) = in_flight.try_join_next() {
            log_join(joined);
        }
    };

    tracing::info!(target = "dbgp.server", "input closed; shutting down");
    if let Err(err) = engine.stop().await {
        tracing::warn!(target = "dbgp.server", error = %err, "failed to stop session");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
    drop(out_tx);
    let _ = writer_task.await;
    result
}

async fn handle_request(engine: &DebugEngine, request: ToolRequest) -> Value {
    let ToolRequest { id, tool, arguments } = request;
    tracing::debug!(target = "dbgp.server", %tool, "tool call");
    match call_tool(engine, &tool, arguments).await {
        Ok(result) => json!({"id": id, "result": result}),
        Err(err) => {
            tracing::debug!(target = "dbgp.server", %tool, code = err.code(), error = %err, "tool call failed");
            json!({"id": id, "error": error_payload(&err)})
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!(target = "dbgp.server", error = %err, "request handler panicked");
        }
    }
}
