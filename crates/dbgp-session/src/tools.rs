//! Tool-call surface over [`DebugEngine`].
//!
//! Validates JSON arguments, applies the caller-side conveniences (local file
//! check, value filters, structure-only views) and shapes results as JSON.
//! Holds no session state of its own.

use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::{
    error::{DebugError, DebugResult, Warning},
    session::{DebugEngine, SessionInfo, StartOptions, MAX_INSPECT_DEPTH, MIN_INSPECT_DEPTH},
    state::{ControlAction, SessionState},
    value::apply_filter,
};

pub const TOOL_NAMES: [&str; 7] = [
    "start_debug_session",
    "set_breakpoint",
    "remove_breakpoint",
    "inspect_variable",
    "control_execution",
    "get_session_status",
    "query_history",
];

const MAX_HISTORY_LIMIT: i64 = 1_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartArgs {
    command: String,
    #[serde(default)]
    stop_on_entry: bool,
    #[serde(default)]
    stop_on_exception: bool,
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetBreakpointArgs {
    file: String,
    line: i64,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoveBreakpointArgs {
    breakpoint_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InspectArgs {
    name: String,
    filter: Option<String>,
    #[serde(default = "InspectArgs::default_depth")]
    depth: i64,
}

impl InspectArgs {
    fn default_depth() -> i64 {
        i64::from(MIN_INSPECT_DEPTH)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlArgs {
    action: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryHistoryArgs {
    variable_name: String,
    #[serde(default = "QueryHistoryArgs::default_steps_ago")]
    steps_ago: i64,
    #[serde(default = "QueryHistoryArgs::default_limit")]
    limit: i64,
}

impl QueryHistoryArgs {
    fn default_steps_ago() -> i64 {
        1
    }

    fn default_limit() -> i64 {
        5
    }
}

/// Dispatch one tool call.
pub async fn call_tool(engine: &DebugEngine, tool: &str, arguments: Value) -> DebugResult<Value> {
    match tool {
        "start_debug_session" => start_debug_session(engine, parse(arguments)?).await,
        "set_breakpoint" => set_breakpoint(engine, parse(arguments)?).await,
        "remove_breakpoint" => remove_breakpoint(engine, parse(arguments)?).await,
        "inspect_variable" => inspect_variable(engine, parse(arguments)?).await,
        "control_execution" => control_execution(engine, parse(arguments)?).await,
        "get_session_status" => Ok(session_json(&engine.status())),
        "query_history" => query_history(engine, parse(arguments)?),
        other => Err(DebugError::UnknownTool(other.to_string())),
    }
}

/// `{code, message}` plus whatever context the error carries.
pub fn error_payload(err: &DebugError) -> Value {
    let mut payload = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let DebugError::BreakpointRejected { breakpoint, .. } = err {
        payload["breakpoint"] = json!(breakpoint);
    }
    payload
}

fn parse<T: DeserializeOwned>(arguments: Value) -> DebugResult<T> {
    let arguments = match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(arguments).map_err(|err| DebugError::InvalidArgument(err.to_string()))
}

fn require_non_empty(field: &str, value: &str) -> DebugResult<()> {
    if value.trim().is_empty() {
        return Err(DebugError::InvalidArgument(format!("`{field}` must not be empty")));
    }
    Ok(())
}

fn session_json(info: &SessionInfo) -> Value {
    json!(info)
}

async fn start_debug_session(engine: &DebugEngine, args: StartArgs) -> DebugResult<Value> {
    require_non_empty("command", &args.command)?;
    let info = engine
        .start(StartOptions {
            command: args.command,
            stop_on_entry: args.stop_on_entry,
            stop_on_exception: args.stop_on_exception,
            working_directory: args.working_directory,
        })
        .await?;

    let message = match (&info.state, &info.location) {
        (SessionState::Paused, Some(location)) => format!(
            "Debugger connected; paused at {}:{}",
            location.local_file.as_deref().unwrap_or(&location.remote_file),
            location.line
        ),
        (SessionState::Running, _) => {
            "Debugger connected; running until a breakpoint or exception is hit".to_string()
        }
        (SessionState::Stopped, _) => "Debugger connected; the script already finished".to_string(),
        (state, _) => format!("Debugger connected; session is {state}"),
    };
    Ok(json!({
        "success": true,
        "session": session_json(&info),
        "message": message,
    }))
}

async fn set_breakpoint(engine: &DebugEngine, args: SetBreakpointArgs) -> DebugResult<Value> {
    require_non_empty("file", &args.file)?;
    let line = u32::try_from(args.line)
        .ok()
        .filter(|line| *line > 0)
        .ok_or_else(|| {
            DebugError::InvalidArgument(format!("`line` must be a positive integer, got {}", args.line))
        })?;

    let local_path = engine.path_mapper().resolve_local(&args.file);
    let local_file_exists = tokio::fs::try_exists(&local_path).await.unwrap_or(false);

    let outcome = engine.set_breakpoint(&args.file, line, args.condition).await?;
    let mut warnings = outcome.warnings;
    if !local_file_exists {
        warnings.push(Warning {
            code: "LOCAL_FILE_NOT_FOUND",
            message: format!(
                "local file not found at {}; check the project root ({}) and path mappings",
                local_path.display(),
                engine.path_mapper().project_root().display()
            ),
        });
    }

    let bp = &outcome.breakpoint;
    let mut message = match &bp.condition {
        Some(condition) => format!(
            "Conditional breakpoint set at {}:{} (when: {condition})",
            bp.local_file, bp.line
        ),
        None => format!("Breakpoint set at {}:{}", bp.local_file, bp.line),
    };
    if let Some(remote) = &bp.remote_file {
        message.push_str(&format!(" (debuggee path: {remote})"));
    }

    Ok(json!({
        "success": true,
        "breakpoint": {
            "id": bp.id,
            "file": bp.local_file,
            "line": bp.line,
            "condition": bp.condition,
            "remotePath": bp.remote_file,
            "installed": bp.installed,
            "engineId": bp.engine_id,
            "installError": bp.install_error,
            "localFileExists": local_file_exists,
        },
        "warnings": warnings,
        "message": message,
    }))
}

async fn remove_breakpoint(engine: &DebugEngine, args: RemoveBreakpointArgs) -> DebugResult<Value> {
    let removed = engine.remove_breakpoint(args.breakpoint_id).await?;
    Ok(json!({
        "success": true,
        "breakpoint": removed,
    }))
}

async fn inspect_variable(engine: &DebugEngine, args: InspectArgs) -> DebugResult<Value> {
    require_non_empty("name", &args.name)?;
    let depth = u32::try_from(args.depth)
        .ok()
        .filter(|depth| (MIN_INSPECT_DEPTH..=MAX_INSPECT_DEPTH).contains(depth))
        .ok_or_else(|| {
            DebugError::InvalidArgument(format!(
                "`depth` must be between {MIN_INSPECT_DEPTH} and {MAX_INSPECT_DEPTH}, got {}",
                args.depth
            ))
        })?;
    // Reject a bad filter before touching the debuggee.
    if let Some(filter) = &args.filter {
        apply_filter(&Value::Null, filter).map_err(DebugError::InvalidArgument)?;
    }

    let result = engine.inspect(&args.name, depth).await?;
    match &args.filter {
        Some(filter) => {
            let selected = apply_filter(&result.value, filter).map_err(DebugError::InvalidArgument)?;
            Ok(json!({
                "name": result.name,
                "type": result.kind,
                "classname": result.classname,
                "step": result.step,
                "filter": filter,
                "found": selected.is_some(),
                "value": selected,
            }))
        }
        None => Ok(json!({
            "name": result.name,
            "type": result.kind,
            "classname": result.classname,
            "step": result.step,
            "structure": result.structure,
            "hint": "structure only; pass a filter such as \"$.field\" to read values",
        })),
    }
}

async fn control_execution(engine: &DebugEngine, args: ControlArgs) -> DebugResult<Value> {
    let action: ControlAction = args.action.parse().map_err(DebugError::InvalidArgument)?;
    let info = engine.control(action).await?;
    Ok(json!({
        "success": true,
        "action": action,
        "session": session_json(&info),
    }))
}

fn query_history(engine: &DebugEngine, args: QueryHistoryArgs) -> DebugResult<Value> {
    require_non_empty("variable_name", &args.variable_name)?;
    let steps_ago = u64::try_from(args.steps_ago).map_err(|_| {
        DebugError::InvalidArgument(format!("`steps_ago` must not be negative, got {}", args.steps_ago))
    })?;
    if !(1..=MAX_HISTORY_LIMIT).contains(&args.limit) {
        return Err(DebugError::InvalidArgument(format!(
            "`limit` must be between 1 and {MAX_HISTORY_LIMIT}, got {}",
            args.limit
        )));
    }
    let limit = usize::try_from(args.limit).unwrap_or(1);

    let entries = engine.query_history(&args.variable_name, steps_ago, limit);
    Ok(json!({
        "variableName": args.variable_name,
        "stepsAgo": steps_ago,
        "count": entries.len(),
        "entries": entries,
    }))
}
