use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use super::{codec::encode_frame, uri::file_uri_to_path, uri::path_to_file_uri};

const NS: &str = r#"xmlns="urn:debugger_protocol_v1" xmlns:xdebug="https://xdebug.org/dbgp/xdebug""#;

/// A scripted debugger engine that behaves like Xdebug for testing.
///
/// Like a real debuggee, it *connects to* the IDE's listener, sends `<init>`,
/// and then answers commands. Execution is modelled as a fixed trace of
/// source positions: `step_*` advance one position, `run` advances to the next
/// position that matches a breakpoint (or to the end, reporting `stopping`).
pub struct MockDbgpEngine {
    state: Arc<State>,
    shutdown: CancellationToken,
    disconnected: CancellationToken,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MockValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<(String, MockValue)>),
    Object {
        class: String,
        fields: Vec<(String, MockValue)>,
    },
}

#[derive(Clone, Debug)]
pub struct MockPosition {
    /// Debuggee path (not a URI).
    pub file: String,
    pub line: u32,
    pub variables: Vec<(String, MockValue)>,
    /// Raise this exception when execution reaches the position.
    pub exception: Option<String>,
}

impl MockPosition {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            variables: Vec::new(),
            exception: None,
        }
    }

    pub fn var(mut self, name: impl Into<String>, value: MockValue) -> Self {
        self.variables.push((name.into(), value));
        self
    }

    pub fn throws(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct MockDbgpEngineConfig {
    pub entry_file: String,
    pub trace: Vec<MockPosition>,
    /// Reply to every `breakpoint_set` with an engine error.
    pub reject_breakpoints: bool,
    /// Echo a wrong transaction id in the response to this command.
    pub mismatch_transaction_on: Option<String>,
    /// Answer this command with a frame whose length prefix is garbage.
    pub malformed_frame_on: Option<String>,
    /// Never answer continuation commands (`run`, `step_*`).
    pub hang_on_continuation: bool,
    /// Delay before the init packet is sent.
    pub init_delay: Duration,
}

impl Default for MockDbgpEngineConfig {
    fn default() -> Self {
        let entry = "/var/www/html/index.php".to_string();
        let foo = "/var/www/html/app/Foo.php".to_string();
        let user = MockValue::Object {
            class: "App\\User".to_string(),
            fields: vec![
                ("id".to_string(), MockValue::Int(42)),
                ("name".to_string(), MockValue::Str("alice".to_string())),
                (
                    "roles".to_string(),
                    MockValue::Array(vec![
                        ("0".to_string(), MockValue::Str("admin".to_string())),
                        ("1".to_string(), MockValue::Str("dev".to_string())),
                    ]),
                ),
            ],
        };
        Self {
            trace: vec![
                MockPosition::new(entry.clone(), 3),
                MockPosition::new(entry.clone(), 4).var("$x", MockValue::Int(1)),
                MockPosition::new(foo.clone(), 10)
                    .var("$x", MockValue::Int(2))
                    .var("$user", user.clone()),
                MockPosition::new(foo, 11)
                    .var("$x", MockValue::Int(3))
                    .var("$user", user),
                MockPosition::new(entry.clone(), 5).var("$x", MockValue::Int(3)),
            ],
            entry_file: entry,
            reject_breakpoints: false,
            mismatch_transaction_on: None,
            malformed_frame_on: None,
            hang_on_continuation: false,
            init_delay: Duration::ZERO,
        }
    }
}

/// A command as received by the mock, with its transaction id removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCommand {
    pub name: String,
    pub transaction_id: Option<u32>,
    pub args: Vec<(char, String)>,
    /// Decoded `--` payload.
    pub data: Option<String>,
}

impl MockCommand {
    pub fn arg(&self, flag: char) -> Option<&str> {
        self.args
            .iter()
            .find(|(f, _)| *f == flag)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockBreakpoint {
    pub id: String,
    pub kind: String,
    /// Debuggee path for line breakpoints.
    pub file: Option<String>,
    pub line: Option<u32>,
    pub exception: Option<String>,
    pub condition: Option<String>,
}

struct State {
    config: MockDbgpEngineConfig,
    commands: Mutex<Vec<MockCommand>>,
    breakpoints: Mutex<Vec<MockBreakpoint>>,
    connected: AtomicBool,
}

struct Session {
    pc: Option<usize>,
    max_depth: u32,
    next_breakpoint_id: u32,
}

impl MockDbgpEngine {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        Self::connect_with_config(addr, MockDbgpEngineConfig::default()).await
    }

    pub async fn connect_with_config(
        addr: SocketAddr,
        config: MockDbgpEngineConfig,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let state = Arc::new(State {
            config,
            commands: Mutex::new(Vec::new()),
            breakpoints: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        });
        let shutdown = CancellationToken::new();
        let disconnected = CancellationToken::new();

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        let task_disconnected = disconnected.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_shutdown.cancelled() => {}
                _ = run(stream, task_state.clone()) => {}
            }
            task_state.connected.store(false, Ordering::SeqCst);
            task_disconnected.cancel();
        });

        Ok(Self {
            state,
            shutdown,
            disconnected,
        })
    }

    pub async fn commands(&self) -> Vec<MockCommand> {
        self.state.commands.lock().await.clone()
    }

    pub async fn command_names(&self) -> Vec<String> {
        self.commands().await.into_iter().map(|c| c.name).collect()
    }

    pub async fn breakpoints(&self) -> Vec<MockBreakpoint> {
        self.state.breakpoints.lock().await.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Wait until the IDE closes the connection. Returns `false` on timeout.
    pub async fn wait_disconnected(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.disconnected.cancelled())
            .await
            .is_ok()
    }
}

impl Drop for MockDbgpEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    if !state.config.init_delay.is_zero() {
        tokio::time::sleep(state.config.init_delay).await;
    }
    let init = format!(
        r#"<?xml version="1.0" encoding="iso-8859-1"?>
<init {NS} fileuri="{}" language="PHP" xdebug:language_version="8.2.0" protocol_version="1.0" appid="1" idekey="mock"><engine version="3.3.0"><![CDATA[Xdebug]]></engine></init>"#,
        escape(&path_to_file_uri(&state.config.entry_file))
    );
    writer.write_all(&encode_frame(init.as_bytes())).await?;

    let mut session = Session {
        pc: None,
        max_depth: 1,
        next_breakpoint_id: 1,
    };

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(0, &mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if line.last() == Some(&0) {
            line.pop();
        }
        let cmd = parse_command(&String::from_utf8_lossy(&line));
        state.commands.lock().await.push(cmd.clone());

        if state.config.malformed_frame_on.as_deref() == Some(cmd.name.as_str()) {
            writer.write_all(b"12x\0<garbage/>\0").await?;
            continue;
        }

        let is_continuation = matches!(
            cmd.name.as_str(),
            "run" | "step_into" | "step_over" | "step_out"
        );
        if is_continuation && state.config.hang_on_continuation {
            continue;
        }

        let mut tid = cmd.transaction_id.unwrap_or(0);
        if state.config.mismatch_transaction_on.as_deref() == Some(cmd.name.as_str()) {
            tid += 1000;
        }

        let (body, close) = respond(&state, &mut session, &cmd, tid).await;
        writer.write_all(&encode_frame(body.as_bytes())).await?;
        if close {
            let _ = writer.shutdown().await;
            return Ok(());
        }
    }
}

async fn respond(state: &State, session: &mut Session, cmd: &MockCommand, tid: u32) -> (String, bool) {
    let name = cmd.name.as_str();
    match name {
        "feature_set" => {
            if cmd.arg('n') == Some("max_depth") {
                session.max_depth = cmd.arg('v').and_then(|v| v.parse().ok()).unwrap_or(1);
            }
            let feature = cmd.arg('n').unwrap_or_default();
            (
                format!(
                    r#"<response {NS} command="feature_set" transaction_id="{tid}" feature="{}" success="1"></response>"#,
                    escape(feature)
                ),
                false,
            )
        }
        "breakpoint_set" => {
            if state.config.reject_breakpoints {
                return (error_response(name, tid, 200, "breakpoint could not be set"), false);
            }
            let id = format!("{}", 100_000 + session.next_breakpoint_id);
            session.next_breakpoint_id += 1;
            state.breakpoints.lock().await.push(MockBreakpoint {
                id: id.clone(),
                kind: cmd.arg('t').unwrap_or("line").to_string(),
                file: cmd.arg('f').map(file_uri_to_path),
                line: cmd.arg('n').and_then(|n| n.parse().ok()),
                exception: cmd.arg('x').map(str::to_string),
                condition: cmd.data.clone(),
            });
            (
                format!(
                    r#"<response {NS} command="breakpoint_set" transaction_id="{tid}" id="{id}" state="enabled"></response>"#
                ),
                false,
            )
        }
        "breakpoint_remove" => {
            let id = cmd.arg('d').unwrap_or_default().to_string();
            let mut bps = state.breakpoints.lock().await;
            let before = bps.len();
            bps.retain(|bp| bp.id != id);
            if bps.len() == before {
                return (error_response(name, tid, 205, "no such breakpoint"), false);
            }
            (
                format!(r#"<response {NS} command="breakpoint_remove" transaction_id="{tid}"></response>"#),
                false,
            )
        }
        "run" | "step_into" | "step_over" | "step_out" => {
            let next = if name == "run" {
                next_stop(state, session).await
            } else {
                session.pc.map(|pc| pc + 1).or(Some(0))
            };
            match next.and_then(|pc| state.config.trace.get(pc).map(|pos| (pc, pos))) {
                Some((pc, pos)) => {
                    session.pc = Some(pc);
                    let exception = match &pos.exception {
                        Some(class) => format!(r#" exception="{}" code="0""#, escape(class)),
                        None => String::new(),
                    };
                    let text = if pos.exception.is_some() { "<![CDATA[mock exception]]>" } else { "" };
                    (
                        format!(
                            r#"<response {NS} command="{name}" transaction_id="{tid}" status="break" reason="ok"><xdebug:message filename="{}" lineno="{}"{exception}>{text}</xdebug:message></response>"#,
                            escape(&path_to_file_uri(&pos.file)),
                            pos.line
                        ),
                        false,
                    )
                }
                None => {
                    session.pc = Some(state.config.trace.len());
                    (
                        format!(
                            r#"<response {NS} command="{name}" transaction_id="{tid}" status="stopping" reason="ok"></response>"#
                        ),
                        false,
                    )
                }
            }
        }
        "property_get" => {
            let fullname = cmd.arg('n').unwrap_or_default();
            let value = session
                .pc
                .and_then(|pc| state.config.trace.get(pc))
                .and_then(|pos| pos.variables.iter().find(|(n, _)| n == fullname))
                .map(|(_, v)| v.clone());
            match value {
                Some(value) => {
                    let mut xml = String::new();
                    render_property(&mut xml, fullname, fullname, &value, session.max_depth);
                    (
                        format!(
                            r#"<response {NS} command="property_get" transaction_id="{tid}">{xml}</response>"#
                        ),
                        false,
                    )
                }
                None => (error_response(name, tid, 300, "can not get property"), false),
            }
        }
        "status" => {
            let status = match session.pc {
                Some(pc) if pc >= state.config.trace.len() => "stopping",
                Some(_) => "break",
                None => "starting",
            };
            (
                format!(
                    r#"<response {NS} command="status" transaction_id="{tid}" status="{status}" reason="ok"></response>"#
                ),
                false,
            )
        }
        "stop" | "detach" => (
            format!(
                r#"<response {NS} command="{name}" transaction_id="{tid}" status="stopped" reason="ok"></response>"#
            ),
            true,
        ),
        _ => (error_response(name, tid, 4, "unimplemented command"), false),
    }
}

async fn next_stop(state: &State, session: &Session) -> Option<usize> {
    let breakpoints = state.breakpoints.lock().await;
    let break_on_exception = breakpoints.iter().any(|bp| bp.kind == "exception");
    let start = session.pc.map(|pc| pc + 1).unwrap_or(0);
    (start..state.config.trace.len()).find(|&pc| {
        let pos = &state.config.trace[pc];
        if break_on_exception && pos.exception.is_some() {
            return true;
        }
        breakpoints.iter().any(|bp| {
            bp.file.as_deref() == Some(pos.file.as_str()) && bp.line == Some(pos.line)
        })
    })
}

fn error_response(command: &str, tid: u32, code: u32, message: &str) -> String {
    format!(
        r#"<response {NS} command="{command}" transaction_id="{tid}"><error code="{code}"><message><![CDATA[{message}]]></message></error></response>"#
    )
}

fn render_property(out: &mut String, name: &str, fullname: &str, value: &MockValue, depth: u32) {
    let name = escape(name);
    let full = escape(fullname);
    match value {
        MockValue::Null => out.push_str(&format!(
            r#"<property name="{name}" fullname="{full}" type="null"></property>"#
        )),
        MockValue::Bool(b) => out.push_str(&format!(
            r#"<property name="{name}" fullname="{full}" type="bool"><![CDATA[{}]]></property>"#,
            u8::from(*b)
        )),
        MockValue::Int(i) => out.push_str(&format!(
            r#"<property name="{name}" fullname="{full}" type="int"><![CDATA[{i}]]></property>"#
        )),
        MockValue::Float(f) => out.push_str(&format!(
            r#"<property name="{name}" fullname="{full}" type="float"><![CDATA[{f}]]></property>"#
        )),
        MockValue::Str(s) => out.push_str(&format!(
            r#"<property name="{name}" fullname="{full}" type="string" size="{}" encoding="base64"><![CDATA[{}]]></property>"#,
            s.len(),
            STANDARD.encode(s.as_bytes())
        )),
        MockValue::Array(items) => {
            out.push_str(&format!(
                r#"<property name="{name}" fullname="{full}" type="array" children="{}" numchildren="{}" page="0" pagesize="32">"#,
                u8::from(!items.is_empty()),
                items.len()
            ));
            if depth > 0 {
                for (key, item) in items {
                    render_property(out, key, &format!("{fullname}[{key}]"), item, depth - 1);
                }
            }
            out.push_str("</property>");
        }
        MockValue::Object { class, fields } => {
            out.push_str(&format!(
                r#"<property name="{name}" fullname="{full}" type="object" classname="{}" children="{}" numchildren="{}" page="0" pagesize="32">"#,
                escape(class),
                u8::from(!fields.is_empty()),
                fields.len()
            ));
            if depth > 0 {
                for (field, item) in fields {
                    render_property(out, field, &format!("{fullname}->{field}"), item, depth - 1);
                }
            }
            out.push_str("</property>");
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    other => token.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    tokens
}

fn parse_command(line: &str) -> MockCommand {
    let (head, data) = match line.split_once(" -- ") {
        Some((head, data)) => (head, Some(data.trim())),
        None => (line, None),
    };
    let mut tokens = tokenize(head).into_iter();
    let name = tokens.next().unwrap_or_default();
    let mut args = Vec::new();
    let mut transaction_id = None;
    while let Some(flag) = tokens.next() {
        let Some(flag) = flag.strip_prefix('-').and_then(|f| f.chars().next()) else {
            continue;
        };
        let value = tokens.next().unwrap_or_default();
        if flag == 'i' {
            transaction_id = value.parse().ok();
        } else {
            args.push((flag, value));
        }
    }
    let data = data.and_then(|d| STANDARD.decode(d.as_bytes()).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    MockCommand {
        name,
        transaction_id,
        args,
        data,
    }
}
