//! The debug session engine.
//!
//! [`DebugEngine`] owns the one session the process may run at a time: the
//! listener, the live [`DbgpConnection`], the trigger process, the breakpoint
//! registry and the history recorder. Callers only ever go through its
//! operations.
//!
//! Locking:
//!
//! - `shared` (sync) guards the session value. It is never held across an
//!   `.await`, so [`DebugEngine::status`] never blocks.
//! - `conn` (async) guards the connection and is held across a whole
//!   "send command, await its response" exchange. While the debuggee runs,
//!   the task waiting for the next break holds it.
//! - `lifecycle` (async) is held by `start` until the session is connected.
//!   `stop` acquires it after cancelling, so it cannot return while a
//!   listener from the cancelled start is still bound.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use dbgp_config::{DebugConfig, PathMapping};
use dbgp_wire::{
    uri::{file_uri_to_path, path_to_file_uri},
    BreakLocation, CancellationToken, Command, DbgpConnection, DbgpConnectionConfig, DbgpError,
    EngineStatus, InitPacket, Property, Response,
};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use tokio::{net::TcpListener, sync::Mutex as AsyncMutex};

use crate::{
    breakpoints::{Breakpoint, BreakpointId, BreakpointRegistry},
    error::{DebugError, DebugResult, ErrorInfo, Warning},
    history::{HistoryEntry, HistoryRecorder},
    path_map::PathMapper,
    state::{ControlAction, PauseReason, SessionState},
    trigger::{TriggerProcess, TriggerStatus},
    value::{property_to_json, structure_view},
};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CHILDREN: u32 = 100;
pub const DEFAULT_MAX_DATA: u32 = 64 * 1024;
pub const MIN_INSPECT_DEPTH: u32 = 1;
pub const MAX_INSPECT_DEPTH: u32 = 3;

/// How long a polite `stop` may take before the socket is simply closed.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Bound on replies to non-resuming commands.
    pub reply_timeout: Duration,
    pub project_root: PathBuf,
    pub path_mappings: Vec<PathMapping>,
    pub history_limit: usize,
    pub max_children: u32,
    pub max_data: u32,
}

impl EngineConfig {
    pub fn from_config(config: &DebugConfig) -> Self {
        Self {
            listen_host: config.listen.host.clone(),
            port: config.listen.port,
            connect_timeout: config.listen.connect_timeout(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            project_root: config.project_root(),
            path_mappings: config.resolve_path_mappings(),
            history_limit: config.history.max_entries_per_variable,
            max_children: DEFAULT_MAX_CHILDREN,
            max_data: DEFAULT_MAX_DATA,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = DebugConfig::default();
        Self {
            listen_host: defaults.listen.host.clone(),
            port: defaults.listen.port,
            connect_timeout: defaults.listen.connect_timeout(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            project_root: PathBuf::from("."),
            path_mappings: Vec::new(),
            history_limit: defaults.history.max_entries_per_variable,
            max_children: DEFAULT_MAX_CHILDREN,
            max_data: DEFAULT_MAX_DATA,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Shell command that makes the debuggee run and connect back.
    pub command: String,
    pub stop_on_entry: bool,
    pub stop_on_exception: bool,
    /// Defaults to the project root.
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseLocation {
    /// Path as reported by the debuggee.
    pub remote_file: String,
    /// `remote_file` translated back through the path mappings.
    pub local_file: Option<String>,
    pub line: u32,
    pub reason: PauseReason,
    pub exception: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInfo {
    pub file: String,
    pub language: Option<String>,
    pub engine: Option<String>,
    pub engine_version: Option<String>,
    pub protocol_version: Option<String>,
    pub idekey: Option<String>,
}

impl From<&InitPacket> for EngineInfo {
    fn from(init: &InitPacket) -> Self {
        Self {
            file: file_uri_to_path(&init.file_uri),
            language: init.language.clone(),
            engine: init.engine.clone(),
            engine_version: init.engine_version.clone(),
            protocol_version: init.protocol_version.clone(),
            idekey: init.idekey.clone(),
        }
    }
}

/// Snapshot returned by `status` and by the lifecycle operations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub state: SessionState,
    pub active: bool,
    pub step: u64,
    pub location: Option<PauseLocation>,
    pub available_actions: Vec<ControlAction>,
    pub breakpoints: Vec<Breakpoint>,
    pub listen_address: Option<String>,
    pub options: Option<StartOptions>,
    pub engine: Option<EngineInfo>,
    pub trigger: Option<TriggerStatus>,
    pub last_error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointOutcome {
    pub breakpoint: Breakpoint,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub classname: Option<String>,
    pub step: u64,
    pub depth: u32,
    /// Full value, as recorded in the history.
    pub value: Value,
    /// Keys and types only.
    pub structure: Value,
}

struct Shared {
    state: SessionState,
    /// Bumped whenever a session begins or ends; work started for an older
    /// generation must not touch the current one.
    generation: u64,
    cancel: CancellationToken,
    options: Option<StartOptions>,
    listen_addr: Option<SocketAddr>,
    engine: Option<EngineInfo>,
    location: Option<PauseLocation>,
    step: u64,
    registry: BreakpointRegistry,
    /// Engine ids of breakpoints removed while the debuggee was running.
    pending_removals: Vec<String>,
    history: HistoryRecorder,
    trigger: Option<TriggerProcess>,
    last_error: Option<ErrorInfo>,
}

impl Shared {
    fn begin(&mut self, options: StartOptions) -> (u64, CancellationToken) {
        self.generation += 1;
        self.cancel = CancellationToken::new();
        self.state = SessionState::Initializing;
        self.options = Some(options);
        self.listen_addr = None;
        self.engine = None;
        self.location = None;
        self.step = 0;
        self.history.clear();
        self.registry.reset_installation();
        self.pending_removals.clear();
        self.last_error = None;
        if let Some(previous) = self.trigger.take() {
            previous.kill();
        }
        (self.generation, self.cancel.clone())
    }

    /// Transition to Stopped and drop all per-session data.
    fn end(&mut self, kill_trigger: bool) {
        self.generation += 1;
        self.cancel.cancel();
        self.state = SessionState::Stopped;
        self.listen_addr = None;
        self.location = None;
        self.step = 0;
        self.registry.clear();
        self.pending_removals.clear();
        self.history.clear();
        if kill_trigger {
            if let Some(trigger) = &self.trigger {
                trigger.kill();
            }
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            state: self.state,
            active: self.state.is_active(),
            step: self.step,
            location: self.location.clone(),
            available_actions: self.state.available_actions().to_vec(),
            breakpoints: self.registry.list(),
            listen_address: self.listen_addr.map(|addr| addr.to_string()),
            options: self.options.clone(),
            engine: self.engine.clone(),
            trigger: self.trigger.as_ref().map(TriggerProcess::status),
            last_error: self.last_error.clone(),
        }
    }
}

struct Inner {
    config: EngineConfig,
    mapper: PathMapper,
    shared: Mutex<Shared>,
    conn: Arc<AsyncMutex<Option<DbgpConnection>>>,
    lifecycle: AsyncMutex<()>,
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct DebugEngine {
    inner: Arc<Inner>,
}

impl DebugEngine {
    pub fn new(config: EngineConfig) -> Self {
        let mapper = PathMapper::new(config.project_root.clone(), &config.path_mappings);
        let shared = Shared {
            state: SessionState::Idle,
            generation: 0,
            cancel: CancellationToken::new(),
            options: None,
            listen_addr: None,
            engine: None,
            location: None,
            step: 0,
            registry: BreakpointRegistry::new(),
            pending_removals: Vec::new(),
            history: HistoryRecorder::new(config.history_limit),
            trigger: None,
            last_error: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                mapper,
                shared: Mutex::new(shared),
                conn: Arc::new(AsyncMutex::new(None)),
                lifecycle: AsyncMutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn path_mapper(&self) -> &PathMapper {
        &self.inner.mapper
    }

    /// Snapshot of the session. Never waits on the connection.
    pub fn status(&self) -> SessionInfo {
        self.inner.shared.lock().info()
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.lock().state
    }

    /// Listen, run the trigger command, and wait for the debuggee.
    ///
    /// Returns once the session is paused at the entry point
    /// (`stop_on_entry`) or running after `run` was issued.
    pub async fn start(&self, options: StartOptions) -> DebugResult<SessionInfo> {
        let (generation, cancel) = {
            let mut shared = self.inner.shared.lock();
            if !shared.state.can_start() {
                return Err(DebugError::SessionAlreadyActive {
                    state: shared.state,
                });
            }
            shared.begin(options.clone())
        };
        tracing::info!(
            target = "dbgp.session",
            generation,
            command = %options.command,
            stop_on_entry = options.stop_on_entry,
            stop_on_exception = options.stop_on_exception,
            "starting debug session"
        );

        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.establish(generation, &cancel, &options).await {
            Ok(info) => Ok(info),
            Err(err) => {
                self.fail(generation, &err);
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        options: &StartOptions,
    ) -> DebugResult<SessionInfo> {
        let config = &self.inner.config;
        let addr = format!("{}:{}", config.listen_host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| DebugError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().ok();
        {
            let mut shared = self.lock_current(generation)?;
            shared.state = SessionState::Listening;
            shared.listen_addr = local_addr;
        }
        tracing::info!(target = "dbgp.session", addr = ?local_addr, "listening for debugger engine");

        let cwd = options
            .working_directory
            .clone()
            .unwrap_or_else(|| config.project_root.clone());
        let trigger = TriggerProcess::spawn(&options.command, &cwd).map_err(|source| {
            DebugError::TriggerFailed {
                command: options.command.clone(),
                source,
            }
        })?;
        self.lock_current(generation)?.trigger = Some(trigger);

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(DebugError::SessionStopped),
            accepted = tokio::time::timeout(config.connect_timeout, listener.accept()) => match accepted {
                Err(_) => {
                    return Err(DebugError::ConnectionTimeout {
                        timeout: config.connect_timeout,
                    })
                }
                Ok(Err(source)) => return Err(DebugError::Listen { addr, source }),
                Ok(Ok((stream, peer))) => {
                    tracing::info!(target = "dbgp.session", %peer, "debugger engine connected");
                    stream
                }
            },
        };
        // One debuggee per session.
        drop(listener);

        let mut conn = DbgpConnection::with_config(
            stream,
            DbgpConnectionConfig {
                reply_timeout: config.reply_timeout,
            },
        );
        let init = tokio::select! {
            _ = cancel.cancelled() => return Err(DebugError::SessionStopped),
            init = tokio::time::timeout(config.reply_timeout, conn.read_init()) => {
                init.map_err(|_| DbgpError::Timeout)??
            }
        };

        let mut slot = self.inner.conn.clone().lock_owned().await;
        {
            let mut shared = self.lock_current(generation)?;
            shared.state = SessionState::Connected;
            shared.engine = Some(EngineInfo::from(&init));
        }
        *slot = Some(conn);

        if let Err(err) = self.negotiate(generation, cancel, options, &mut slot).await {
            return Err(self.abort(generation, &mut slot, err));
        }

        if options.stop_on_entry {
            let entry = BreakLocation {
                file_uri: init.file_uri.clone(),
                line: 1,
                exception: None,
                message: None,
            };
            self.resume(
                generation,
                cancel,
                &mut slot,
                Command::step_into(),
                PauseReason::Entry,
                Some(entry),
            )
            .await?;
            return Ok(self.status());
        }

        // `negotiate` moved the session to Running; the break is awaited in
        // the background while the caller gets control back.
        let engine = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut slot = slot;
            let _ = engine
                .resume(
                    generation,
                    &cancel,
                    &mut slot,
                    Command::run(),
                    PauseReason::Breakpoint,
                    None,
                )
                .await;
        });
        Ok(self.status())
    }

    /// Post-init handshake: engine features, the exception breakpoint, and
    /// every breakpoint registered so far.
    async fn negotiate(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        options: &StartOptions,
        slot: &mut Option<DbgpConnection>,
    ) -> DebugResult<()> {
        let config = &self.inner.config;
        let conn = slot.as_mut().ok_or(DebugError::SessionStopped)?;

        for (feature, value) in [
            ("max_children", config.max_children),
            ("max_data", config.max_data),
            ("max_depth", MIN_INSPECT_DEPTH),
        ] {
            conn.send(&Command::feature_set(feature, value), cancel).await?;
        }

        if options.stop_on_exception {
            conn.send(&Command::exception_breakpoint("*"), cancel).await?;
        }

        let next = (!options.stop_on_entry).then_some(SessionState::Running);
        self.flush_breakpoints(generation, cancel, conn, next).await
    }

    /// Send every pending breakpoint change, in registration order, until
    /// none are left. When `then` is set the state moves there atomically
    /// with observing an empty queue, so a breakpoint registered
    /// concurrently is either flushed here or deferred to the next pause.
    async fn flush_breakpoints(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        conn: &mut DbgpConnection,
        then: Option<SessionState>,
    ) -> DebugResult<()> {
        loop {
            let (pending, removals) = {
                let mut shared = self.lock_current(generation)?;
                let pending = shared.registry.pending();
                let removals = std::mem::take(&mut shared.pending_removals);
                if pending.is_empty() && removals.is_empty() {
                    if let Some(next) = then {
                        shared.state = next;
                    }
                    return Ok(());
                }
                (pending, removals)
            };

            for engine_id in removals {
                conn.send(&Command::breakpoint_remove(&engine_id), cancel).await?;
            }

            for breakpoint in pending {
                self.install(generation, cancel, conn, &breakpoint).await?;
            }
        }
    }

    /// Debuggee path used to install `breakpoint`; unmapped files fall back
    /// to their resolved local path.
    fn install_path(&self, breakpoint: &Breakpoint) -> String {
        match &breakpoint.remote_file {
            Some(remote) => remote.clone(),
            None => self
                .inner
                .mapper
                .resolve_local(&breakpoint.local_file)
                .to_string_lossy()
                .into_owned(),
        }
    }

    async fn install(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        conn: &mut DbgpConnection,
        breakpoint: &Breakpoint,
    ) -> DebugResult<Breakpoint> {
        let file_uri = path_to_file_uri(&self.install_path(breakpoint));
        let cmd = Command::line_breakpoint(&file_uri, breakpoint.line, breakpoint.condition.as_deref());
        match conn.send(&cmd, cancel).await {
            Ok(response) => {
                let engine_id = response.breakpoint_id;
                tracing::debug!(
                    target = "dbgp.session",
                    id = breakpoint.id,
                    engine_id = ?engine_id,
                    file = %file_uri,
                    line = breakpoint.line,
                    "breakpoint installed"
                );
                let mut shared = self.lock_current(generation)?;
                Ok(shared
                    .registry
                    .mark_installed(breakpoint.id, engine_id.clone())
                    .unwrap_or_else(|| Breakpoint {
                        installed: true,
                        engine_id,
                        ..breakpoint.clone()
                    }))
            }
            Err(DbgpError::Command { message, .. }) => {
                tracing::warn!(
                    target = "dbgp.session",
                    id = breakpoint.id,
                    file = %breakpoint.local_file,
                    line = breakpoint.line,
                    message,
                    "engine rejected breakpoint"
                );
                let mut shared = self.lock_current(generation)?;
                let updated = shared
                    .registry
                    .mark_failed(breakpoint.id, message.clone())
                    .unwrap_or_else(|| Breakpoint {
                        install_error: Some(message.clone()),
                        ..breakpoint.clone()
                    });
                Err(DebugError::BreakpointRejected {
                    breakpoint: Box::new(updated),
                    message,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Send a continuation command and wait, without a deadline, for the
    /// debuggee's next status. Only `stop` (through `cancel`) ends the wait
    /// early. `fallback` is reported when a break carries no location.
    async fn resume(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        slot: &mut Option<DbgpConnection>,
        cmd: Command,
        reason: PauseReason,
        fallback: Option<BreakLocation>,
    ) -> DebugResult<()> {
        let Some(conn) = slot.as_mut() else {
            return Err(DebugError::SessionStopped);
        };
        tracing::debug!(target = "dbgp.session", command = cmd.name(), "resuming debuggee");

        let response = match conn.resume(&cmd, cancel).await {
            Ok(response) => response,
            Err(err) => return Err(self.abort(generation, slot, err.into())),
        };
        self.on_status(generation, cancel, slot, response, reason, fallback)
            .await
    }

    async fn on_status(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        slot: &mut Option<DbgpConnection>,
        response: Response,
        reason: PauseReason,
        fallback: Option<BreakLocation>,
    ) -> DebugResult<()> {
        match response.status {
            Some(EngineStatus::Break) => {
                let location = response
                    .location
                    .as_ref()
                    .or(fallback.as_ref())
                    .map(|location| self.pause_location(location, reason));
                {
                    let mut shared = self.lock_current(generation)?;
                    shared.state = SessionState::Paused;
                    shared.step += 1;
                    shared.location = location.clone();
                }
                tracing::info!(
                    target = "dbgp.session",
                    file = ?location.as_ref().map(|l| &l.remote_file),
                    line = ?location.as_ref().map(|l| l.line),
                    reason = ?location.as_ref().map(|l| l.reason),
                    "debuggee paused"
                );

                // Breakpoints registered while the debuggee was running.
                let Some(conn) = slot.as_mut() else {
                    return Err(DebugError::SessionStopped);
                };
                if let Err(err) = self.flush_breakpoints(generation, cancel, conn, None).await {
                    return Err(self.abort(generation, slot, err));
                }
                Ok(())
            }
            Some(status) if status.is_terminal() => {
                tracing::info!(target = "dbgp.session", status = status.as_str(), "debuggee finished");
                self.finish(generation, slot).await;
                Ok(())
            }
            other => {
                let err = DbgpError::Protocol(format!(
                    "unexpected status {:?} after `{}`",
                    other.map(EngineStatus::as_str),
                    response.command
                ));
                Err(self.abort(generation, slot, err.into()))
            }
        }
    }

    fn pause_location(&self, location: &BreakLocation, reason: PauseReason) -> PauseLocation {
        let remote_file = file_uri_to_path(&location.file_uri);
        let local_file = self
            .inner
            .mapper
            .to_local(&remote_file)
            .map(|path| path.to_string_lossy().into_owned());
        PauseLocation {
            local_file,
            remote_file,
            line: location.line,
            reason: if location.exception.is_some() {
                PauseReason::Exception
            } else {
                reason
            },
            exception: location.exception.clone(),
            message: location.message.clone(),
        }
    }

    /// The debuggee ran to completion.
    async fn finish(&self, generation: u64, slot: &mut Option<DbgpConnection>) {
        if let Some(conn) = slot.take() {
            close_connection(conn).await;
        }
        let mut shared = self.inner.shared.lock();
        if shared.generation == generation {
            shared.end(false);
        }
    }

    /// Step or continue from a pause, or stop the session.
    ///
    /// Stepping and continuing block until the debuggee pauses again or
    /// terminates.
    pub async fn control(&self, action: ControlAction) -> DebugResult<SessionInfo> {
        let (cmd, reason) = match action {
            ControlAction::Stop => return self.stop().await,
            ControlAction::StepOver => (Command::step_over(), PauseReason::Step),
            ControlAction::StepInto => (Command::step_into(), PauseReason::Step),
            ControlAction::StepOut => (Command::step_out(), PauseReason::Step),
            ControlAction::Continue => (Command::run(), PauseReason::Breakpoint),
        };

        let (generation, cancel) = {
            let mut shared = self.inner.shared.lock();
            if shared.state != SessionState::Paused {
                return Err(DebugError::InvalidState {
                    operation: action.as_str(),
                    state: shared.state,
                });
            }
            shared.state = SessionState::Running;
            shared.location = None;
            (shared.generation, shared.cancel.clone())
        };

        let mut slot = self.inner.conn.lock().await;
        self.resume(generation, &cancel, &mut slot, cmd, reason, None).await?;
        Ok(self.status())
    }

    /// Fetch a variable at the current pause, record it, and return it.
    pub async fn inspect(&self, name: &str, depth: u32) -> DebugResult<InspectResult> {
        if !(MIN_INSPECT_DEPTH..=MAX_INSPECT_DEPTH).contains(&depth) {
            return Err(DebugError::InvalidArgument(format!(
                "depth must be between {MIN_INSPECT_DEPTH} and {MAX_INSPECT_DEPTH}, got {depth}"
            )));
        }
        let (generation, cancel) = self.paused_session("inspect")?;

        let mut slot = self.inner.conn.lock().await;
        // A step may have been issued while this call waited for the lock.
        {
            let shared = self.inner.shared.lock();
            if shared.generation != generation || shared.state != SessionState::Paused {
                return Err(DebugError::InvalidState {
                    operation: "inspect",
                    state: shared.state,
                });
            }
        }
        let Some(conn) = slot.as_mut() else {
            return Err(DebugError::SessionStopped);
        };

        let property = match fetch_property(conn, &cancel, name, depth).await {
            Ok(property) => property,
            Err(err) => return Err(self.abort(generation, &mut slot, err.into())),
        };

        let value = property_to_json(&property);
        let structure = structure_view(&property);
        // An inspection is a step of its own. The connection is still held,
        // so no pause can slip in between the fetch and its step.
        let step = {
            let mut shared = self.lock_current(generation)?;
            shared.step += 1;
            let step = shared.step;
            shared.history.append(name, value.clone(), step);
            step
        };
        drop(slot);
        tracing::debug!(target = "dbgp.session", name, depth, step, kind = %property.kind, "inspected variable");

        Ok(InspectResult {
            name: name.to_string(),
            kind: property.kind,
            classname: property.classname,
            step,
            depth,
            value,
            structure,
        })
    }

    /// Register a line breakpoint. Installs it right away when the debuggee
    /// is paused; otherwise it is sent with the next batch (after connecting,
    /// or at the next pause).
    pub async fn set_breakpoint(
        &self,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> DebugResult<BreakpointOutcome> {
        if line == 0 {
            return Err(DebugError::InvalidArgument(
                "line must be a positive integer".to_string(),
            ));
        }
        let condition = condition.filter(|c| !c.trim().is_empty());

        let remote = self.inner.mapper.to_remote(file);
        let mut warnings = Vec::new();
        if remote.is_none() {
            tracing::warn!(target = "dbgp.session", file, "no path mapping for breakpoint file");
            warnings.push(Warning::path_mapping(file));
        }

        let (breakpoint, state, generation, cancel) = {
            let mut shared = self.inner.shared.lock();
            let breakpoint = shared
                .registry
                .add(file.to_string(), remote, line, condition);
            (breakpoint, shared.state, shared.generation, shared.cancel.clone())
        };
        tracing::info!(
            target = "dbgp.session",
            id = breakpoint.id,
            file,
            line,
            remote = ?breakpoint.remote_file,
            %state,
            "breakpoint registered"
        );
        if state != SessionState::Paused {
            if state == SessionState::Running {
                warnings.push(Warning::deferred(breakpoint.id));
            }
            return Ok(BreakpointOutcome {
                breakpoint,
                warnings,
            });
        }

        let mut slot = self.inner.conn.lock().await;
        // The flush at the pause may have installed it already.
        let settled = {
            let shared = self.inner.shared.lock();
            let current = shared.registry.get(breakpoint.id).cloned();
            match current {
                Some(current)
                    if shared.generation == generation
                        && shared.state == SessionState::Paused
                        && current.is_pending() =>
                {
                    None
                }
                current => Some(current.unwrap_or_else(|| breakpoint.clone())),
            }
        };
        if let Some(breakpoint) = settled {
            return Ok(BreakpointOutcome {
                breakpoint,
                warnings,
            });
        }
        let Some(conn) = slot.as_mut() else {
            return Ok(BreakpointOutcome {
                breakpoint,
                warnings,
            });
        };

        match self.install(generation, &cancel, conn, &breakpoint).await {
            Ok(breakpoint) => Ok(BreakpointOutcome {
                breakpoint,
                warnings,
            }),
            Err(err) => Err(self.abort(generation, &mut slot, err)),
        }
    }

    /// Forget a breakpoint and remove it from the debuggee if it was
    /// installed there.
    pub async fn remove_breakpoint(&self, id: BreakpointId) -> DebugResult<Breakpoint> {
        let (removed, state, generation, cancel) = {
            let mut shared = self.inner.shared.lock();
            let removed = shared
                .registry
                .remove(id)
                .ok_or(DebugError::UnknownBreakpoint(id))?;
            (removed, shared.state, shared.generation, shared.cancel.clone())
        };
        tracing::info!(target = "dbgp.session", id, "breakpoint removed");

        let Some(engine_id) = removed.engine_id.clone().filter(|_| removed.installed) else {
            return Ok(removed);
        };
        if state != SessionState::Paused {
            self.defer_removal(generation, engine_id);
            return Ok(removed);
        }

        let mut slot = self.inner.conn.lock().await;
        let paused = {
            let shared = self.inner.shared.lock();
            shared.generation == generation && shared.state == SessionState::Paused
        };
        let conn = match slot.as_mut() {
            Some(conn) if paused => conn,
            _ => {
                self.defer_removal(generation, engine_id);
                return Ok(removed);
            }
        };
        match conn.send(&Command::breakpoint_remove(&engine_id), &cancel).await {
            Ok(_) => Ok(removed),
            Err(err) => Err(self.abort(generation, &mut slot, err.into())),
        }
    }

    fn defer_removal(&self, generation: u64, engine_id: String) {
        let mut shared = self.inner.shared.lock();
        if shared.generation == generation && shared.state.is_active() {
            shared.pending_removals.push(engine_id);
        }
    }

    /// Past values of `name`, newest first. Never talks to the debuggee.
    pub fn query_history(&self, name: &str, steps_ago: u64, limit: usize) -> Vec<HistoryEntry> {
        self.inner
            .shared
            .lock()
            .history
            .query(name, steps_ago, limit)
    }

    /// End the session from any state.
    ///
    /// Cancels whatever is waiting on the debuggee, terminates the trigger
    /// command and closes the connection and listener. Returns after the
    /// listen port has been released.
    pub async fn stop(&self) -> DebugResult<SessionInfo> {
        {
            let mut shared = self.inner.shared.lock();
            let previous = shared.state;
            shared.end(true);
            tracing::info!(target = "dbgp.session", %previous, "stopping debug session");
        }

        // A cancelled `start` still owns its listener until it returns.
        let lifecycle = self.inner.lifecycle.lock().await;
        let conn = self.inner.conn.lock().await.take();
        drop(lifecycle);

        if let Some(conn) = conn {
            close_connection(conn).await;
        }
        Ok(self.status())
    }

    fn paused_session(&self, operation: &'static str) -> DebugResult<(u64, CancellationToken)> {
        let shared = self.inner.shared.lock();
        if shared.state != SessionState::Paused {
            return Err(DebugError::InvalidState {
                operation,
                state: shared.state,
            });
        }
        Ok((shared.generation, shared.cancel.clone()))
    }

    fn lock_current(&self, generation: u64) -> DebugResult<MutexGuard<'_, Shared>> {
        let shared = self.inner.shared.lock();
        if shared.generation != generation {
            return Err(DebugError::SessionStopped);
        }
        Ok(shared)
    }

    /// Route an error from a connection exchange. Fatal ones, engine
    /// rejections included, close the connection and put the session in
    /// Error.
    fn abort(
        &self,
        generation: u64,
        slot: &mut Option<DbgpConnection>,
        err: DebugError,
    ) -> DebugError {
        let fatal = match &err {
            DebugError::SessionStopped | DebugError::Protocol(DbgpError::Cancelled) => {
                return DebugError::SessionStopped
            }
            DebugError::Protocol(err) => err.is_fatal(),
            DebugError::BreakpointRejected { .. } => true,
            _ => false,
        };
        if fatal {
            // Dropping the connection closes the socket.
            slot.take();
            self.fail(generation, &err);
        }
        err
    }

    /// Move the current session to Error, releasing what it owns.
    fn fail(&self, generation: u64, err: &DebugError) {
        if matches!(
            err,
            DebugError::SessionStopped | DebugError::Protocol(DbgpError::Cancelled)
        ) {
            return;
        }
        let mut shared = self.inner.shared.lock();
        if shared.generation != generation || !shared.state.is_active() {
            return;
        }
        tracing::warn!(target = "dbgp.session", code = err.code(), error = %err, "debug session failed");
        shared.state = SessionState::Error;
        shared.location = None;
        shared.listen_addr = None;
        shared.last_error = Some(err.to_info());
        if let Some(trigger) = &shared.trigger {
            trigger.kill();
        }
    }
}

async fn fetch_property(
    conn: &mut DbgpConnection,
    cancel: &CancellationToken,
    name: &str,
    depth: u32,
) -> Result<Property, DbgpError> {
    conn.send(&Command::feature_set("max_depth", depth), cancel).await?;
    let response = conn.send(&Command::property_get(name), cancel).await?;
    response
        .properties
        .into_iter()
        .next()
        .ok_or_else(|| DbgpError::Protocol(format!("no value returned for {name}")))
}

/// Ask the engine to end the script if it is listening, then close.
async fn close_connection(mut conn: DbgpConnection) {
    if conn.is_idle() {
        let never = CancellationToken::new();
        let _ = tokio::time::timeout(STOP_GRACE, conn.send(&Command::stop(), &never)).await;
    }
    conn.close().await;
}
