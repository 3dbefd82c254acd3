use std::time::Duration;

use dbgp_wire::DbgpError;
use serde::Serialize;
use thiserror::Error;

use crate::{
    breakpoints::{Breakpoint, BreakpointId},
    state::SessionState,
};

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("a debug session is already active (state: {state})")]
    SessionAlreadyActive { state: SessionState },

    #[error("no debugger connected within {}s", .timeout.as_secs())]
    ConnectionTimeout { timeout: Duration },

    #[error("cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Protocol(#[from] DbgpError),

    #[error("breakpoint {} at {}:{} was rejected: {message}", .breakpoint.id, .breakpoint.local_file, .breakpoint.line)]
    BreakpointRejected {
        breakpoint: Box<Breakpoint>,
        message: String,
    },

    #[error("the debug session was stopped")]
    SessionStopped,

    #[error("failed to spawn trigger command `{command}`: {source}")]
    TriggerFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown breakpoint {0}")]
    UnknownBreakpoint(BreakpointId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown tool `{0}`")]
    UnknownTool(String),
}

impl DebugError {
    /// Stable error code reported to tool callers.
    pub fn code(&self) -> &'static str {
        match self {
            DebugError::SessionAlreadyActive { .. } => "SESSION_ALREADY_ACTIVE",
            DebugError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            DebugError::InvalidState { .. } => "INVALID_STATE",
            DebugError::Protocol(DbgpError::Cancelled) | DebugError::SessionStopped => {
                "SESSION_STOPPED"
            }
            DebugError::Protocol(_) | DebugError::BreakpointRejected { .. } => "PROTOCOL_ERROR",
            DebugError::TriggerFailed { .. } => "TRIGGER_FAILED",
            DebugError::Listen { .. } => "IO_ERROR",
            DebugError::UnknownBreakpoint(_) => "UNKNOWN_BREAKPOINT",
            DebugError::InvalidArgument(_) => "INVALID_ARGUMENT",
            DebugError::UnknownTool(_) => "UNKNOWN_TOOL",
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Serializable `{code, message}` pair, used for tool errors and for the
/// last error shown in the session status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: &'static str,
    pub message: String,
}

/// Advisory diagnostic attached to an otherwise successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub code: &'static str,
    pub message: String,
}

impl Warning {
    pub fn path_mapping(local_file: &str) -> Self {
        Self {
            code: "PATH_MAPPING_FAILURE",
            message: format!(
                "no path mapping matched {local_file:?}; the breakpoint will be installed with its local path"
            ),
        }
    }

    pub fn deferred(id: BreakpointId) -> Self {
        Self {
            code: "BREAKPOINT_DEFERRED",
            message: format!(
                "breakpoint {id} will be installed when the debuggee next pauses"
            ),
        }
    }
}
