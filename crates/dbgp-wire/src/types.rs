use std::io;

use thiserror::Error;

pub type TransactionId = u32;

pub type Result<T> = std::result::Result<T, DbgpError>;

#[derive(Debug, Error)]
pub enum DbgpError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed DBGp frame: {0}")]
    MalformedFrame(String),

    #[error("DBGp protocol error: {0}")]
    Protocol(String),

    #[error("transaction id mismatch: expected {expected}, got {actual}")]
    TransactionMismatch {
        expected: TransactionId,
        actual: TransactionId,
    },

    #[error("debugger engine rejected `{command}` (code {code}): {message}")]
    Command {
        command: String,
        code: u32,
        message: String,
    },

    #[error("a command is already awaiting its response (transaction {0})")]
    Busy(TransactionId),

    #[error("DBGp connection closed")]
    ConnectionClosed,

    #[error("DBGp operation cancelled")]
    Cancelled,

    #[error("DBGp operation timed out")]
    Timeout,
}

impl DbgpError {
    /// Errors that end the debug session.
    ///
    /// Only [`DbgpError::Busy`] is a local misuse that never reached the
    /// wire. A rejected command leaves the stream readable, but the session
    /// no longer matches what the debuggee believes, so it is fatal too.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DbgpError::Busy(_))
    }
}

/// Engine status as reported in the `status` attribute of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Starting,
    Stopping,
    Stopped,
    Running,
    Break,
}

impl EngineStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "running" => Self::Running,
            "break" => Self::Break,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Break => "break",
        }
    }

    /// The script finished (or is finishing) and will not break again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

/// Location reported by Xdebug in the `xdebug:message` child of a
/// continuation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakLocation {
    /// `file://` URI as sent by the engine.
    pub file_uri: String,
    pub line: u32,
    /// Exception class name when the break was caused by an exception.
    pub exception: Option<String>,
    /// Exception message (element text) when present.
    pub message: Option<String>,
}
