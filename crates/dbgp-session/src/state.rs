use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Lifecycle of the single debug session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Initializing,
    Listening,
    Connected,
    Running,
    Paused,
    Stopped,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Listening => "listening",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }

    /// A new session may be started from here.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Error
        )
    }

    /// The session owns a listener, a connection, or a trigger process.
    pub fn is_active(self) -> bool {
        !self.can_start()
    }

    pub fn available_actions(self) -> &'static [ControlAction] {
        match self {
            SessionState::Paused => &ControlAction::ALL,
            SessionState::Initializing
            | SessionState::Listening
            | SessionState::Connected
            | SessionState::Running
            | SessionState::Error => &[ControlAction::Stop],
            SessionState::Idle | SessionState::Stopped => &[],
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    StepOver,
    StepInto,
    StepOut,
    Continue,
    Stop,
}

impl ControlAction {
    pub const ALL: [ControlAction; 5] = [
        ControlAction::StepOver,
        ControlAction::StepInto,
        ControlAction::StepOut,
        ControlAction::Continue,
        ControlAction::Stop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::StepOver => "step_over",
            ControlAction::StepInto => "step_into",
            ControlAction::StepOut => "step_out",
            ControlAction::Continue => "continue",
            ControlAction::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| {
                format!("unknown action {s:?}; expected one of step_over, step_into, step_out, continue, stop")
            })
    }
}

/// Why execution is paused where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Entry,
    Step,
    Breakpoint,
    Exception,
}
