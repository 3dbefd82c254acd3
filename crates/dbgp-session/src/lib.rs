//! Session engine for debugging PHP through Xdebug's DBGp protocol.
//!
//! [`DebugEngine`] drives one debug session at a time: it listens for the
//! debuggee, runs a trigger command that makes it connect, installs
//! breakpoints, steps, inspects variables, and records what it saw into a
//! per-variable history. [`tools`] exposes those operations as JSON tool
//! calls and [`server`] serves them over stdio.

pub mod breakpoints;
pub mod error;
pub mod history;
pub mod path_map;
pub mod server;
pub mod session;
pub mod state;
pub mod tools;
pub mod trigger;
pub mod value;

pub use breakpoints::{Breakpoint, BreakpointId, BreakpointRegistry};
pub use error::{DebugError, DebugResult, ErrorInfo, Warning};
pub use history::{HistoryEntry, HistoryRecorder};
pub use path_map::PathMapper;
pub use session::{
    BreakpointOutcome, DebugEngine, EngineConfig, EngineInfo, InspectResult, PauseLocation,
    SessionInfo, StartOptions,
};
pub use state::{ControlAction, PauseReason, SessionState};
pub use tools::call_tool;
pub use trigger::{TriggerProcess, TriggerStatus};
