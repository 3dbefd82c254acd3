//! DBGp (the Xdebug debugger protocol) over TCP.
//!
//! The debugger engine connects *to* the IDE, sends an `<init>` packet, and
//! then answers one command at a time:
//!
//! - IDE → engine: `command -i <transaction id> [-flag value]... [-- base64]\0`
//! - engine → IDE: `<decimal length>\0<xml>\0`
//!
//! This crate provides the framing codec, a command builder, the XML message
//! model, and [`DbgpConnection`], which enforces strict request/response
//! correlation over a single socket.

mod codec;
mod command;
mod connection;
mod message;
mod types;
pub mod uri;

pub use codec::{encode_frame, FrameDecoder, FrameReader, MAX_FRAME_BYTES, NUL};
pub use command::Command;
pub use connection::{DbgpConnection, DbgpConnectionConfig};
pub use message::{
    parse_message, EngineError, InitPacket, Message, Notify, Property, Response, StreamPacket,
};
pub use types::{BreakLocation, DbgpError, EngineStatus, Result, TransactionId};

/// Re-exported so callers can cancel in-flight exchanges without depending on
/// `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;

// The scripted engine is only needed for tests and downstream integration suites.
// Compile it for this crate's own unit tests unconditionally (via `cfg(test)`), while
// keeping it behind the `wire-test-support` feature for normal builds.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;
