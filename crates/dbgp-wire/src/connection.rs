use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::FrameReader,
    command::Command,
    message::{parse_message, InitPacket, Message, Response},
    types::{DbgpError, Result, TransactionId},
};

#[derive(Debug, Clone)]
pub struct DbgpConnectionConfig {
    /// Upper bound for replies to commands that do not resume execution
    /// (`breakpoint_set`, `property_get`, `feature_set`, ...).
    ///
    /// Continuation commands (`run`, `step_*`) wait without a deadline since
    /// the script may legitimately run for a long time before breaking.
    pub reply_timeout: Duration,
}

impl Default for DbgpConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// The single live connection to a debugger engine.
///
/// DBGp is strictly request-then-response: one command is written, and the
/// next `<response>` must echo its transaction id. The connection tracks that
/// one in-flight id in an explicit pending slot; a second command while the
/// slot is occupied fails with [`DbgpError::Busy`] instead of pipelining, and
/// a response with any other id fails with [`DbgpError::TransactionMismatch`].
///
/// Callers that share a connection must hold a lock across the whole
/// [`DbgpConnection::send`] call, not just around the write.
pub struct DbgpConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: Option<SocketAddr>,
    next_id: TransactionId,
    pending: Option<TransactionId>,
    config: DbgpConnectionConfig,
}

async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(DbgpError::Cancelled),
        res = fut => res,
    }
}

impl DbgpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_config(stream, DbgpConnectionConfig::default())
    }

    pub fn with_config(stream: TcpStream, config: DbgpConnectionConfig) -> Self {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(reader),
            writer,
            peer,
            next_id: 1,
            pending: None,
            config,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Transaction id of the command still awaiting its response, if any.
    pub fn pending(&self) -> Option<TransactionId> {
        self.pending
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Read the `<init>` packet the engine sends right after connecting.
    pub async fn read_init(&mut self) -> Result<InitPacket> {
        loop {
            match self.read_message().await? {
                Message::Init(init) => {
                    tracing::debug!(
                        target = "dbgp.wire",
                        file = %init.file_uri,
                        language = ?init.language,
                        engine = ?init.engine,
                        "received init packet"
                    );
                    return Ok(init);
                }
                Message::Stream(_) | Message::Notify(_) => continue,
                Message::Response(resp) => {
                    return Err(DbgpError::Protocol(format!(
                        "expected init packet, got response to `{}`",
                        resp.command
                    )))
                }
            }
        }
    }

    /// Send a non-resuming command and wait (bounded by `reply_timeout`) for
    /// its response.
    pub async fn send(&mut self, cmd: &Command, cancel: &CancellationToken) -> Result<Response> {
        let timeout = self.config.reply_timeout;
        self.exchange(cmd, cancel, Some(timeout)).await
    }

    /// Send a continuation command (`run`, `step_*`) and wait until the
    /// engine reports its next status. Only `cancel` ends the wait early.
    pub async fn resume(&mut self, cmd: &Command, cancel: &CancellationToken) -> Result<Response> {
        self.exchange(cmd, cancel, None).await
    }

    async fn exchange(
        &mut self,
        cmd: &Command,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let id = cancellable(cancel, self.write_command(cmd)).await?;
        let response = match timeout {
            Some(timeout) => cancellable(cancel, async {
                tokio::time::timeout(timeout, self.read_response(id))
                    .await
                    .map_err(|_| DbgpError::Timeout)?
            })
            .await?,
            None => cancellable(cancel, self.read_response(id)).await?,
        };
        response.into_result()
    }

    async fn write_command(&mut self, cmd: &Command) -> Result<TransactionId> {
        if let Some(pending) = self.pending {
            return Err(DbgpError::Busy(pending));
        }

        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        self.pending = Some(id);

        tracing::debug!(
            target = "dbgp.wire",
            command = cmd.name(),
            transaction_id = id,
            "sending command"
        );
        let bytes = cmd.encode(id);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(id)
    }

    async fn read_response(&mut self, expected: TransactionId) -> Result<Response> {
        loop {
            match self.read_message().await? {
                Message::Response(resp) => {
                    if resp.transaction_id != expected {
                        return Err(DbgpError::TransactionMismatch {
                            expected,
                            actual: resp.transaction_id,
                        });
                    }
                    self.pending = None;
                    tracing::debug!(
                        target = "dbgp.wire",
                        command = %resp.command,
                        transaction_id = resp.transaction_id,
                        status = ?resp.status,
                        "received response"
                    );
                    return Ok(resp);
                }
                Message::Stream(stream) => {
                    tracing::trace!(
                        target = "dbgp.wire",
                        kind = %stream.kind,
                        bytes = stream.data.len(),
                        "engine output"
                    );
                }
                Message::Notify(notify) => {
                    tracing::debug!(target = "dbgp.wire", name = %notify.name, "engine notification");
                }
                Message::Init(_) => {
                    return Err(DbgpError::Protocol(
                        "unexpected second init packet".to_string(),
                    ))
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        let Some(frame) = self.reader.read_frame().await? else {
            return Err(DbgpError::ConnectionClosed);
        };
        parse_message(&frame)
    }

    /// Close the write side; the engine sees EOF and ends the debug session.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
