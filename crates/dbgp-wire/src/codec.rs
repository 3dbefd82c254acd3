use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{DbgpError, Result};

pub const NUL: u8 = 0;

/// Upper bound for a single engine → IDE frame.
///
/// Xdebug truncates property data according to `max_data`, so legitimate
/// frames stay far below this; anything larger is treated as corruption.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// `MAX_FRAME_BYTES` has 8 decimal digits; allow some leading zeros but refuse
/// to buffer an unbounded run of digits while looking for the separator.
const MAX_LENGTH_DIGITS: usize = 20;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Encode an engine → IDE frame: `<decimal-length>\0<payload>\0`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut out = Vec::with_capacity(length.len() + payload.len() + 2);
    out.extend_from_slice(length.as_bytes());
    out.push(NUL);
    out.extend_from_slice(payload);
    out.push(NUL);
    out
}

fn parse_length(prefix: &[u8]) -> Result<usize> {
    if prefix.is_empty() {
        return Err(DbgpError::MalformedFrame("empty length prefix".to_string()));
    }
    if prefix.len() > MAX_LENGTH_DIGITS {
        return Err(DbgpError::MalformedFrame(format!(
            "length prefix has {} digits",
            prefix.len()
        )));
    }
    if let Some(bad) = prefix.iter().find(|b| !b.is_ascii_digit()) {
        return Err(DbgpError::MalformedFrame(format!(
            "non-decimal byte 0x{bad:02x} in length prefix"
        )));
    }

    // All bytes are ASCII digits, so this is valid UTF-8.
    let text = String::from_utf8_lossy(prefix);
    let length = text
        .parse::<u64>()
        .map_err(|err| DbgpError::MalformedFrame(format!("invalid length {text:?}: {err}")))?;
    if length > MAX_FRAME_BYTES as u64 {
        return Err(DbgpError::MalformedFrame(format!(
            "frame length {length} exceeds maximum allowed size {MAX_FRAME_BYTES}"
        )));
    }
    Ok(length as usize)
}

/// Incremental decoder for engine → IDE frames.
///
/// Bytes are pushed as they arrive; complete frames are popped one at a time.
/// A frame split across reads stays buffered until its trailing NUL arrives,
/// and several frames delivered by a single read are returned in order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(separator) = self.buf.iter().position(|&b| b == NUL) else {
            // Validate the partial prefix eagerly so garbage is rejected
            // without waiting for a NUL that may never come.
            if self.buf.len() > MAX_LENGTH_DIGITS {
                return Err(DbgpError::MalformedFrame(
                    "length prefix is not terminated".to_string(),
                ));
            }
            if let Some(bad) = self.buf.iter().find(|b| !b.is_ascii_digit()) {
                return Err(DbgpError::MalformedFrame(format!(
                    "non-decimal byte 0x{bad:02x} in length prefix"
                )));
            }
            return Ok(None);
        };

        let length = parse_length(&self.buf[..separator])?;
        let start = separator + 1;
        let end = start + length;
        if self.buf.len() <= end {
            return Ok(None);
        }
        if self.buf[end] != NUL {
            return Err(DbgpError::MalformedFrame(format!(
                "frame of length {length} is not NUL-terminated"
            )));
        }

        let payload = self.buf[start..end].to_vec();
        self.buf.drain(..=end);
        Ok(Some(payload))
    }
}

/// Reads whole frames from an async byte stream.
///
/// `read_frame` is cancel-safe: bytes are moved into the decoder as soon as a
/// read completes, so dropping the future between reads loses nothing.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Returns `Ok(None)` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if self.decoder.buffered() == 0 {
                    return Ok(None);
                }
                return Err(DbgpError::MalformedFrame(format!(
                    "EOF with {} bytes of an incomplete frame buffered",
                    self.decoder.buffered()
                )));
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}
