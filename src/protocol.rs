//! # Control Protocol
//!
//! Messages exchanged between the leader and its follower over the
//! coordination socket.
//!
//! ## Framing
//!
//! Every frame is
//!
//! ```text
//! +------+------+----------------+-----------------------+
//! | 'R'  | 'T'  | length: u32 BE | JSON-encoded Envelope |
//! +------+------+----------------+-----------------------+
//! ```
//!
//! A reader that loses its place (garbage on the wire, an oversized length)
//! scans forward for the next magic and carries on. A frame that decodes
//! to bad JSON or to an unknown protocol version is dropped with a warning;
//! the connection stays up.

use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

/// Frame marker.
pub const MAGIC: [u8; 2] = *b"RT";

/// Version carried in every envelope.
pub const WIRE_VERSION: u8 = 1;

/// Largest payload accepted; longer declared lengths are treated as corruption.
pub const MAX_PAYLOAD: usize = 64 * 1024;

const HEADER_LEN: usize = MAGIC.len() + 4;

/// A user command for the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Resume,
    Skip,
    Exit,
}

/// What is playing right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub track_name: String,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    #[serde(with = "millis")]
    pub total_length: Duration,
    pub score: f64,
}

/// Payload of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Leader to follower.
    Snapshot(StateSnapshot),
    /// Follower to leader.
    Control { signal: ControlSignal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub message: Message,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Encode `message` as one complete frame.
///
/// # Errors
///
/// Returns `InvalidData` if the payload would exceed [`MAX_PAYLOAD`].
pub fn encode_frame(message: &Message) -> io::Result<Vec<u8>> {
    let envelope = Envelope {
        version: WIRE_VERSION,
        message: message.clone(),
    };
    let payload = serde_json::to_vec(&envelope).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame payload of {} bytes exceeds {MAX_PAYLOAD}", payload.len()),
        ));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write `message` as one frame and flush.
pub fn write_message<W: Write + ?Sized>(writer: &mut W, message: &Message) -> io::Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Errors worth retrying or ignoring rather than tearing down the connection.
#[must_use]
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

/// Incremental frame decoder over an arbitrary byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete, valid message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if !self.sync_to_magic() {
                return None;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
            if len > MAX_PAYLOAD {
                log::warn!("Discarding frame header with length {len}; resynchronising");
                self.buf.drain(..1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }

            let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + len).collect();
            match serde_json::from_slice::<Envelope>(&frame[HEADER_LEN..]) {
                Ok(envelope) if envelope.version == WIRE_VERSION => return Some(envelope.message),
                Ok(envelope) => {
                    log::warn!("Ignoring frame with unsupported version {}", envelope.version);
                }
                Err(e) => {
                    log::warn!("Ignoring malformed frame: {e}");
                }
            }
        }
    }

    /// Drop bytes until the buffer starts with [`MAGIC`]. Returns false if
    /// no magic could be found yet; a trailing first magic byte is kept.
    fn sync_to_magic(&mut self) -> bool {
        if self.buf.starts_with(&MAGIC) {
            return true;
        }

        match self.buf.windows(MAGIC.len()).position(|w| w == MAGIC) {
            Some(start) => {
                log::debug!("Skipped {start} bytes of garbage");
                self.buf.drain(..start);
                true
            }
            None => {
                let keep = usize::from(self.buf.last() == Some(&MAGIC[0]));
                let drop = self.buf.len() - keep;
                self.buf.drain(..drop);
                false
            }
        }
    }
}

/// Blocking message reader over a stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; 4096].into_boxed_slice(),
        }
    }

    /// Next message, or `Ok(None)` once the peer has closed the stream.
    ///
    /// Interrupted reads are retried. Other errors, including read
    /// timeouts, are returned as-is; the reader stays usable afterwards.
    pub fn read_message(&mut self) -> io::Result<Option<Message>> {
        loop {
            if let Some(message) = self.decoder.next_message() {
                return Ok(Some(message));
            }

            match self.inner.read(&mut self.chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.decoder.push(&self.chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}
