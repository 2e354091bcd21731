//! Length-prefixed binary frame codec.
//!
//! Each frame is a 4-byte big-endian body length followed by the bincode
//! encoding of one [`ProtocolMessage`]. The decoder is incremental: feed it
//! arbitrary byte chunks and drain complete frames as they materialize.
//!
//! An oversized length prefix or an undecodable body is structural
//! corruption; the transport reacts by cascading the session closed rather
//! than guessing at a resynchronization point.

use tether_core::ProtocolMessage;
use thiserror::Error;

/// Largest accepted frame body, in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length prefix size, in bytes.
pub const HEADER_LEN: usize = 4;

/// Frame codec failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame body exceeds [`MAX_FRAME_LEN`]
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    Oversized(usize),

    /// A frame body could not be encoded or decoded
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// I/O error while writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode one message as a length-prefixed frame.
///
/// # Errors
///
/// Fails if the body cannot be encoded or exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame(msg: &ProtocolMessage) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(msg).map_err(|err| FrameError::Malformed(err.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(body.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode one message as a frame appended to an existing sink.
///
/// # Errors
///
/// Fails on encode failure, size violation, or sink I/O failure.
pub fn encode_into<W: std::io::Write>(msg: &ProtocolMessage, sink: &mut W) -> Result<(), FrameError> {
    let frame = encode_frame(msg)?;
    sink.write_all(&frame)?;
    Ok(())
}

/// Incremental frame decoder over an unframed byte sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drain the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Oversized`] or [`FrameError::Malformed`] on
    /// structural corruption; the decoder is not usable afterwards.
    pub fn next_frame(&mut self) -> Result<Option<ProtocolMessage>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let msg = bincode::deserialize(&self.buf[HEADER_LEN..HEADER_LEN + len])
            .map_err(|err| FrameError::Malformed(err.to_string()))?;
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(msg))
    }
}
