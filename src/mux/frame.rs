//! The multiplexing frame
//!
//! One Frame is one unit of multiplexed traffic: it addresses a stream,
//! carries that stream's next chunk of payload and a sequence number for
//! reassembly, and optionally signals close. The wire layout of a Frame is
//! owned entirely by the obfuscator; the multiplexer treats it as a value.

use bytes::Bytes;

/// Closing flag value for an ordinary data frame.
pub const CLOSING_NONE: u8 = 0;

/// Closing flag value signalling that the sending side has closed the stream.
/// The payload of a closing frame must be empty. Other values are reserved.
pub const CLOSING_STREAM: u8 = 1;

/// A multiplexing frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: u32,
    /// Per-stream sequence number, assigned in emission order
    pub seq: u32,
    /// Closing flag, one of [`CLOSING_NONE`] / [`CLOSING_STREAM`]
    pub closing: u8,
    /// Payload bytes; empty for closing frames
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame.
    pub fn data(stream_id: u32, seq: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            closing: CLOSING_NONE,
            payload,
        }
    }

    /// Create a closing frame (empty payload).
    pub fn closing(stream_id: u32, seq: u32) -> Self {
        Self {
            stream_id,
            seq,
            closing: CLOSING_STREAM,
            payload: Bytes::new(),
        }
    }

    /// Whether this frame signals stream close.
    pub fn is_closing(&self) -> bool {
        self.closing == CLOSING_STREAM
    }
}
