//! Stream multiplexing layer
//!
//! Turns N logical byte streams into records on a shared pool of carrier
//! connections:
//! - [`Frame`]: one addressed unit of multiplexed traffic
//! - [`Stream`]: one bidirectional byte channel
//! - [`Session`]: the stream table, accept queue and close coordination
//! - switchboard: the carrier pool, outbound dispatch and inbound demux

mod frame;
mod session;
mod stream;
mod switchboard;

pub use frame::{Frame, CLOSING_NONE, CLOSING_STREAM};
pub use session::{Session, SessionRole};
pub use stream::Stream;
pub use switchboard::Carrier;

use thiserror::Error;

/// Accept queue depth; peers opening streams beyond this while nobody
/// accepts are dropped tail-first.
pub const ACCEPT_BACKLOG: usize = 1024;

/// Per-stream inbound buffer depth in frames. When full, delivery blocks,
/// which stops the delivering carrier's reader until the stream drains.
pub const INBOUND_BACKLOG: usize = 64;

/// Largest payload a single frame carries; longer writes span frames.
pub const MAX_PAYLOAD_SIZE: usize = 16384;

/// Largest carrier record either shipped obfuscator will produce or read.
pub const MAX_RECORD_SIZE: usize = 65535;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// The session is dying or dead
    #[error("broken session")]
    BrokenSession,

    /// The stream is closed locally or its session is dying
    #[error("broken stream")]
    BrokenStream,

    /// A second call to Session::close
    #[error("trying to close a closed session")]
    RepeatClose,

    /// A carrier delivered a record that fails to decode; the carrier is
    /// evicted
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Dispatch attempted with an empty carrier pool
    #[error("no carriers left")]
    NoCarriers,

    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
