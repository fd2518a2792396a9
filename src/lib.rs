//! # Veil Tunnel
//!
//! The client half of a traffic-obfuscating tunnel: arbitrary byte streams
//! are multiplexed over a pool of long-lived carrier connections, each
//! carrier framed so that its traffic passes as an ordinary encrypted web
//! session. The remote peer demultiplexes and forwards to the real origin.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Local Application                    │
//! │        (one logical byte stream per connection)      │
//! ├─────────────────────────────────────────────────────┤
//! │                     Session                          │
//! │      (stream table, accept queue, close/die)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Switchboard                        │
//! │   (carrier pool, dispatch, per-carrier demux pump)   │
//! ├─────────────────────────────────────────────────────┤
//! │                 Obfuscator hooks                     │
//! │        (frame encode / decode / record read)         │
//! ├─────────────────────────────────────────────────────┤
//! │               Carrier connections                    │
//! │     (established elsewhere, handed to the pool)      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The carrier disguise itself (TLS record shaping, browser signatures,
//! handshake mimicry) is not part of this crate; the multiplexer consumes it
//! only through the [`obfs::Obfuscator`] hook surface.

pub mod client;
pub mod config;
pub mod crypto;
pub mod mux;
pub mod obfs;

pub use client::ClientState;
pub use mux::{Session, SessionRole, Stream};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),
}
