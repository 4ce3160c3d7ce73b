//! Stream multiplexing over a single physical connection
//!
//! A [`Session`] carries many independent [`Stream`]s over one transport
//! using a compact framing:
//!
//! ```text
//! | version u8 | cmd u8 | length u16 LE | stream id u32 LE | payload |
//! ```
//!
//! Flow control is per stream: the receiver announces a window and
//! acknowledges consumed bytes with `UPD` frames; writers block when the
//! peer's window is exhausted. `FIN` half-closes a stream; a zero-window
//! `UPD` tells the peer the stream was dropped and its writes now fail
//! with [`MuxError::StreamClosed`]. The session as a whole stops reading from
//! the transport while more than `max_receive_buffer` bytes sit unread.
//! Liveness is tracked with `NOP` keepalives.

mod config;
mod frame;
mod session;
mod stream;

pub use config::{
    MuxConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_RECEIVE_BUFFER, DEFAULT_MAX_STREAM_BUFFER, DEFAULT_VERSION, SUPPORTED_VERSIONS,
};
pub use frame::{Cmd, Frame, HEADER_SIZE};
pub use session::Session;
pub use stream::Stream;

use std::io;
use thiserror::Error;

/// Mux session errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// Version not supported locally or not matched by the peer
    #[error("unsupported mux version {local} (peer: {peer:?})")]
    VersionUnsupported { local: u8, peer: Option<u8> },

    /// Session closed; pending stream operations are cancelled
    #[error("mux session terminated")]
    SessionTerminated,

    /// Stream already closed locally
    #[error("mux stream {0} closed")]
    StreamClosed(u32),

    /// Parameters violate a protocol invariant
    #[error("invalid mux config: {0}")]
    InvalidConfig(String),

    /// Peer sent something undecodable
    #[error("mux protocol error: {0}")]
    Protocol(String),

    /// Peer did not complete the handshake in time
    #[error("mux handshake timed out")]
    HandshakeTimeout,

    #[error("mux transport error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Extract the mux error carried by an I/O error from a [`Stream`]
    pub fn from_io(err: &io::Error) -> Option<&MuxError> {
        err.get_ref()?.downcast_ref::<MuxError>()
    }

    pub(crate) fn into_io(self) -> io::Error {
        let kind = match &self {
            Self::SessionTerminated => io::ErrorKind::ConnectionAborted,
            Self::StreamClosed(_) => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}
