use std::io;

use thiserror::Error;

use fchat_shared::DecodeError;

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The transport closed or failed mid read/write. The connection is dead.
    #[error("Disconnected: {0}")]
    Disconnected(#[source] io::Error),

    /// A read was issued while another one was still outstanding.
    #[error("Another read is already in progress on this connection")]
    ReadInProgress,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed packet: {0}")]
    Decode(#[from] DecodeError),
}

impl ConnectionError {
    pub(crate) fn already_failed() -> Self {
        ConnectionError::Disconnected(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection already failed",
        ))
    }

    /// Whether the peer went away, as opposed to misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnectionError::Disconnected(_))
    }
}
