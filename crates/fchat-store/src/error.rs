use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinError;

use fchat_shared::{ChannelId, DecodeError, StreamAbandoned};

/// Errors produced by the storage engine.
///
/// Cloneable so a failure can be broadcast to every subscriber of a listing.
/// A missing file or channel log is not an error: lookups return `None` or an
/// empty stream instead.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Disk I/O failure.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// A stored packet could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The message log or its index does not have the expected shape.
    #[error("Corrupt message log for channel {channel}: {reason}")]
    CorruptLog { channel: ChannelId, reason: String },

    /// A file name that would escape the channel's file directory.
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    /// The inbound byte stream of an upload failed.
    #[error("Upload stream failed: {0}")]
    Upload(Arc<dyn std::error::Error + Send + Sync>),

    /// A storage task panicked or was cancelled by runtime shutdown.
    #[error("Storage task aborted: {0}")]
    TaskAborted(String),
}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> Self {
        StoreError::Io(Arc::new(error))
    }
}

impl From<JoinError> for StoreError {
    fn from(error: JoinError) -> Self {
        StoreError::TaskAborted(error.to_string())
    }
}

impl From<StreamAbandoned> for StoreError {
    fn from(error: StreamAbandoned) -> Self {
        StoreError::TaskAborted(error.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
