//! # fchat-store
//!
//! The server's storage engine: pending channel-update notifications,
//! append-only message logs with a random-access index, and uploaded file
//! blobs, all on the local file system.
//!
//! Every resource is guarded by a keyed [`Scheduler`] giving it
//! multi-reader / single-writer semantics. Resources with different keys never
//! wait on each other.

pub mod files;
pub mod messages;
pub mod scheduler;
pub mod storage;
pub mod updates;

mod error;

pub use error::StoreError;
pub use files::{increment_file_name, validate_file_name, FileDownload, SavedFile};
pub use scheduler::Scheduler;
pub use storage::Storage;
