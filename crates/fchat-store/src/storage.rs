//! The storage engine handle and its on-disk layout.
//!
//! ```text
//! <root>/updates/<blake3(lowercase name)>/<channel-id>   pending ChannelUpdated packet
//! <root>/messages/<channel-id>/messages.txt             author\ncontent\n\n records
//! <root>/messages/<channel-id>/index                    16-byte (offset, length) records
//! <root>/messages/<channel-id>/files/<stored-name>      uploaded files
//! ```
//!
//! Every operation runs as a task of one of the keyed schedulers, and every
//! blocking file-system call is handed to the io pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use fchat_shared::{ChannelId, Executors, Name};

use crate::error::Result;
use crate::scheduler::Scheduler;

const UPDATES_DIR: &str = "updates";
const MESSAGES_DIR: &str = "messages";
const FILES_DIR: &str = "files";
pub(crate) const MESSAGE_LOG_FILE: &str = "messages.txt";
pub(crate) const MESSAGE_INDEX_FILE: &str = "index";

/// Handle to the storage engine. Cheap to clone; clones share schedulers.
#[derive(Debug, Clone)]
pub struct Storage {
    pub(crate) inner: Arc<StorageInner>,
}

#[derive(Debug)]
pub(crate) struct StorageInner {
    root: PathBuf,
    executors: Executors,
    /// Keyed by the recipient's directory name, so names differing only in
    /// case share one lock as they share one directory.
    pub(crate) updates: Scheduler<String>,
    pub(crate) messages: Scheduler<ChannelId>,
    /// Serializes stored-name allocation within a channel.
    pub(crate) file_names: Scheduler<ChannelId>,
    /// Guards the bytes of one stored file.
    pub(crate) files: Scheduler<PathBuf>,
}

impl Storage {
    /// Open (or create) a data directory rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, executors: Executors) -> Result<Self> {
        let root = root.into();
        let layout = [root.join(UPDATES_DIR), root.join(MESSAGES_DIR)];
        executors
            .spawn_io(move || layout.iter().try_for_each(fs::create_dir_all))
            .await??;

        info!(path = %root.display(), "Storage opened");

        let worker = executors.worker.clone();
        Ok(Self {
            inner: Arc::new(StorageInner {
                root,
                executors,
                updates: Scheduler::new(worker.clone()),
                messages: Scheduler::new(worker.clone()),
                file_names: Scheduler::new(worker.clone()),
                files: Scheduler::new(worker),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl StorageInner {
    /// Directory name for a recipient's pending updates.
    pub(crate) fn recipient_key(name: &Name) -> String {
        blake3::hash(name.folded().as_bytes()).to_hex().to_string()
    }

    pub(crate) fn recipient_dir(&self, key: &str) -> PathBuf {
        self.root.join(UPDATES_DIR).join(key)
    }

    pub(crate) fn channel_dir(&self, channel: ChannelId) -> PathBuf {
        self.root.join(MESSAGES_DIR).join(channel.to_string())
    }

    pub(crate) fn files_dir(&self, channel: ChannelId) -> PathBuf {
        self.channel_dir(channel).join(FILES_DIR)
    }

    /// Run a blocking file-system closure on the io pool.
    pub(crate) async fn blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.executors.spawn_io(f).await??)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_open_creates_layout() {
        let (storage, dir) = test_storage().await;
        assert!(dir.path().join("updates").is_dir());
        assert!(dir.path().join("messages").is_dir());
        assert_eq!(storage.root(), dir.path());
    }

    #[tokio::test]
    async fn test_open_runs_on_the_io_runtime() {
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("store-test-io")
            .build()
            .unwrap();
        let executors = Executors::new(tokio::runtime::Handle::current(), io.handle().clone());

        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("nested"), executors).await.unwrap();
        assert!(storage.root().join("updates").is_dir());

        io.shutdown_background();
    }

    #[test]
    fn test_recipient_key_ignores_case() {
        let lower = StorageInner::recipient_key(&name("alice"));
        let mixed = StorageInner::recipient_key(&name("ALICE"));
        let other = StorageInner::recipient_key(&name("bob"));
        assert_eq!(lower, mixed);
        assert_ne!(lower, other);
        assert_eq!(lower.len(), 64);
    }
}
