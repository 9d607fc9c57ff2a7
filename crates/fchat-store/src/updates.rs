use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use fchat_shared::protocol::ChannelUpdated;
use fchat_shared::{ChannelId, EventStream, Name, Packet, Subscription};

use crate::error::{Result, StoreError};
use crate::storage::{Storage, StorageInner};

impl Storage {
    /// Persist a pending notification for `recipient`, replacing any earlier
    /// one for the same channel.
    pub async fn save_update(&self, recipient: &Name, update: ChannelUpdated) -> Result<()> {
        let key = StorageInner::recipient_key(recipient);
        let dir = self.inner.recipient_dir(&key);
        let inner = Arc::clone(&self.inner);
        let recipient = recipient.clone();

        self.inner
            .updates
            .write(key, async move {
                let file = dir.join(update.channel.to_string());
                let bytes = Packet::ChannelUpdated(update.clone()).encode();

                inner
                    .blocking(move || {
                        fs::create_dir_all(&dir)?;
                        fs::write(&file, &bytes)
                    })
                    .await?;

                info!(
                    recipient = %recipient,
                    channel = %update.channel,
                    name = %update.name,
                    "Saved channel update"
                );
                Ok::<_, StoreError>(())
            })
            .await?
    }

    /// Stream every pending notification of `recipient`. A recipient with
    /// nothing pending gets an immediately completed stream.
    pub fn list_updates(&self, recipient: &Name) -> Subscription<ChannelUpdated, StoreError> {
        let mut events = EventStream::buffering();
        let subscription = events.subscribe();

        let key = StorageInner::recipient_key(recipient);
        let dir = self.inner.recipient_dir(&key);
        let inner = Arc::clone(&self.inner);
        let recipient = recipient.clone();

        self.inner.updates.read(key, async move {
            let files = match inner.blocking(move || read_update_files(dir)).await {
                Ok(files) => files,
                Err(e) => {
                    events.error(e);
                    return;
                }
            };

            let mut count = 0usize;
            for (path, bytes) in files {
                match Packet::decode(&bytes) {
                    Ok(Packet::ChannelUpdated(update)) => {
                        events.next(update);
                        count += 1;
                    }
                    Ok(other) => {
                        warn!(path = %path.display(), kind = other.kind(), "Skipping unexpected packet in updates");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupt update");
                    }
                }
            }

            info!(recipient = %recipient, count, "Read channel updates");
            events.complete();
        });

        subscription
    }

    /// Remove a delivered notification. The file is removed only while it
    /// still holds `delivered`; a newer notification saved for the same
    /// channel in the meantime is kept. Returns `false` if nothing was
    /// removed.
    pub async fn delete_update(&self, recipient: &Name, delivered: &ChannelUpdated) -> Result<bool> {
        let key = StorageInner::recipient_key(recipient);
        let channel = delivered.channel;
        let file = self.inner.recipient_dir(&key).join(channel.to_string());
        let expected = Packet::ChannelUpdated(delivered.clone()).encode();
        let inner = Arc::clone(&self.inner);

        let removed = self
            .inner
            .updates
            .write(key, async move {
                inner
                    .blocking(move || remove_if_unchanged(&file, &expected))
                    .await
            })
            .await??;

        debug!(recipient = %recipient, channel = %channel, removed, "Deleted channel update");
        Ok(removed)
    }
}

fn remove_if_unchanged(file: &Path, expected: &[u8]) -> io::Result<bool> {
    let current = match fs::read(file) {
        Ok(current) => current,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if current != expected {
        debug!(path = %file.display(), "Update changed since delivery, keeping it");
        return Ok(false);
    }

    match fs::remove_file(file) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Contents of every file in a recipient directory, sorted by file name.
fn read_update_files(dir: PathBuf) -> io::Result<Vec<(PathBuf, Bytes)>> {
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::read(&path) {
            Ok(bytes) => files.push((path, Bytes::from(bytes))),
            // Deleted between listing and reading.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::storage::test_support::*;

    fn update(channel: ChannelId, n: &str) -> ChannelUpdated {
        ChannelUpdated {
            channel,
            name: name(n),
        }
    }

    async fn list(storage: &Storage, recipient: &str) -> Vec<ChannelUpdated> {
        storage
            .list_updates(&name(recipient))
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_without_updates_is_empty() {
        let (storage, _dir) = test_storage().await;
        assert!(list(&storage, "nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_list() {
        let (storage, _dir) = test_storage().await;
        let a = ChannelId::new();
        let b = ChannelId::new();

        storage.save_update(&name("bob"), update(a, "alice")).await.unwrap();
        storage.save_update(&name("bob"), update(b, "Group channel")).await.unwrap();
        storage.save_update(&name("carol"), update(a, "x")).await.unwrap();

        let mut updates = list(&storage, "bob").await;
        updates.sort_by_key(|u| u.channel);
        let mut expected = vec![update(a, "alice"), update(b, "Group channel")];
        expected.sort_by_key(|u| u.channel);
        assert_eq!(updates, expected);
    }

    #[tokio::test]
    async fn test_later_update_overwrites_earlier() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();

        storage.save_update(&name("bob"), update(channel, "old")).await.unwrap();
        storage.save_update(&name("bob"), update(channel, "new")).await.unwrap();

        assert_eq!(list(&storage, "bob").await, vec![update(channel, "new")]);
    }

    #[tokio::test]
    async fn test_recipient_names_are_case_insensitive() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();

        storage.save_update(&name("Bob"), update(channel, "alice")).await.unwrap();
        assert_eq!(list(&storage, "bOB").await, vec![update(channel, "alice")]);
    }

    #[tokio::test]
    async fn test_delete_drains_updates() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();

        storage.save_update(&name("bob"), update(channel, "alice")).await.unwrap();
        let delivered = update(channel, "alice");
        assert!(storage.delete_update(&name("bob"), &delivered).await.unwrap());
        assert!(list(&storage, "bob").await.is_empty());

        // Already gone: reported, not an error.
        assert!(!storage.delete_update(&name("bob"), &delivered).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_keeps_update_saved_after_delivery() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();

        storage.save_update(&name("bob"), update(channel, "v1")).await.unwrap();
        let delivered = list(&storage, "bob").await;
        assert_eq!(delivered, vec![update(channel, "v1")]);

        // Another session renames the channel before the delete lands.
        storage.save_update(&name("bob"), update(channel, "v2")).await.unwrap();

        assert!(!storage.delete_update(&name("bob"), &delivered[0]).await.unwrap());
        assert_eq!(list(&storage, "bob").await, vec![update(channel, "v2")]);
    }

    #[tokio::test]
    async fn test_corrupt_update_is_skipped() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();
        storage.save_update(&name("bob"), update(channel, "alice")).await.unwrap();

        let key = StorageInner::recipient_key(&name("bob"));
        let garbage = storage.inner.recipient_dir(&key).join(ChannelId::new().to_string());
        std::fs::write(garbage, b"no type here").unwrap();

        assert_eq!(list(&storage, "bob").await, vec![update(channel, "alice")]);
    }
}
