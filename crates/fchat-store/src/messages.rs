use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fchat_shared::{ChannelId, EventStream, Message, Name, Subscription};

use crate::error::{Result, StoreError};
use crate::storage::{Storage, MESSAGE_INDEX_FILE, MESSAGE_LOG_FILE};

/// One index record: big-endian `(offset: i64, length: i64)`.
const INDEX_RECORD_SIZE: u64 = 16;

impl Storage {
    /// Append `message` to the channel's log and index it.
    pub async fn append_message(&self, channel: ChannelId, message: &Message) -> Result<()> {
        let dir = self.inner.channel_dir(channel);
        let inner = Arc::clone(&self.inner);
        let record = format!("{}\n{}", message.author(), message.content()).into_bytes();

        let (offset, length) = self
            .inner
            .messages
            .write(channel, async move {
                inner.blocking(move || append_record(&dir, &record)).await
            })
            .await??;

        info!(channel = %channel, offset, length, "Appended message");
        Ok(())
    }

    /// Stream up to `count` most recent messages of `channel`, oldest first.
    /// A channel without a log yields an empty stream.
    pub fn recent_messages(
        &self,
        channel: ChannelId,
        count: NonZeroU32,
    ) -> Subscription<Message, StoreError> {
        let mut events = EventStream::buffering();
        let subscription = events.subscribe();

        let dir = self.inner.channel_dir(channel);
        let inner = Arc::clone(&self.inner);

        self.inner.messages.read(channel, async move {
            let read = inner.blocking(move || Ok(read_recent(&dir, channel, count))).await;
            let records = match read.and_then(|records| records) {
                Ok(records) => records,
                Err(e) => {
                    events.error(e);
                    return;
                }
            };

            let total = records.len();
            for record in records {
                match parse_record(channel, &record) {
                    Ok(message) => events.next(message),
                    Err(e) => {
                        events.error(e);
                        return;
                    }
                }
            }

            debug!(channel = %channel, requested = count.get(), returned = total, "Read messages");
            events.complete();
        });

        subscription
    }
}

/// Writes `record` followed by a blank line at the end of the log, then the
/// matching index entry. Returns the record's `(offset, length)`.
fn append_record(dir: &Path, record: &[u8]) -> io::Result<(i64, i64)> {
    fs::create_dir_all(dir)?;

    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(MESSAGE_LOG_FILE))?;
    let offset = to_i64(log.metadata()?.len())?;
    let length = to_i64(record.len() as u64)?;

    log.write_all(record)?;
    log.write_all(b"\n\n")?;
    log.flush()?;

    let mut entry = [0u8; INDEX_RECORD_SIZE as usize];
    entry[..8].copy_from_slice(&offset.to_be_bytes());
    entry[8..].copy_from_slice(&length.to_be_bytes());

    let mut index = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(dir.join(MESSAGE_INDEX_FILE))?;

    // Drop a torn record left by an interrupted append so the new entry
    // stays aligned.
    let len = index.metadata()?.len();
    let aligned = len - len % INDEX_RECORD_SIZE;
    if aligned != len {
        warn!(path = %dir.display(), torn = len - aligned, "Truncating torn index record");
        index.set_len(aligned)?;
    }
    index.seek(SeekFrom::Start(aligned))?;
    index.write_all(&entry)?;
    index.flush()?;

    Ok((offset, length))
}

/// Raw `author\ncontent` spans of the last `count` indexed messages.
fn read_recent(dir: &Path, channel: ChannelId, count: NonZeroU32) -> Result<Vec<Vec<u8>>> {
    let corrupt = |reason: String| StoreError::CorruptLog { channel, reason };

    let mut index = match File::open(dir.join(MESSAGE_INDEX_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    // A torn trailing record from an interrupted append is not indexed yet.
    let len = index.metadata()?.len();
    let usable = len - len % INDEX_RECORD_SIZE;
    let start = usable.saturating_sub(INDEX_RECORD_SIZE * u64::from(count.get()));
    if start == usable {
        return Ok(Vec::new());
    }

    let mut entries = vec![0u8; (usable - start) as usize];
    index.seek(SeekFrom::Start(start))?;
    index.read_exact(&mut entries)?;

    let mut log = File::open(dir.join(MESSAGE_LOG_FILE))?;
    let log_len = log.metadata()?.len();
    let mut records = Vec::with_capacity(entries.len() / INDEX_RECORD_SIZE as usize);
    for entry in entries.chunks_exact(INDEX_RECORD_SIZE as usize) {
        let (offset, length) = decode_entry(entry).map_err(corrupt)?;
        match offset.checked_add(length) {
            Some(end) if end <= log_len => {}
            _ => {
                return Err(corrupt(format!(
                    "index entry ({offset}, {length}) past end of log ({log_len} bytes)"
                )))
            }
        }

        let mut record = vec![0u8; length as usize];
        log.seek(SeekFrom::Start(offset))?;
        log.read_exact(&mut record)?;
        records.push(record);
    }
    Ok(records)
}

fn decode_entry(entry: &[u8]) -> std::result::Result<(u64, u64), String> {
    let mut offset = [0u8; 8];
    let mut length = [0u8; 8];
    offset.copy_from_slice(&entry[..8]);
    length.copy_from_slice(&entry[8..]);

    let offset = i64::from_be_bytes(offset);
    let length = i64::from_be_bytes(length);
    match (u64::try_from(offset), u64::try_from(length)) {
        (Ok(offset), Ok(length)) => Ok((offset, length)),
        _ => Err(format!("negative index entry ({offset}, {length})")),
    }
}

fn parse_record(channel: ChannelId, record: &[u8]) -> Result<Message> {
    let corrupt = |reason: String| StoreError::CorruptLog { channel, reason };

    let text = std::str::from_utf8(record).map_err(|e| corrupt(e.to_string()))?;
    let (author, content) = text
        .split_once('\n')
        .ok_or_else(|| corrupt("record without author separator".to_string()))?;
    let author = Name::new(author).map_err(|e| corrupt(format!("author: {e}")))?;
    Message::new(author, content).map_err(|e| corrupt(format!("content: {e}")))
}

fn to_i64(value: u64) -> io::Result<i64> {
    i64::try_from(value).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "log too large"))
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::storage::test_support::*;

    fn message(author: &str, content: &str) -> Message {
        Message::new(name(author), content).unwrap()
    }

    fn count(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    async fn recent(storage: &Storage, channel: ChannelId, n: u32) -> Vec<Message> {
        storage
            .recent_messages(channel, count(n))
            .try_collect()
            .await
            .unwrap()
    }

    async fn append_numbered(storage: &Storage, channel: ChannelId, k: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        for i in 1..=k {
            let m = message("alice", &format!("message {i}"));
            storage.append_message(channel, &m).await.unwrap();
            messages.push(m);
        }
        messages
    }

    #[tokio::test]
    async fn test_empty_channel_has_no_messages() {
        let (storage, _dir) = test_storage().await;
        assert!(recent(&storage, ChannelId::new(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_request_more_than_stored_returns_all_in_order() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();
        let messages = append_numbered(&storage, channel, 3).await;

        assert_eq!(recent(&storage, channel, 3).await, messages);
        assert_eq!(recent(&storage, channel, 100).await, messages);
    }

    #[tokio::test]
    async fn test_request_fewer_returns_most_recent() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();
        let messages = append_numbered(&storage, channel, 5).await;

        assert_eq!(recent(&storage, channel, 2).await, messages[3..].to_vec());
        assert_eq!(recent(&storage, channel, 1).await, messages[4..].to_vec());
    }

    #[tokio::test]
    async fn test_log_and_index_layout() {
        let (storage, dir) = test_storage().await;
        let channel = ChannelId::new();
        storage.append_message(channel, &message("al", "hi")).await.unwrap();
        storage.append_message(channel, &message("bo", "yo!")).await.unwrap();

        let channel_dir = dir.path().join("messages").join(channel.to_string());
        let log = std::fs::read(channel_dir.join("messages.txt")).unwrap();
        assert_eq!(log, b"al\nhi\n\nbo\nyo!\n\n");

        let index = std::fs::read(channel_dir.join("index")).unwrap();
        let mut expected = Vec::new();
        for (offset, length) in [(0i64, 5i64), (7, 6)] {
            expected.extend_from_slice(&offset.to_be_bytes());
            expected.extend_from_slice(&length.to_be_bytes());
        }
        assert_eq!(index, expected);
    }

    #[tokio::test]
    async fn test_multiline_content_survives() {
        let (storage, _dir) = test_storage().await;
        let channel = ChannelId::new();
        let m = message("alice", "first line\nsecond line\n\nafter a blank");
        storage.append_message(channel, &m).await.unwrap();

        assert_eq!(recent(&storage, channel, 1).await, vec![m]);
    }

    #[tokio::test]
    async fn test_torn_index_record_is_ignored() {
        let (storage, dir) = test_storage().await;
        let channel = ChannelId::new();
        let messages = append_numbered(&storage, channel, 2).await;

        let index = dir
            .path()
            .join("messages")
            .join(channel.to_string())
            .join("index");
        let mut file = OpenOptions::new().append(true).open(index).unwrap();
        file.write_all(&[0xff; 7]).unwrap();

        assert_eq!(recent(&storage, channel, 5).await, messages);
    }

    #[tokio::test]
    async fn test_append_after_torn_index_stays_aligned() {
        let (storage, dir) = test_storage().await;
        let channel = ChannelId::new();
        let first = message("alice", "before the tear");
        storage.append_message(channel, &first).await.unwrap();

        let index = dir
            .path()
            .join("messages")
            .join(channel.to_string())
            .join("index");
        let mut file = OpenOptions::new().append(true).open(&index).unwrap();
        file.write_all(&[0xab; 7]).unwrap();
        drop(file);

        let second = message("bob", "after the tear");
        storage.append_message(channel, &second).await.unwrap();

        assert_eq!(std::fs::metadata(&index).unwrap().len(), 2 * INDEX_RECORD_SIZE);
        assert_eq!(recent(&storage, channel, 10).await, vec![first, second]);
    }

    #[tokio::test]
    async fn test_index_entry_past_end_of_log_is_corrupt() {
        let (storage, dir) = test_storage().await;
        let channel = ChannelId::new();
        storage.append_message(channel, &message("alice", "hi")).await.unwrap();

        let index = dir
            .path()
            .join("messages")
            .join(channel.to_string())
            .join("index");
        let mut file = OpenOptions::new().append(true).open(index).unwrap();
        file.write_all(&0i64.to_be_bytes()).unwrap();
        file.write_all(&(i64::MAX / 2).to_be_bytes()).unwrap();
        drop(file);

        let err = storage
            .recent_messages(channel, count(10))
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptLog { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_negative_index_entry_is_corrupt() {
        let (storage, dir) = test_storage().await;
        let channel = ChannelId::new();
        storage.append_message(channel, &message("alice", "hi")).await.unwrap();

        let index = dir
            .path()
            .join("messages")
            .join(channel.to_string())
            .join("index");
        let mut file = OpenOptions::new().append(true).open(index).unwrap();
        file.write_all(&(-1i64).to_be_bytes()).unwrap();
        file.write_all(&2i64.to_be_bytes()).unwrap();
        drop(file);

        let err = storage
            .recent_messages(channel, count(1))
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptLog { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let (storage, _dir) = test_storage().await;
        let a = ChannelId::new();
        let b = ChannelId::new();
        storage.append_message(a, &message("alice", "to a")).await.unwrap();
        storage.append_message(b, &message("bob", "to b")).await.unwrap();

        assert_eq!(recent(&storage, a, 10).await, vec![message("alice", "to a")]);
        assert_eq!(recent(&storage, b, 10).await, vec![message("bob", "to b")]);
    }

    #[test]
    fn test_record_without_separator_is_corrupt() {
        let channel = ChannelId::new();
        let err = parse_record(channel, b"no newline").unwrap_err();
        assert!(matches!(err, StoreError::CorruptLog { .. }));
    }
}
