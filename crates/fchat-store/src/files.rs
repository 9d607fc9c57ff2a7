//! Uploaded file blobs.
//!
//! Name allocation is a write task keyed by channel. The allocation task
//! registers the write of the file's bytes (keyed by path) before it
//! releases, so a download scheduled after it always sees the whole file.

use std::error::Error as StdError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use fchat_shared::{ChannelId, EventStream, Subscription};

use crate::error::{Result, StoreError};
use crate::storage::{Storage, StorageInner};

/// Outcome of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Collision-resolved name the file is stored under.
    pub name: String,
    pub size: u64,
}

/// A download in progress. `chunks` yields one chunk per request pushed on
/// the request stream and ends once the file is exhausted.
#[derive(Debug)]
pub struct FileDownload {
    pub size: u64,
    pub chunks: Subscription<Bytes, StoreError>,
}

impl Storage {
    /// Store an upload under `proposed`, or under the first free incremented
    /// variant of it. `chunks` is polled for the next chunk only once the
    /// previous one is on disk; an empty chunk or the end of the stream
    /// finishes the upload.
    pub async fn save_file<S, E>(
        &self,
        channel: ChannelId,
        proposed: &str,
        chunks: S,
    ) -> Result<SavedFile>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        validate_file_name(proposed)?;

        let dir = self.inner.files_dir(channel);
        let inner = Arc::clone(&self.inner);
        let proposed = proposed.to_string();

        let (name, upload) = self
            .inner
            .file_names
            .write(channel, async move {
                let (name, path, file) = inner
                    .blocking(move || create_unique(&dir, proposed))
                    .await?;

                debug!(channel = %channel, name = %name, "Allocated file name");
                let upload = inner.files.write(
                    path.clone(),
                    receive_file(Arc::clone(&inner), path, file, chunks),
                );
                Ok::<_, StoreError>((name, upload))
            })
            .await??;

        let size = upload.await??;
        info!(channel = %channel, name = %name, size, "Saved file");
        Ok(SavedFile { name, size })
    }

    /// Open a stored file for a pull-based download. Every value pushed on
    /// `requests` asks for the next chunk of at most that many bytes.
    ///
    /// Returns `None` if the channel has no file called `name`.
    pub async fn get_file<R>(
        &self,
        channel: ChannelId,
        name: &str,
        requests: R,
    ) -> Result<Option<FileDownload>>
    where
        R: Stream<Item = usize> + Send + 'static,
    {
        validate_file_name(name)?;

        let path = self.inner.files_dir(channel).join(name);
        let inner = Arc::clone(&self.inner);
        let (size_tx, size_rx) = oneshot::channel();
        let mut events = EventStream::forward_only();
        let chunks = events.subscribe();

        self.inner
            .file_names
            .read(channel, async move {
                let files = inner.files.clone();
                files.read(path.clone(), serve_file(inner, path, requests, size_tx, events));
            })
            .await?;

        match size_rx.await {
            Ok(Ok(Some(size))) => {
                debug!(channel = %channel, name, size, "Serving file");
                Ok(Some(FileDownload { size, chunks }))
            }
            Ok(Ok(None)) => {
                debug!(channel = %channel, name, "File not found");
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::TaskAborted(
                "file download ended before reporting a size".to_string(),
            )),
        }
    }
}

/// Rejects names that are not a single plain path component.
pub fn validate_file_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

/// Next candidate for a taken file name: the last trailing `(n)` becomes
/// `(n+1)`, otherwise ` (1)` is appended.
///
/// ```
/// use fchat_store::increment_file_name;
///
/// assert_eq!(increment_file_name("doc.txt"), "doc.txt (1)");
/// assert_eq!(increment_file_name("doc.txt (1)"), "doc.txt (2)");
/// assert_eq!(increment_file_name("name (5)(1)"), "name (5)(2)");
/// ```
pub fn increment_file_name(name: &str) -> String {
    if let Some(stem) = name.strip_suffix(')') {
        if let Some(open) = stem.rfind('(') {
            let digits = &stem[open + 1..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Some(next) = digits.parse::<u64>().ok().and_then(|n| n.checked_add(1)) {
                    return format!("{}({next})", &stem[..open]);
                }
            }
        }
    }
    format!("{name} (1)")
}

/// Creates the first free name in `dir`, starting from `proposed`.
fn create_unique(dir: &Path, proposed: String) -> io::Result<(String, PathBuf, File)> {
    fs::create_dir_all(dir)?;

    let mut name = proposed;
    loop {
        let path = dir.join(&name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((name, path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                name = increment_file_name(&name);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn receive_file<S, E>(
    inner: Arc<StorageInner>,
    path: PathBuf,
    mut file: File,
    chunks: S,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    let mut chunks = Box::pin(chunks);
    let mut size = 0u64;

    let outcome = loop {
        let chunk = match chunks.next().await {
            None => break Ok(size),
            Some(Ok(chunk)) if chunk.is_empty() => break Ok(size),
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break Err(StoreError::Upload(Arc::new(e))),
        };

        size += chunk.len() as u64;
        match inner
            .blocking(move || {
                file.write_all(&chunk)?;
                Ok(file)
            })
            .await
        {
            Ok(written) => file = written,
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &outcome {
        warn!(path = %path.display(), error = %e, "Upload failed, removing partial file");
        let partial = path.clone();
        if let Err(e) = inner.blocking(move || fs::remove_file(&partial)).await {
            warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
    outcome
}

type SizeReply = oneshot::Sender<Result<Option<u64>>>;

async fn serve_file<R>(
    inner: Arc<StorageInner>,
    path: PathBuf,
    requests: R,
    size_tx: SizeReply,
    mut events: EventStream<Bytes, StoreError>,
) where
    R: Stream<Item = usize> + Send + 'static,
{
    let opened = inner
        .blocking(move || match File::open(&path) {
            Ok(file) => {
                let size = file.metadata()?.len();
                Ok(Some((file, size)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await;

    let (mut file, size) = match opened {
        Ok(Some(found)) => found,
        Ok(None) => {
            let _ = size_tx.send(Ok(None));
            return;
        }
        Err(e) => {
            let _ = size_tx.send(Err(e));
            return;
        }
    };
    if size_tx.send(Ok(Some(size))).is_err() {
        return;
    }

    let mut requests = Box::pin(requests);
    while let Some(wanted) = requests.next().await {
        if !events.has_subscribers() {
            debug!("Download abandoned");
            return;
        }
        let read = inner
            .blocking(move || {
                let mut buf = Vec::with_capacity(wanted);
                (&mut file).take(wanted as u64).read_to_end(&mut buf)?;
                Ok((file, buf))
            })
            .await;

        match read {
            Ok((_, buf)) if buf.is_empty() => break,
            Ok((rest, buf)) => {
                file = rest;
                events.next(Bytes::from(buf));
            }
            Err(e) => {
                events.error(e);
                return;
            }
        }
    }
    events.complete();
}
