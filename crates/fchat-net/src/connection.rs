//! Length-prefixed framing over a byte stream.
//!
//! Frame format:
//! ```text
//! +----------------------+------------------+
//! | length (4 bytes, BE) | payload          |
//! +----------------------+------------------+
//! ```
//!
//! A zero-length frame is the null marker: it ends a sequence of reply
//! packets, acts as the "ready" cue during an upload and ends a byte-chunk
//! stream. Whether a payload is a packet or raw file bytes is known only from
//! protocol context.
//!
//! Writes go through a [`TaskQueue`] so two logical sends never interleave.
//! Reads are exclusive: a second read issued while one is outstanding fails
//! immediately with [`ConnectionError::ReadInProgress`].

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, trace};

use fchat_shared::constants::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use fchat_shared::{Executors, Packet, TaskQueue};

use crate::error::ConnectionError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Halves {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
}

impl Halves {
    fn split<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }
}

struct Inner {
    /// Remote address for lazily established connections.
    remote: Option<String>,
    halves: OnceCell<Halves>,
    dead: AtomicBool,
}

impl Inner {
    async fn halves(&self) -> Result<&Halves, ConnectionError> {
        if self.dead.load(Ordering::Acquire) {
            return Err(ConnectionError::already_failed());
        }

        self.halves
            .get_or_try_init(|| async {
                let addr = self.remote.as_deref().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "no stream and no remote address")
                })?;
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                debug!(addr = %addr, "Connected");
                Ok::<_, io::Error>(Halves::split(stream))
            })
            .await
            .map_err(|e| self.fail(e))
    }

    fn fail(&self, error: io::Error) -> ConnectionError {
        self.dead.store(true, Ordering::Release);
        ConnectionError::Disconnected(error)
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        let halves = self.halves().await?;
        let length = u32::try_from(payload.len()).map_err(|_| {
            ConnectionError::FrameTooLarge {
                size: payload.len(),
                max: u32::MAX as usize,
            }
        })?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32(length);
        frame.put_slice(payload);

        let mut writer = halves.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| self.fail(e))?;
        trace!(len = payload.len(), "Frame sent");
        Ok(())
    }
}

/// One framed, bidirectional connection. Cheap to clone; clones share the
/// same socket, write queue and read slot.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    send_queue: Arc<TaskQueue>,
    max_frame_size: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.inner.remote)
            .field("established", &self.inner.halves.initialized())
            .field("dead", &self.inner.dead.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    /// Wrap an already established stream (an accepted socket, or an
    /// in-memory duplex in tests).
    pub fn from_stream<S>(stream: S, executors: &Executors) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(None, OnceCell::from(Halves::split(stream)), executors)
    }

    /// A TCP connection to `addr` that is only established on first use.
    pub fn lazy(addr: impl Into<String>, executors: &Executors) -> Self {
        Self::build(Some(addr.into()), OnceCell::new(), executors)
    }

    fn build(remote: Option<String>, halves: OnceCell<Halves>, executors: &Executors) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                halves,
                dead: AtomicBool::new(false),
            }),
            send_queue: Arc::new(TaskQueue::new(executors.worker.clone())),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Reject inbound frames longer than `max` bytes.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue one packet frame, or the null marker for `None`.
    ///
    /// Encoding happens here, before the frame is queued; the write itself is
    /// queued immediately and happens whether or not the returned future is
    /// awaited.
    pub fn send_packet(
        &self,
        packet: Option<&Packet>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        let payload = packet.map(Packet::encode).unwrap_or_default();
        self.send_frame(payload)
    }

    /// Queue one frame carrying raw bytes. An empty buffer is the null marker.
    pub fn send_bytes(
        &self,
        bytes: Bytes,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        self.send_frame(bytes)
    }

    fn send_frame(
        &self,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let handle = self
            .send_queue
            .submit(async move { inner.write_frame(&payload).await });

        async move {
            handle
                .await
                .map_err(|e| ConnectionError::Disconnected(io::Error::new(io::ErrorKind::Other, e)))?
        }
    }

    /// Wait for every queued frame, then close the write half.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        let inner = Arc::clone(&self.inner);
        let handle = self.send_queue.submit(async move {
            let Some(halves) = inner.halves.get() else {
                return Ok(());
            };
            let mut writer = halves.writer.lock().await;
            writer.shutdown().await.map_err(|e| inner.fail(e))
        });

        handle
            .await
            .map_err(|e| ConnectionError::Disconnected(io::Error::new(io::ErrorKind::Other, e)))?
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Read one frame and decode it. `Ok(None)` is the null marker.
    pub async fn read_packet(&self) -> Result<Option<Packet>, ConnectionError> {
        let payload = self.read_frame().await?;
        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(Packet::decode(&payload)?))
    }

    /// Read one frame and return its raw payload (empty for the null marker).
    pub async fn read_bytes(&self) -> Result<Bytes, ConnectionError> {
        self.read_frame().await
    }

    async fn read_frame(&self) -> Result<Bytes, ConnectionError> {
        let halves = self.inner.halves().await?;
        let mut reader = halves
            .reader
            .try_lock()
            .map_err(|_| ConnectionError::ReadInProgress)?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| self.inner.fail(e))?;

        let length = u32::from_be_bytes(header) as usize;
        if length > self.max_frame_size {
            self.inner.dead.store(true, Ordering::Release);
            return Err(ConnectionError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let mut payload = vec![0u8; length];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| self.inner.fail(e))?;

        trace!(len = length, "Frame received");
        Ok(Bytes::from(payload))
    }
}
