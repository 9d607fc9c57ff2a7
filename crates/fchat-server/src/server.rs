//! TCP accept loop. One [`Session`] per accepted socket, spawned on the
//! worker runtime.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

use fchat_net::Connection;
use fchat_shared::Executors;
use fchat_store::Storage;

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::session::Session;

pub struct Server {
    listener: TcpListener,
    storage: Storage,
    executors: Executors,
    max_frame_size: usize,
    /// `None` when the number of sessions is unlimited.
    slots: Option<Arc<Semaphore>>,
}

impl Server {
    pub async fn bind(config: &ServerConfig, storage: Storage, executors: Executors) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let slots = (config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.max_connections)));

        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            "Listening"
        );

        Ok(Self {
            listener,
            storage,
            executors,
            max_frame_size: config.max_frame_size,
            slots,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. A failing session or a failed accept
    /// never stops the loop.
    pub async fn run(self) -> io::Result<()> {
        loop {
            // Wait for a free slot before accepting, so excess clients queue
            // in the listen backlog.
            let permit = match &self.slots {
                Some(slots) => Some(
                    Arc::clone(slots)
                        .acquire_owned()
                        .await
                        .map_err(io::Error::other)?,
                ),
                None => None,
            };

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let connection = Connection::from_stream(stream, &self.executors)
                .with_max_frame_size(self.max_frame_size);
            let session = Session::new(connection.clone(), self.storage.clone());

            self.executors.spawn(
                async move {
                    info!("Session started");
                    match session.run().await {
                        Ok(()) => info!("Session ended"),
                        Err(SessionError::ProtocolViolation(reason)) => {
                            warn!(reason = %reason, "Protocol violation, closing connection");
                        }
                        Err(e) => error!(error = %e, "Session failed"),
                    }
                    // Best effort: the peer may already be gone.
                    let _ = connection.shutdown().await;
                    drop(permit);
                }
                .instrument(info_span!("session", peer = %peer)),
            );
        }
    }
}
