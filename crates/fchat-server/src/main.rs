//! # fchat-server
//!
//! Chat server speaking the fchat framed protocol over TCP.
//!
//! This binary provides:
//! - **Channel updates**: pending create/rename notifications per user,
//!   drained by the client on request
//! - **Message logs**: an append-only log per channel with an index for
//!   fetching the most recent messages
//! - **File transfer**: chunked uploads and downloads with explicit flow
//!   control
//!
//! Two runtimes are built by hand: a worker runtime for protocol logic and
//! an io runtime whose blocking pool does all file-system work.

mod config;
mod error;
mod server;
mod session;

use anyhow::Context;
use tokio::runtime::Builder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fchat_shared::Executors;
use fchat_store::Storage;

use crate::config::ServerConfig;
use crate::server::Server;

fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fchat_server=debug")),
        )
        .init();

    info!("Starting fchat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Build the worker and io runtimes
    // -----------------------------------------------------------------------
    let io_runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(config.io_threads)
        .thread_name("fchat-io")
        .enable_all()
        .build()
        .context("failed to build io runtime")?;

    let worker_runtime = Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("fchat-worker")
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;

    let executors = Executors::new(worker_runtime.handle().clone(), io_runtime.handle().clone());

    // -----------------------------------------------------------------------
    // 4. Serve until Ctrl+C
    // -----------------------------------------------------------------------
    worker_runtime.block_on(serve(config, executors))
}

async fn serve(config: ServerConfig, executors: Executors) -> anyhow::Result<()> {
    let storage = Storage::open(config.data_dir.clone(), executors.clone())
        .await
        .with_context(|| format!("failed to open data directory {}", config.data_dir.display()))?;

    let server = Server::bind(&config, storage, executors)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;

    // tokio::select! ensures that if either the accept loop fails or a
    // shutdown signal arrives, we exit cleanly.
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Accept loop failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
