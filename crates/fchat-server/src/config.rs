//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use fchat_shared::constants::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address the chat protocol listens on.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:8080`
    pub listen_addr: SocketAddr,

    /// Root of the storage engine (updates, message logs, files).
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Threads of the worker runtime running protocol logic.
    /// Env: `WORKER_THREADS`
    /// Default: number of CPUs.
    pub worker_threads: usize,

    /// Upper bound of the blocking pool used for file-system calls.
    /// Env: `IO_THREADS`
    /// Default: `16`
    pub io_threads: usize,

    /// Largest inbound frame accepted, in bytes.
    /// Env: `MAX_FRAME_SIZE`
    /// Default: 16 MiB
    pub max_frame_size: usize,

    /// Maximum number of concurrent sessions (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_PORT).into(),
            data_dir: PathBuf::from("./data"),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            io_threads: 16,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_connections: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "LISTEN_ADDR", &mut config.listen_addr);

        if let Some(path) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(path);
        }

        parse_into(&lookup, "WORKER_THREADS", &mut config.worker_threads);
        parse_into(&lookup, "IO_THREADS", &mut config.io_threads);
        parse_into(&lookup, "MAX_FRAME_SIZE", &mut config.max_frame_size);
        parse_into(&lookup, "MAX_CONNECTIONS", &mut config.max_connections);

        // A runtime needs at least one thread.
        config.worker_threads = config.worker_threads.max(1);
        config.io_threads = config.io_threads.max(1);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `target` with the parsed value of `key`, keeping the default on
/// a malformed value.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(value) = lookup(key) else {
        return;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.io_threads, 16);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.max_connections, 0);
        assert!(config.worker_threads >= 1);
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("DATA_DIR", "/var/lib/fchat"),
            ("WORKER_THREADS", "3"),
            ("IO_THREADS", "8"),
            ("MAX_FRAME_SIZE", "1024"),
            ("MAX_CONNECTIONS", "100"),
        ]);
        assert_eq!(config.listen_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fchat"));
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.io_threads, 8);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.max_connections, 100);
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let config = from_vars(&[
            ("LISTEN_ADDR", "not an address"),
            ("IO_THREADS", "many"),
            ("MAX_CONNECTIONS", "-1"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.io_threads, defaults.io_threads);
        assert_eq!(config.max_connections, 0);
    }

    #[test]
    fn test_zero_threads_is_raised_to_one() {
        let config = from_vars(&[("WORKER_THREADS", "0"), ("IO_THREADS", "0")]);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.io_threads, 1);
    }
}
