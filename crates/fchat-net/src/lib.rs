// Framed client/server transport: 4-byte big-endian length prefix + payload.

pub mod connection;
pub mod error;

pub use connection::Connection;
pub use error::ConnectionError;
