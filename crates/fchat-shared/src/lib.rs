// Data model, packet codec and the concurrency primitives shared by the
// network, storage and server crates.

pub mod constants;
pub mod error;
pub mod event;
pub mod protocol;
pub mod runtime;
pub mod task_queue;
pub mod types;

pub use error::{DecodeError, StreamAbandoned, ValidationError};
pub use event::{EventStream, Subscription};
pub use protocol::Packet;
pub use runtime::Executors;
pub use task_queue::TaskQueue;
pub use types::{ChannelId, Message, Name};
