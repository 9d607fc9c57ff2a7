/// Size of the big-endian length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default upper bound for one inbound frame payload (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes requested per chunk when serving a file download (64 KiB)
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Display name given to channels with more than two participants
pub const GROUP_CHANNEL_NAME: &str = "Group channel";

/// Default TCP listen port of the server
pub const DEFAULT_PORT: u16 = 8080;

/// Characters a `Name` may not contain: they delimit the packet wire form
pub const NAME_FORBIDDEN_CHARS: [char; 3] = [',', '=', '\n'];
