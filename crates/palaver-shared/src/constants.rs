/// Shared inbound queue capacity per broker instance.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Login/logout event queue capacity per broker instance.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Outbound delivery queue capacity per connection.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Per-connection overflow buffer size (backpressure tier two).
pub const OVERFLOW_BUFFER_CAPACITY: usize = 64;

/// Number of messages kept in a cached conversation tail.
pub const CONVERSATION_TAIL_LEN: usize = 50;

/// TTL for cached conversation tails, in seconds.
pub const CONVERSATION_TAIL_TTL_SECS: u64 = 600;

/// Cache task queue capacity.
pub const CACHE_TASK_QUEUE_CAPACITY: usize = 512;

/// Number of cache worker tasks.
pub const CACHE_WORKERS: usize = 4;

/// Maximum inbound frame size in bytes (256 KiB).
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Default WebSocket upgrade path.
pub const WS_PATH: &str = "/ws";
