//! # palaver-cache
//!
//! The conversation recency cache and its asynchronous task machinery.
//!
//! Three layers:
//! - [`CacheBackend`] -- the key/value + set collaborator interface.
//! - [`TaskPool`]     -- a bounded queue drained by a fixed set of
//!   panic-tolerant workers; full-queue submissions run inline on the
//!   caller instead of blocking or dropping.
//! - [`ConversationCache`] -- rolling per-conversation message tails and
//!   group-membership sets, maintained by fire-and-forget tasks.
//!
//! Cache failures are logged and swallowed; they never block delivery.

pub mod backend;
pub mod conversation;
pub mod pool;

mod error;

pub use backend::{CacheBackend, MemoryBackend};
pub use conversation::ConversationCache;
pub use error::{CacheError, Result};
pub use pool::TaskPool;
