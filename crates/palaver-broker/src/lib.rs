//! # palaver-broker
//!
//! The real-time delivery core: the [`Broker`] contract, the per-process
//! client registry, the per-connection endpoint loops, the routing rules
//! and the two broker implementations.
//!
//! [`StandaloneBroker`] fans out inside one process through a shared
//! in-memory queue; [`DistributedBroker`] produces every frame to an
//! external log topic and consumes the whole topic, delivering only to
//! clients registered on this process.  The two are deliberately
//! separate, independently readable implementations of one trait --
//! they diverge in fan-out scope and are not meant to share internals.

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;

use palaver_shared::ids::UserId;

pub mod distributed;
pub mod endpoint;
pub mod registry;
pub mod router;
pub mod standalone;

mod error;

pub use distributed::{DistributedBroker, LogBrokerConfig};
pub use endpoint::{run_read_loop, run_write_loop, ConnectionEndpoint};
pub use error::BrokerError;
pub use registry::{ClientHandle, ClientRegistry};
pub use router::Router;
pub use standalone::StandaloneBroker;

/// The contract both broker implementations satisfy.  One implementation
/// is selected at process start and constructor-injected everywhere.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue one raw frame for classification and fan-out.
    ///
    /// Fails fast with [`BrokerError::QueueFull`] under load (callers
    /// buffer locally, see [`endpoint`]) and [`BrokerError::Closed`]
    /// once the broker has shut down.  Never blocks.
    async fn publish(&self, frame: Bytes) -> Result<(), BrokerError>;

    /// Hand a freshly connected client to the coordinating loop.
    async fn register_client(&self, handle: ClientHandle) -> Result<(), BrokerError>;

    /// Ask the coordinating loop to drop a departed client.  Removal is
    /// conditional on the session still being current, so a stale logout
    /// never evicts a newer login.
    async fn unregister_client(&self, handle: ClientHandle) -> Result<(), BrokerError>;

    /// The live connection for a user on this process, if any.
    fn get_client(&self, user: &UserId) -> Option<ClientHandle>;

    /// Spawn the background loops.  Must be called exactly once.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Close every owned queue and wait for the loops to drain out.
    /// Idempotent; any publish after this fails instead of blocking.
    async fn close(&self);
}

/// Which broker implementation a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Standalone,
    Kafka,
}

impl FromStr for BrokerMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "standalone" | "channel" => Ok(BrokerMode::Standalone),
            "kafka" | "distributed" => Ok(BrokerMode::Kafka),
            other => Err(format!("unknown broker mode {other:?}")),
        }
    }
}
