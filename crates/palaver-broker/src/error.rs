use thiserror::Error;

/// Errors produced by the delivery core.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker is not running (never started, or already closed).
    #[error("broker is closed")]
    Closed,

    /// The broker has already spawned its loops.
    #[error("broker already started")]
    AlreadyStarted,

    /// The shared inbound queue is full; the caller should buffer
    /// locally or surface a busy notice.
    #[error("inbound queue full")]
    QueueFull,

    /// Log producer failure (distributed mode).
    #[error("log producer error: {0}")]
    Producer(String),

    /// Log consumer failure (distributed mode).
    #[error("log consumer error: {0}")]
    Consumer(String),

    /// Frame encoding failed before publish.
    #[error(transparent)]
    Protocol(#[from] palaver_shared::ProtocolError),
}
