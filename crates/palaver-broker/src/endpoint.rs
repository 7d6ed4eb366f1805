//! Per-connection endpoint: one read loop, one write loop, two bounded
//! queues.
//!
//! The loops are generic over the socket halves so the delivery core
//! never touches a concrete transport.  They run concurrently and
//! independently: a failure in one only ends that loop, and the
//! login/logout path tears both down by closing the handle's queues.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use palaver_shared::ids::UserId;
use palaver_shared::message::DeliveryStatus;
use palaver_shared::wire::{ClientFrame, DeliveryEnvelope, InboundFrame, ServerFrame};
use palaver_store::Repository;

use crate::error::BrokerError;
use crate::registry::ClientHandle;
use crate::Broker;

/// One live socket's delivery state: the registry handle plus the
/// outbound queue receiver the write loop will drain.
pub struct ConnectionEndpoint {
    handle: ClientHandle,
    outbound_rx: mpsc::Receiver<DeliveryEnvelope>,
}

impl ConnectionEndpoint {
    /// Build the endpoint for a freshly upgraded connection.
    pub fn new(user_id: UserId, outbound_capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        Self {
            handle: ClientHandle::new(user_id, outbound_tx),
            outbound_rx,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Split into the registry handle and the write loop's receiver.
    pub fn into_parts(self) -> (ClientHandle, mpsc::Receiver<DeliveryEnvelope>) {
        (self.handle, self.outbound_rx)
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Drain inbound frames until the socket ends or the handle is closed.
///
/// Each decoded send request is published through the three-tier
/// backpressure path; sockets errors are logged, not retried (the client
/// reconnects with a fresh endpoint).
pub async fn run_read_loop<S, E>(
    handle: ClientHandle,
    broker: Arc<dyn Broker>,
    mut frames: S,
    overflow_capacity: usize,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut overflow: VecDeque<Bytes> = VecDeque::new();

    loop {
        tokio::select! {
            _ = handle.closed() => {
                debug!(user = %handle.user_id(), "read loop shut down");
                break;
            }
            next = frames.next() => {
                match next {
                    Some(Ok(frame)) => {
                        handle_inbound(&handle, broker.as_ref(), &mut overflow, frame, overflow_capacity).await;
                    }
                    Some(Err(e)) => {
                        warn!(user = %handle.user_id(), error = %e, "socket read failed");
                        break;
                    }
                    None => {
                        debug!(user = %handle.user_id(), "client closed the connection");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_inbound(
    handle: &ClientHandle,
    broker: &dyn Broker,
    overflow: &mut VecDeque<Bytes>,
    frame: Bytes,
    overflow_capacity: usize,
) {
    let decoded = match ClientFrame::from_bytes(&frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(user = %handle.user_id(), error = %e, "dropping undecodable frame");
            return;
        }
    };

    match decoded {
        ClientFrame::Ping => {
            if let Ok(payload) = ServerFrame::Pong.to_bytes() {
                let _ = handle.deliver(DeliveryEnvelope {
                    payload,
                    message_id: None,
                });
            }
        }
        ClientFrame::Send(request) => {
            let inbound = InboundFrame {
                sender_id: handle.user_id().clone(),
                request,
            };
            let bytes = match inbound.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(user = %handle.user_id(), error = %e, "frame encode failed");
                    return;
                }
            };
            publish_with_backpressure(handle, broker, overflow, bytes, overflow_capacity).await;
        }
    }
}

/// The three-tier degrade path: (1) opportunistically drain this
/// connection's overflow buffer into the shared queue, (2) publish
/// directly while the shared queue has room, (3) buffer locally, and only
/// when that is also full (4) report a busy notice back to the sender.
async fn publish_with_backpressure(
    handle: &ClientHandle,
    broker: &dyn Broker,
    overflow: &mut VecDeque<Bytes>,
    frame: Bytes,
    overflow_capacity: usize,
) {
    // Tier one: older buffered frames go first.
    while let Some(front) = overflow.front() {
        match broker.publish(front.clone()).await {
            Ok(()) => {
                overflow.pop_front();
            }
            Err(BrokerError::QueueFull) => break,
            Err(e) => {
                warn!(user = %handle.user_id(), error = %e, "dropping buffered frame");
                overflow.pop_front();
            }
        }
    }

    // Tier two: direct publish, but never jump ahead of buffered frames.
    if overflow.is_empty() {
        match broker.publish(frame.clone()).await {
            Ok(()) => return,
            Err(BrokerError::QueueFull) => {}
            Err(e) => {
                warn!(user = %handle.user_id(), error = %e, "publish failed");
                return;
            }
        }
    }

    // Tier three: local overflow buffer.
    if overflow.len() < overflow_capacity {
        overflow.push_back(frame);
        return;
    }

    // All tiers exhausted: the sender gets an explicit retry notice
    // instead of blocking or silently losing the frame.
    debug!(user = %handle.user_id(), "local buffering exhausted, reporting busy");
    if let Ok(payload) = ServerFrame::Busy {
        reason: "server busy, retry shortly".to_string(),
    }
    .to_bytes()
    {
        if !handle.deliver(DeliveryEnvelope {
            payload,
            message_id: None,
        }) {
            warn!(user = %handle.user_id(), "busy notice dropped, outbound queue full");
        }
    }
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

/// Drain the outbound queue into the socket until the queue closes, the
/// handle is closed, or the sink errors.
///
/// A successful write of a persisted message advances its stored status
/// to `Sent`; status failures are logged and never interrupt delivery.
pub async fn run_write_loop<K, E>(
    handle: ClientHandle,
    mut outbound_rx: mpsc::Receiver<DeliveryEnvelope>,
    mut sink: K,
    repository: Arc<dyn Repository>,
) where
    K: Sink<Bytes, Error = E> + Unpin,
    E: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = handle.closed() => {
                debug!(user = %handle.user_id(), "write loop shut down");
                break;
            }
            envelope = outbound_rx.recv() => {
                let Some(envelope) = envelope else {
                    debug!(user = %handle.user_id(), "outbound queue closed");
                    break;
                };
                if let Err(e) = sink.send(envelope.payload).await {
                    warn!(user = %handle.user_id(), error = %e, "socket write failed");
                    break;
                }
                if let Some(id) = envelope.message_id {
                    if let Err(e) = repository
                        .update_message_status(id, DeliveryStatus::Sent)
                        .await
                    {
                        warn!(message = %id, error = %e, "status update failed");
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}
