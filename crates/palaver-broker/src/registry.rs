//! Live-connection registry: `UserId -> ClientHandle`, one per broker
//! instance.
//!
//! The map is safe for concurrent reads from any task, but only the
//! owning broker's coordinating loop mutates it -- that single-writer
//! rule is what makes "deliver to X" and "X just disconnected" race-free
//! by construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use palaver_shared::ids::UserId;
use palaver_shared::wire::DeliveryEnvelope;

/// Monotonic session serial, unique within the process.  Lets the
/// registry tell a stale logout from the current login of the same user.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Cheaply cloneable handle to one live connection.
///
/// Holds the outbound queue sender and a shutdown signal; the endpoint's
/// write loop owns the matching receiver.  Closing is idempotent.
#[derive(Clone)]
pub struct ClientHandle {
    user_id: UserId,
    session: u64,
    outbound: mpsc::Sender<DeliveryEnvelope>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    pub(crate) fn new(user_id: UserId, outbound: mpsc::Sender<DeliveryEnvelope>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            user_id,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            outbound,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Queue an envelope without blocking.  Returns `false` when the
    /// outbound queue is full or the connection is gone; the caller logs
    /// and moves on (delivery is at-most-once).
    pub fn deliver(&self, envelope: DeliveryEnvelope) -> bool {
        self.outbound.try_send(envelope).is_ok()
    }

    /// Signal both endpoint loops to exit.  Safe to call any number of
    /// times.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolve once the handle has been closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Concurrent `UserId -> ClientHandle` map.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<UserId, ClientHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, returning the displaced one when the user was
    /// already connected (last login wins).
    pub fn insert(&self, handle: ClientHandle) -> Option<ClientHandle> {
        self.clients.insert(handle.user_id().clone(), handle)
    }

    /// Remove a user's entry only if it still belongs to the given
    /// session.  A logout racing a fresh login is a no-op.
    pub fn remove(&self, handle: &ClientHandle) -> Option<ClientHandle> {
        self.clients
            .remove_if(handle.user_id(), |_, existing| {
                existing.session() == handle.session()
            })
            .map(|(_, removed)| removed)
    }

    /// Look up the live connection for a user.
    pub fn get(&self, user: &UserId) -> Option<ClientHandle> {
        self.clients.get(user).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.clients.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close every live handle and clear the map.  Called by the
    /// coordinating loop as its final act on shutdown.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            debug!(user = %entry.key(), "closing session on shutdown");
            entry.value().close();
        }
        self.clients.clear();
    }
}
