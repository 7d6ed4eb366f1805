//! Single-process broker.
//!
//! One shared bounded inbound queue plus two bounded event queues
//! (login, logout).  A coordinating loop selects across the event
//! queues and is the only writer to the client registry; a second task
//! drains the inbound queue and calls the router.  `close()` drops the
//! senders, which the loops observe as queue closure -- no loop is ever
//! interrupted mid-operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use palaver_shared::ids::UserId;
use palaver_shared::wire::InboundFrame;

use crate::error::BrokerError;
use crate::registry::{ClientHandle, ClientRegistry};
use crate::router::Router;
use crate::Broker;

/// Queue capacities for a standalone broker.
#[derive(Debug, Clone, Copy)]
pub struct StandaloneConfig {
    pub inbound_capacity: usize,
    pub event_capacity: usize,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: palaver_shared::constants::INBOUND_QUEUE_CAPACITY,
            event_capacity: palaver_shared::constants::EVENT_QUEUE_CAPACITY,
        }
    }
}

struct Queues {
    inbound_tx: Option<mpsc::Sender<Bytes>>,
    login_tx: Option<mpsc::Sender<ClientHandle>>,
    logout_tx: Option<mpsc::Sender<ClientHandle>>,
    receivers: Option<Receivers>,
    tasks: Vec<JoinHandle<()>>,
}

struct Receivers {
    inbound: mpsc::Receiver<Bytes>,
    login: mpsc::Receiver<ClientHandle>,
    logout: mpsc::Receiver<ClientHandle>,
}

/// In-process [`Broker`] implementation.
pub struct StandaloneBroker {
    registry: Arc<ClientRegistry>,
    router: Arc<Router>,
    queues: Mutex<Queues>,
    running: AtomicBool,
}

impl StandaloneBroker {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<ClientRegistry>,
        config: StandaloneConfig,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (login_tx, login_rx) = mpsc::channel(config.event_capacity.max(1));
        let (logout_tx, logout_rx) = mpsc::channel(config.event_capacity.max(1));

        Arc::new(Self {
            registry,
            router,
            queues: Mutex::new(Queues {
                inbound_tx: Some(inbound_tx),
                login_tx: Some(login_tx),
                logout_tx: Some(logout_tx),
                receivers: Some(Receivers {
                    inbound: inbound_rx,
                    login: login_rx,
                    logout: logout_rx,
                }),
                tasks: Vec::new(),
            }),
            running: AtomicBool::new(false),
        })
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(
        &self,
        pick: impl Fn(&Queues) -> Option<mpsc::Sender<ClientHandle>>,
    ) -> Result<mpsc::Sender<ClientHandle>, BrokerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        pick(&self.lock_queues()).ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl Broker for StandaloneBroker {
    async fn publish(&self, frame: Bytes) -> Result<(), BrokerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let tx = self
            .lock_queues()
            .inbound_tx
            .clone()
            .ok_or(BrokerError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::QueueFull,
            TrySendError::Closed(_) => BrokerError::Closed,
        })
    }

    async fn register_client(&self, handle: ClientHandle) -> Result<(), BrokerError> {
        let tx = self.sender(|q| q.login_tx.clone())?;
        tx.send(handle).await.map_err(|_| BrokerError::Closed)
    }

    async fn unregister_client(&self, handle: ClientHandle) -> Result<(), BrokerError> {
        let tx = self.sender(|q| q.logout_tx.clone())?;
        tx.send(handle).await.map_err(|_| BrokerError::Closed)
    }

    fn get_client(&self, user: &UserId) -> Option<ClientHandle> {
        self.registry.get(user)
    }

    async fn start(&self) -> Result<(), BrokerError> {
        let receivers = self
            .lock_queues()
            .receivers
            .take()
            .ok_or(BrokerError::AlreadyStarted)?;
        self.running.store(true, Ordering::Release);

        let session_task = tokio::spawn(session_loop(
            self.registry.clone(),
            receivers.login,
            receivers.logout,
        ));
        let dispatch_task = tokio::spawn(dispatch_loop(self.router.clone(), receivers.inbound));

        let mut queues = self.lock_queues();
        queues.tasks.push(session_task);
        queues.tasks.push(dispatch_task);
        info!("standalone broker started");
        Ok(())
    }

    async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let tasks = {
            let mut queues = self.lock_queues();
            queues.inbound_tx = None;
            queues.login_tx = None;
            queues.logout_tx = None;
            std::mem::take(&mut queues.tasks)
        };
        // Loops exit on their next receive once the queues close.
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "broker task ended abnormally");
            }
        }
        info!("standalone broker closed");
    }
}

/// The coordinating loop: sole writer to the registry.
async fn session_loop(
    registry: Arc<ClientRegistry>,
    mut login_rx: mpsc::Receiver<ClientHandle>,
    mut logout_rx: mpsc::Receiver<ClientHandle>,
) {
    loop {
        tokio::select! {
            login = login_rx.recv() => match login {
                Some(handle) => {
                    info!(user = %handle.user_id(), "client registered");
                    if let Some(displaced) = registry.insert(handle) {
                        // Last login wins; tear the older session down.
                        info!(user = %displaced.user_id(), "displacing previous session");
                        displaced.close();
                    }
                }
                None => break,
            },
            logout = logout_rx.recv() => match logout {
                Some(handle) => {
                    if let Some(removed) = registry.remove(&handle) {
                        info!(user = %removed.user_id(), "client unregistered");
                        removed.close();
                    }
                    // Close the departing session's queues either way;
                    // a stale logout must not leave loops running.
                    handle.close();
                }
                None => break,
            },
        }
    }
    // Shutdown: drop every live session so write loops observe closure.
    registry.close_all();
    debug!("session loop stopped");
}

/// Drains the shared inbound queue, deserializes, and calls the router.
async fn dispatch_loop(router: Arc<Router>, mut inbound_rx: mpsc::Receiver<Bytes>) {
    while let Some(raw) = inbound_rx.recv().await {
        let frame = match InboundFrame::from_bytes(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };
        // A panicking dispatch is logged and recovered; it must never
        // take the process down.
        if std::panic::AssertUnwindSafe(router.dispatch(frame))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("message dispatch panicked");
        }
    }
    debug!("dispatch loop stopped");
}
