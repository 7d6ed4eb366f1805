//! Log-brokered broker for horizontally scaled deployments.
//!
//! The producer side writes every inbound frame to one external log
//! topic, partitioned by a configured key.  Every process runs one
//! consumer that reads the *entire* topic (each consumer joins its own
//! group) and repeats the same classify -> persist -> fan-out logic as
//! the standalone broker, but delivers only to clients registered on
//! this process -- a recipient connected elsewhere is that process's
//! responsibility.  Login/logout management mirrors the standalone
//! broker and governs only the local registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use palaver_shared::ids::UserId;
use palaver_shared::wire::InboundFrame;

use crate::error::BrokerError;
use crate::registry::{ClientHandle, ClientRegistry};
use crate::router::Router;
use crate::Broker;

/// External log connection settings, environment-supplied.
#[derive(Debug, Clone)]
pub struct LogBrokerConfig {
    /// Bootstrap servers, `host:port[,host:port...]`.
    pub brokers: String,
    /// Topic every process produces to and consumes from.
    pub topic: String,
    /// Consumer group prefix; a unique suffix is appended per process so
    /// that every process observes every record.
    pub group_prefix: String,
    /// Partition key for produced records.
    pub partition_key: String,
    /// Producer/consumer I/O timeout.
    pub timeout: Duration,
    /// Login/logout event queue capacity.
    pub event_capacity: usize,
}

impl Default for LogBrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "127.0.0.1:9092".to_string(),
            topic: "palaver-messages".to_string(),
            group_prefix: "palaver-delivery".to_string(),
            partition_key: "palaver".to_string(),
            timeout: Duration::from_secs(5),
            event_capacity: palaver_shared::constants::EVENT_QUEUE_CAPACITY,
        }
    }
}

struct Queues {
    login_tx: Option<mpsc::Sender<ClientHandle>>,
    logout_tx: Option<mpsc::Sender<ClientHandle>>,
    receivers: Option<(mpsc::Receiver<ClientHandle>, mpsc::Receiver<ClientHandle>)>,
    tasks: Vec<JoinHandle<()>>,
}

/// Log-backed [`Broker`] implementation.
pub struct DistributedBroker {
    registry: Arc<ClientRegistry>,
    router: Arc<Router>,
    config: LogBrokerConfig,
    producer: FutureProducer,
    queues: Mutex<Queues>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    started: AtomicBool,
}

impl DistributedBroker {
    /// Build the broker and its producer.  The producer connects lazily;
    /// an unreachable cluster surfaces on the first publish, not here.
    pub fn new(
        router: Arc<Router>,
        registry: Arc<ClientRegistry>,
        config: LogBrokerConfig,
    ) -> Result<Arc<Self>, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.timeout.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::Producer(e.to_string()))?;

        let (login_tx, login_rx) = mpsc::channel(config.event_capacity.max(1));
        let (logout_tx, logout_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            registry,
            router,
            config,
            producer,
            queues: Mutex::new(Queues {
                login_tx: Some(login_tx),
                logout_tx: Some(logout_tx),
                receivers: Some((login_rx, logout_rx)),
                tasks: Vec::new(),
            }),
            shutdown,
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }))
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn build_consumer(&self) -> Result<StreamConsumer, BrokerError> {
        // Unique group per process: the topic has no partition affinity
        // to recipients, so every process must read every record.
        let group_id = format!("{}-{}", self.config.group_prefix, Uuid::new_v4().simple());
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set(
                "session.timeout.ms",
                (self.config.timeout.as_millis() * 6).to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;
        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;
        info!(group = %group_id, topic = %self.config.topic, "log consumer subscribed");
        Ok(consumer)
    }
}

#[async_trait]
impl Broker for DistributedBroker {
    async fn publish(&self, frame: Bytes) -> Result<(), BrokerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let record = FutureRecord::to(&self.config.topic)
            .key(self.config.partition_key.as_str())
            .payload(frame.as_ref());

        // Enqueue-only: the local producer queue gives the same fail-fast
        // backpressure signal as the standalone broker's shared queue.
        match self.producer.send_result(record) {
            Ok(delivery) => {
                // Delivery acks are observed off to the side; a failed
                // produce is logged, never retried (at-most-once).
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Err((e, _))) => warn!(error = %e, "log produce failed"),
                        Err(_) => debug!("producer dropped before delivery ack"),
                        Ok(Ok(_)) => {}
                    }
                });
                Ok(())
            }
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                Err(BrokerError::QueueFull)
            }
            Err((e, _)) => Err(BrokerError::Producer(e.to_string())),
        }
    }

    async fn register_client(&self, handle: ClientHandle) -> Result<(), BrokerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let tx = self
            .lock_queues()
            .login_tx
            .clone()
            .ok_or(BrokerError::Closed)?;
        tx.send(handle).await.map_err(|_| BrokerError::Closed)
    }

    async fn unregister_client(&self, handle: ClientHandle) -> Result<(), BrokerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let tx = self
            .lock_queues()
            .logout_tx
            .clone()
            .ok_or(BrokerError::Closed)?;
        tx.send(handle).await.map_err(|_| BrokerError::Closed)
    }

    fn get_client(&self, user: &UserId) -> Option<ClientHandle> {
        self.registry.get(user)
    }

    async fn start(&self) -> Result<(), BrokerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadyStarted);
        }
        let consumer = self.build_consumer()?;
        let (login_rx, logout_rx) = self
            .lock_queues()
            .receivers
            .take()
            .ok_or(BrokerError::AlreadyStarted)?;
        self.running.store(true, Ordering::Release);

        let session_task = tokio::spawn(session_loop(self.registry.clone(), login_rx, logout_rx));
        let consume_task = tokio::spawn(consume_loop(
            consumer,
            self.router.clone(),
            self.shutdown.subscribe(),
        ));

        let mut queues = self.lock_queues();
        queues.tasks.push(session_task);
        queues.tasks.push(consume_task);
        info!(topic = %self.config.topic, "distributed broker started");
        Ok(())
    }

    async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Stop the consumer first, then the event loops, then flush the
        // producer: teardown is ordered after broker shutdown.
        let _ = self.shutdown.send(true);
        let tasks = {
            let mut queues = self.lock_queues();
            queues.login_tx = None;
            queues.logout_tx = None;
            std::mem::take(&mut queues.tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "broker task ended abnormally");
            }
        }

        let producer = self.producer.clone();
        let timeout = self.config.timeout;
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(timeout)).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "producer flush failed"),
            Err(e) => warn!(error = %e, "producer flush task failed"),
        }
        info!("distributed broker closed");
    }
}

/// Coordinating loop for the local registry.  Mirrors the standalone
/// broker's loop; the two brokers stay independently readable.
async fn session_loop(
    registry: Arc<ClientRegistry>,
    mut login_rx: mpsc::Receiver<ClientHandle>,
    mut logout_rx: mpsc::Receiver<ClientHandle>,
) {
    loop {
        tokio::select! {
            login = login_rx.recv() => match login {
                Some(handle) => {
                    info!(user = %handle.user_id(), "client registered locally");
                    if let Some(displaced) = registry.insert(handle) {
                        info!(user = %displaced.user_id(), "displacing previous local session");
                        displaced.close();
                    }
                }
                None => break,
            },
            logout = logout_rx.recv() => match logout {
                Some(handle) => {
                    if let Some(removed) = registry.remove(&handle) {
                        info!(user = %removed.user_id(), "client unregistered locally");
                        removed.close();
                    }
                    handle.close();
                }
                None => break,
            },
        }
    }
    registry.close_all();
    debug!("local session loop stopped");
}

/// Reads the whole topic and routes each record against the local
/// registry.  Consume errors are logged and retried after a short pause;
/// the loop only exits on shutdown.
async fn consume_loop(
    consumer: StreamConsumer,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = consumer.recv() => match received {
                Ok(record) => {
                    let Some(payload) = record.payload() else {
                        continue;
                    };
                    match InboundFrame::from_bytes(payload) {
                        Ok(frame) => {
                            if std::panic::AssertUnwindSafe(router.dispatch(frame))
                                .catch_unwind()
                                .await
                                .is_err()
                            {
                                error!("message dispatch panicked");
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable record"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "log consume failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    info!("log consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_cache::{ConversationCache, MemoryBackend, TaskPool};
    use palaver_shared::ids::MessageIdGen;
    use palaver_store::{MemoryRepository, Repository};

    fn test_broker() -> Arc<DistributedBroker> {
        let registry = Arc::new(ClientRegistry::new());
        let repository = Arc::new(MemoryRepository::new());
        let backend = Arc::new(MemoryBackend::new());
        let pool = Arc::new(TaskPool::new(1, 8));
        let cache = Arc::new(ConversationCache::new(
            backend,
            pool,
            10,
            Duration::from_secs(60),
        ));
        let router = Arc::new(Router::new(
            repository as Arc<dyn Repository>,
            cache,
            registry.clone(),
            MessageIdGen::new(1).unwrap(),
        ));
        DistributedBroker::new(router, registry, LogBrokerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn publish_fails_when_not_running() {
        let broker = test_broker();
        assert!(matches!(
            broker.publish(Bytes::from_static(b"{}")).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn register_fails_when_not_running() {
        let broker = test_broker();
        let endpoint =
            crate::endpoint::ConnectionEndpoint::new(UserId::parse("Ualice").unwrap(), 4);
        assert!(matches!(
            broker.register_client(endpoint.handle()).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_before_start_is_a_no_op() {
        let broker = test_broker();
        broker.close().await;
        broker.close().await;
    }
}
