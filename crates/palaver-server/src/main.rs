//! # palaver-server
//!
//! Real-time chat delivery server.
//!
//! This binary provides:
//! - **WebSocket delivery** at `/ws` (identity supplied by the fronting
//!   layer after authentication)
//! - **Two interchangeable brokers**: single-process in-memory fan-out,
//!   or Kafka-brokered fan-out for horizontally scaled deployments
//! - **SQLite-backed message history** with a read-through per
//!   conversation recency cache
//! - **Admin endpoints** for provisioning users and groups

mod api;
mod config;
mod error;
mod ws;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use palaver_broker::{
    Broker, BrokerMode, ClientRegistry, DistributedBroker, Router, StandaloneBroker,
};
use palaver_broker::standalone::StandaloneConfig;
use palaver_cache::{ConversationCache, MemoryBackend, TaskPool};
use palaver_shared::ids::MessageIdGen;
use palaver_store::{Database, Repository, SqliteRepository};

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("Starting Palaver delivery server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Store (durable message history and group membership)
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => {
            info!("DB_PATH unset, using an in-memory database");
            Database::open_in_memory()?
        }
    };
    let repository = Arc::new(SqliteRepository::new(database));

    // Conversation cache service and its worker pool
    let backend = Arc::new(MemoryBackend::new());
    let pool = Arc::new(TaskPool::new(config.cache_workers, config.cache_task_queue));
    let cache = Arc::new(ConversationCache::new(
        backend.clone(),
        pool,
        config.conversation_tail,
        config.conversation_ttl(),
    ));

    // Periodic cache expiry sweep (every 60 seconds)
    {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let purged = backend.purge_expired().await;
                if purged > 0 {
                    tracing::debug!(purged, "purged expired cache entries");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // 4. Build and start the broker for the configured deployment mode
    // -----------------------------------------------------------------------
    let registry = Arc::new(ClientRegistry::new());
    let ids = MessageIdGen::new(config.node_id)?;
    let router = Arc::new(Router::new(
        repository.clone() as Arc<dyn Repository>,
        cache.clone(),
        registry.clone(),
        ids,
    ));

    let broker: Arc<dyn Broker> = match config.broker_mode {
        BrokerMode::Standalone => StandaloneBroker::new(
            router,
            registry,
            StandaloneConfig {
                inbound_capacity: config.inbound_queue,
                event_capacity: config.event_queue,
            },
        ),
        BrokerMode::Kafka => {
            DistributedBroker::new(router, registry, config.log_broker_config())?
        }
    };
    broker.start().await?;
    info!(mode = ?config.broker_mode, "broker started");

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let app_state = AppState {
        broker: broker.clone(),
        repository,
        cache,
        config: Arc::new(config.clone()),
    };

    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly.
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                broker.close().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Flush and close broker resources before the process exits.
    broker.close().await;
    Ok(())
}
