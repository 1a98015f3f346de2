//! her server - Conversational HTTP backend with tiered session storage.
//!
//! This crate provides:
//! - A streamed chat endpoint over a hosted, OpenAI-compatible model
//! - Per-session transcripts keyed by client host and session id
//! - Redis-backed storage with automatic fallback to a local store
//!
//! ## Architecture
//!
//! ```text
//! Client → routes → Conversation ─┬─▶ Provider (model stream)
//!                                 └─▶ StoreRouter ─┬─▶ RedisTranscriptStore (ConnectionPool)
//!                                                  └─▶ local store (memory | file)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod connection;
pub mod conversation;
pub mod provider;
pub mod routes;
pub mod session;

pub use connection::{ConnectionPool, RedisConnector, RetryPolicy, StorageTier, TierState};
pub use conversation::{Conversation, ConversationSettings, TurnEvent, TurnRequest};
pub use provider::{create_provider, ChatRequest, ChatResponse, CompatibleProvider, Provider, ProviderError};
pub use routes::AppState;
pub use session::{SessionKey, StoreRouter, TranscriptStore, Turn};

use axum::Router;
use her_common::{Config, StorageBackend, StorageConfig};
use session::{FileTranscriptStore, MemoryTranscriptStore, RedisTranscriptStore, RemoteTier};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::build_routes(state).layer(cors)
}

/// Build the storage tiers described by the configuration.
///
/// Never fails: an unusable remote tier or file directory degrades to the
/// in-memory store with an error in the log.
pub async fn build_stores(config: &StorageConfig) -> StoreRouter {
    let ttl = config.ttl_secs.map(Duration::from_secs);
    let memory = Arc::new(MemoryTranscriptStore::new(ttl));

    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory transcript storage");
            StoreRouter::local_only(memory)
        }
        StorageBackend::File => match FileTranscriptStore::new(&config.file_dir) {
            Ok(store) => {
                tracing::info!(dir = %config.file_dir.display(), "Using file transcript storage");
                StoreRouter::local_only(Arc::new(store))
            }
            Err(e) => {
                tracing::error!(
                    dir = %config.file_dir.display(),
                    error = %e,
                    "Cannot use transcript directory, falling back to memory"
                );
                StoreRouter::local_only(memory)
            }
        },
        StorageBackend::Redis => {
            let connector = match RedisConnector::from_config(&config.redis) {
                Ok(connector) => connector,
                Err(e) => {
                    tracing::warn!(error = %e, "Redis not configured, using in-memory transcript storage");
                    return StoreRouter::local_only(memory);
                }
            };

            let endpoint = connector.endpoint();
            let pool = Arc::new(ConnectionPool::new(
                connector,
                RetryPolicy::from(&config.redis),
                TierState::default(),
            ));

            match pool.connect().await {
                Ok(_) => tracing::info!(endpoint = %endpoint, "Redis transcript storage ready"),
                Err(e) if matches!(e, session::StoreError::Authentication(_)) => tracing::error!(
                    endpoint = %endpoint,
                    error = %e,
                    "Redis rejected the credentials; serving from local storage until restart"
                ),
                Err(e) => tracing::warn!(
                    endpoint = %endpoint,
                    error = %e,
                    "Redis unreachable at startup; serving from local storage and reconnecting later"
                ),
            }

            #[cfg(unix)]
            reload_redis_on_hangup(pool.clone());

            let store = Arc::new(RedisTranscriptStore::new(
                pool.clone(),
                config.key_prefix.clone(),
                ttl,
            ));
            StoreRouter::with_remote(
                RemoteTier {
                    store,
                    availability: pool,
                },
                memory,
            )
        }
    }
}

/// Re-read the Redis settings on `SIGHUP` and hand them to the pool, which
/// keeps its connection when the parameters did not change.
#[cfg(unix)]
fn reload_redis_on_hangup(pool: Arc<ConnectionPool<RedisConnector>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGHUP; Redis settings will not reload");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let connector = Config::reload().and_then(|(config, report)| {
                report.log();
                RedisConnector::from_config(&config.storage.redis)
            });
            match connector {
                Ok(connector) => {
                    tracing::info!(endpoint = %connector.endpoint(), "Reloaded Redis settings");
                    pool.replace_connector(connector).await;
                }
                Err(e) => tracing::error!(error = %e, "Failed to reload Redis settings, keeping the current ones"),
            }
        }
    });
}

/// Build the application state from configuration.
pub async fn build_state(config: &Config) -> AppState {
    let stores = Arc::new(build_stores(&config.storage).await);
    let provider = create_provider(&config.llm);
    let conversation = Arc::new(Conversation::new(
        stores,
        provider,
        ConversationSettings::from(&config.llm),
    ));
    AppState::new(conversation)
}

/// Start the server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let state = build_state(config).await;
    let router = build_router(state);

    tracing::info!("Starting her server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_backend_is_local_only() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            ..Default::default()
        };
        let stores = build_stores(&config).await;
        assert!(!stores.has_remote());
        assert_eq!(stores.select().await.name(), "memory");
    }

    #[tokio::test]
    async fn file_backend_uses_directory() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::File,
            file_dir: dir.path().join("chat_histories"),
            ..Default::default()
        };
        let stores = build_stores(&config).await;
        assert_eq!(stores.select().await.name(), "file");
        assert!(dir.path().join("chat_histories").is_dir());
    }

    #[tokio::test]
    async fn redis_without_host_falls_back_to_memory() {
        let stores = build_stores(&StorageConfig::default()).await;
        assert!(!stores.has_remote());
        assert_eq!(stores.tier(), StorageTier::Local);
    }

    #[tokio::test]
    async fn unreachable_redis_degrades_to_local() {
        let mut config = StorageConfig::default();
        config.redis.host = Some("127.0.0.1".into());
        config.redis.port = 1;
        config.redis.tls = false;
        config.redis.retries = 1;

        let stores = build_stores(&config).await;
        assert!(stores.has_remote());
        assert_eq!(stores.tier(), StorageTier::Local);
        assert_eq!(stores.select().await.name(), "memory");
    }
}
