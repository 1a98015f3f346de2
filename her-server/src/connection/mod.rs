//! Remote store connectivity: tier state, connectors and the connection pool.
//!
//! ```text
//!  startup check ──▶ ConnectionPool::connect ──▶ Connector::connect (× retries)
//!                         │                            │
//!  request ──▶ acquire ───┤ cached handle              ├─ auth      → fatal, no retry
//!                         │                            ├─ transient → retry, then Unavailable
//!                         ▼                            └─ unknown   → Unavailable
//!                     TierState (Remote | Local) ◀── read by every request
//! ```

mod redis;

pub use self::redis::RedisConnector;
pub(crate) use self::redis::classify;

use crate::session::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

// ============================================================================
// Tier State
// ============================================================================

/// Which storage tier requests are currently served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    /// Remote keyed store is reachable.
    Remote,
    /// Local fallback is in use.
    Local,
}

impl StorageTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// Shared, injectable view of the active storage tier.
///
/// Cloning shares the same underlying flag.
#[derive(Debug, Clone)]
pub struct TierState {
    inner: Arc<AtomicU8>,
}

impl TierState {
    pub fn new(initial: StorageTier) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(Self::encode(initial))),
        }
    }

    pub fn current(&self) -> StorageTier {
        match self.inner.load(Ordering::SeqCst) {
            0 => StorageTier::Remote,
            _ => StorageTier::Local,
        }
    }

    pub fn set(&self, tier: StorageTier) {
        let previous = self.inner.swap(Self::encode(tier), Ordering::SeqCst);
        if previous != Self::encode(tier) {
            tracing::info!(tier = tier.as_str(), "Storage tier changed");
        }
    }

    fn encode(tier: StorageTier) -> u8 {
        match tier {
            StorageTier::Remote => 0,
            StorageTier::Local => 1,
        }
    }
}

impl Default for TierState {
    fn default() -> Self {
        Self::new(StorageTier::Local)
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Classified failure of a single connection attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network-level failure worth retrying.
    #[error("connection failed: {0}")]
    Connectivity(String),

    /// Anything else; not retried.
    #[error("unexpected connection error: {0}")]
    Unknown(String),
}

/// Opens and liveness-checks one connection to a remote store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Shared connection handle; clones must be cheap and share the socket.
    type Connection: Clone + Send + Sync + 'static;

    /// Fingerprint of the connection parameters (host, port, credential...).
    ///
    /// The pool rebuilds its handle when the fingerprint changes.
    fn fingerprint(&self) -> String;

    /// Open a connection and confirm it answers a liveness check.
    async fn connect(&self) -> Result<Self::Connection, ConnectError>;
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Retry and reconnect policy for a pool.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per connect, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Minimum spacing between reconnect attempts while degraded.
    pub reconnect_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(30),
        }
    }
}

impl From<&her_common::RedisConfig> for RetryPolicy {
    fn from(config: &her_common::RedisConfig) -> Self {
        Self {
            max_attempts: config.retries.max(1),
            delay: Duration::from_secs(config.retry_delay_secs),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
        }
    }
}

struct PoolState<C: Connector> {
    connector: Arc<C>,
    handle: Option<C::Connection>,
    last_attempt: Option<Instant>,
    auth_failed: bool,
}

/// Owns the single shared connection handle to a remote store.
///
/// All connection attempts run under one async mutex, so concurrent callers
/// never build duplicate handles: late arrivals wait and reuse the result.
pub struct ConnectionPool<C: Connector> {
    state: Mutex<PoolState<C>>,
    policy: RetryPolicy,
    tier: TierState,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, policy: RetryPolicy, tier: TierState) -> Self {
        Self {
            state: Mutex::new(PoolState {
                connector: Arc::new(connector),
                handle: None,
                last_attempt: None,
                auth_failed: false,
            }),
            policy,
            tier,
        }
    }

    pub fn tier(&self) -> &TierState {
        &self.tier
    }

    /// Force a fresh connection attempt, replacing any cached handle.
    pub async fn connect(&self) -> Result<C::Connection, StoreError> {
        let mut state = self.state.lock().await;
        state.handle = None;
        self.connect_locked(&mut state).await
    }

    /// Borrow the shared handle, reconnecting under the reconnect policy.
    pub async fn acquire(&self) -> Result<C::Connection, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(handle) = &state.handle {
            return Ok(handle.clone());
        }

        if state.auth_failed {
            return Err(StoreError::Authentication(
                "credentials were rejected; fix them and reload (SIGHUP) or restart".into(),
            ));
        }

        if let Some(last) = state.last_attempt {
            if last.elapsed() < self.policy.reconnect_interval {
                return Err(StoreError::Unavailable(
                    "remote store unreachable; waiting before reconnecting".into(),
                ));
            }
        }

        self.connect_locked(&mut state).await
    }

    /// Drop the cached handle after a transport failure.
    ///
    /// The next `acquire` reconnects immediately.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.handle.take().is_some() {
            tracing::warn!("Remote store connection invalidated, falling back to local storage");
        }
        state.last_attempt = None;
        self.tier.set(StorageTier::Local);
    }

    /// Install new connection parameters, as loaded on `SIGHUP`.
    ///
    /// The handle is kept when the fingerprint is unchanged and rebuilt lazily otherwise.
    /// A replaced connector also lifts the stop imposed by an authentication failure.
    pub async fn replace_connector(&self, connector: C) {
        let mut state = self.state.lock().await;
        if state.connector.fingerprint() == connector.fingerprint() {
            return;
        }

        tracing::info!("Remote store parameters changed, dropping cached connection");
        state.connector = Arc::new(connector);
        state.handle = None;
        state.last_attempt = None;
        state.auth_failed = false;
        self.tier.set(StorageTier::Local);
    }

    /// Whether a handle is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.handle.is_some()
    }

    async fn connect_locked(&self, state: &mut PoolState<C>) -> Result<C::Connection, StoreError> {
        let connector = state.connector.clone();
        let max_attempts = self.policy.max_attempts.max(1);
        state.last_attempt = Some(Instant::now());

        for attempt in 1..=max_attempts {
            match connector.connect().await {
                Ok(conn) => {
                    tracing::info!(attempt, "Remote store connected");
                    state.handle = Some(conn.clone());
                    state.auth_failed = false;
                    state.last_attempt = Some(Instant::now());
                    self.tier.set(StorageTier::Remote);
                    return Ok(conn);
                }
                Err(ConnectError::Authentication(msg)) => {
                    tracing::error!(error = %msg, "Remote store authentication failed, check the password");
                    state.auth_failed = true;
                    self.tier.set(StorageTier::Local);
                    return Err(StoreError::Authentication(msg));
                }
                Err(ConnectError::Connectivity(msg)) if attempt < max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        error = %msg,
                        "Remote store connection failed, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(ConnectError::Connectivity(msg)) => {
                    tracing::error!(attempts = max_attempts, error = %msg, "Remote store connection failed");
                    break;
                }
                Err(ConnectError::Unknown(msg)) => {
                    tracing::error!(error = %msg, "Unknown error connecting to remote store");
                    break;
                }
            }
        }

        state.last_attempt = Some(Instant::now());
        self.tier.set(StorageTier::Local);
        Err(StoreError::Unavailable(format!(
            "could not reach remote store after {max_attempts} attempt(s)"
        )))
    }
}

/// Capability the store router needs from a remote tier.
#[async_trait]
pub trait Availability: Send + Sync {
    /// True when a connection can be used right now.
    async fn ensure_available(&self) -> bool;

    /// Report the active tier.
    fn tier(&self) -> StorageTier;
}

#[async_trait]
impl<C: Connector> Availability for ConnectionPool<C> {
    async fn ensure_available(&self) -> bool {
        self.acquire().await.is_ok()
    }

    fn tier(&self) -> StorageTier {
        self.tier.current()
    }
}
