//! Transcript store trait and its error type.

use super::key::SessionKey;
use super::types::Turn;
use async_trait::async_trait;
use thiserror::Error;

/// Result type for transcript store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the storage medium. Absent or expired transcripts are not errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Credentials were rejected; retrying cannot help.
    #[error("store authentication failed: {0}")]
    Authentication(String),

    /// The remote store cannot be reached right now.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// A command failed on an established connection.
    #[error("store transport error: {0}")]
    Transport(String),

    /// A stored record could not be decoded.
    #[error("corrupt transcript record: {0}")]
    Corrupt(String),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for her_common::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Authentication(msg) => Self::Auth(msg),
            StoreError::Unavailable(msg) => Self::Unavailable(msg),
            StoreError::Io(e) => Self::Io(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Ordered, append-only transcripts keyed by [`SessionKey`].
///
/// Implementations must apply each `append` batch atomically: a concurrent
/// `read_all` sees either every turn of the batch or none of them.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Backend name (e.g., "redis", "memory", "file").
    fn name(&self) -> &str;

    /// Append turns in order.
    async fn append(&self, key: &SessionKey, turns: &[Turn]) -> StoreResult<()>;

    /// All turns in append order; empty when absent, expired or cleared.
    async fn read_all(&self, key: &SessionKey) -> StoreResult<Vec<Turn>>;

    /// Remove every turn for the key. Clearing an empty transcript is a no-op.
    async fn clear(&self, key: &SessionKey) -> StoreResult<()>;

    /// Remove every transcript owned by this store, returning how many were removed.
    async fn clear_all(&self) -> StoreResult<usize>;

    /// True when the backend is operational.
    async fn health_check(&self) -> bool;

    async fn append_human(&self, key: &SessionKey, content: &str) -> StoreResult<()> {
        self.append(key, &[Turn::human(content)]).await
    }

    async fn append_assistant(&self, key: &SessionKey, content: &str) -> StoreResult<()> {
        self.append(key, &[Turn::assistant(content)]).await
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share, run against each implementation.

    use super::*;

    pub async fn round_trip(store: &dyn TranscriptStore) {
        let key = SessionKey::derive("host1", "round-trip");
        store.append_human(&key, "hi").await.unwrap();
        store.append_assistant(&key, "hello").await.unwrap();

        let turns = store.read_all(&key).await.unwrap();
        assert_eq!(turns, vec![Turn::human("hi"), Turn::assistant("hello")]);
    }

    pub async fn absent_is_empty(store: &dyn TranscriptStore) {
        let key = SessionKey::derive("host1", "never-written");
        assert!(store.read_all(&key).await.unwrap().is_empty());
    }

    pub async fn clear_is_idempotent(store: &dyn TranscriptStore) {
        let key = SessionKey::derive("host1", "clear-twice");
        store
            .append(&key, &[Turn::human("q"), Turn::assistant("a")])
            .await
            .unwrap();

        store.clear(&key).await.unwrap();
        assert!(store.read_all(&key).await.unwrap().is_empty());
        store.clear(&key).await.unwrap();
        assert!(store.read_all(&key).await.unwrap().is_empty());

        // Key is reusable after a clear.
        store.append_human(&key, "again").await.unwrap();
        assert_eq!(store.read_all(&key).await.unwrap(), vec![Turn::human("again")]);
    }

    pub async fn keys_are_isolated(store: &dyn TranscriptStore) {
        let a = SessionKey::derive("host1", "a");
        let b = SessionKey::derive("host1", "b");
        store.append_human(&a, "for a").await.unwrap();
        store.append_human(&b, "for b").await.unwrap();

        store.clear(&a).await.unwrap();
        assert!(store.read_all(&a).await.unwrap().is_empty());
        assert_eq!(store.read_all(&b).await.unwrap(), vec![Turn::human("for b")]);
    }

    pub async fn clear_all_counts_transcripts(store: &dyn TranscriptStore) {
        for session in ["x1", "x2", "x3"] {
            let key = SessionKey::derive("clear-all", session);
            store.append_human(&key, "hey").await.unwrap();
        }
        assert_eq!(store.clear_all().await.unwrap(), 3);
        assert_eq!(store.clear_all().await.unwrap(), 0);
        let key = SessionKey::derive("clear-all", "x1");
        assert!(store.read_all(&key).await.unwrap().is_empty());
    }
}
