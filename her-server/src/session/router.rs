//! Per-request store selection between the remote and local tiers.

use super::store::{StoreError, StoreResult, TranscriptStore};
use crate::connection::{Availability, StorageTier};
use std::sync::Arc;

/// Remote tier: the store plus the pool that says whether it is reachable.
#[derive(Clone)]
pub struct RemoteTier {
    pub store: Arc<dyn TranscriptStore>,
    pub availability: Arc<dyn Availability>,
}

/// Picks the transcript store for each request.
#[derive(Clone)]
pub struct StoreRouter {
    remote: Option<RemoteTier>,
    local: Arc<dyn TranscriptStore>,
}

impl StoreRouter {
    /// Router with only a local store (memory or file backend).
    pub fn local_only(local: Arc<dyn TranscriptStore>) -> Self {
        Self {
            remote: None,
            local,
        }
    }

    /// Router that prefers `remote` and falls back to `local`.
    pub fn with_remote(remote: RemoteTier, local: Arc<dyn TranscriptStore>) -> Self {
        Self {
            remote: Some(remote),
            local,
        }
    }

    /// Store to use for one request. Called once per request.
    pub async fn select(&self) -> Arc<dyn TranscriptStore> {
        if let Some(remote) = &self.remote {
            if remote.availability.ensure_available().await {
                return remote.store.clone();
            }
            tracing::debug!(store = self.local.name(), "Remote store unavailable, using local store");
        }
        self.local.clone()
    }

    /// Currently active tier.
    pub fn tier(&self) -> StorageTier {
        self.remote
            .as_ref()
            .map_or(StorageTier::Local, |remote| remote.availability.tier())
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Remove every transcript from the active tier and the local fallback.
    ///
    /// Fails with [`StoreError::Unavailable`] when the remote tier is active but
    /// cannot be reached.
    pub async fn clear_all(&self) -> StoreResult<(usize, StorageTier)> {
        let tier = self.tier();
        let mut removed = 0;

        if let (StorageTier::Remote, Some(remote)) = (tier, &self.remote) {
            if !remote.availability.ensure_available().await {
                return Err(StoreError::Unavailable(
                    "remote store is the active tier but cannot be reached".into(),
                ));
            }
            removed += remote.store.clear_all().await?;
        }

        removed += self.local.clear_all().await?;
        tracing::info!(removed, tier = tier.as_str(), "Cleared all transcripts");
        Ok((removed, tier))
    }

    /// Health of the store a request would use right now.
    pub async fn health_check(&self) -> bool {
        self.select().await.health_check().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::session::{SessionKey, Turn};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Availability flag flipped by hand.
    pub struct Switch {
        pub up: AtomicBool,
    }

    impl Switch {
        pub fn new(up: bool) -> Arc<Self> {
            Arc::new(Self {
                up: AtomicBool::new(up),
            })
        }
    }

    #[async_trait]
    impl Availability for Switch {
        async fn ensure_available(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn tier(&self) -> StorageTier {
            if self.up.load(Ordering::SeqCst) {
                StorageTier::Remote
            } else {
                StorageTier::Local
            }
        }
    }

    /// Reports the remote tier as active while every call fails.
    pub struct Unreachable;

    #[async_trait]
    impl Availability for Unreachable {
        async fn ensure_available(&self) -> bool {
            false
        }

        fn tier(&self) -> StorageTier {
            StorageTier::Remote
        }
    }

    #[async_trait]
    impl TranscriptStore for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn append(&self, _key: &SessionKey, _turns: &[Turn]) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn read_all(&self, _key: &SessionKey) -> StoreResult<Vec<Turn>> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn clear(&self, _key: &SessionKey) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn clear_all(&self) -> StoreResult<usize> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }
}
