//! In-process transcript store, used directly or as the fallback tier.

use super::key::SessionKey;
use super::store::{StoreResult, TranscriptStore};
use super::types::Turn;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Upper bound on the time between sweeps of expired transcripts.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    turns: Vec<Turn>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Entries {
    map: HashMap<SessionKey, Entry>,
    last_sweep: Instant,
}

/// Transcripts held in process memory; lost on restart.
///
/// A TTL is refreshed on every append, mirroring `EXPIRE` on the remote tier.
/// An expired entry reads as empty right away; appends also sweep every expired
/// entry out of the map, at most once per TTL (capped at one minute).
pub struct MemoryTranscriptStore {
    entries: RwLock<Entries>,
    ttl: Option<Duration>,
}

impl MemoryTranscriptStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl,
        }
    }

    /// Number of live transcripts.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.map.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryTranscriptStore {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, key: &SessionKey, turns: &[Turn]) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if let Some(ttl) = self.ttl {
            if now.duration_since(entries.last_sweep) >= ttl.min(MAX_SWEEP_INTERVAL) {
                let before = entries.map.len();
                entries.map.retain(|_, e| !e.is_expired(now));
                entries.last_sweep = now;
                let swept = before - entries.map.len();
                if swept > 0 {
                    tracing::debug!(swept, "Dropped expired transcripts");
                }
            }
        }

        let entry = entries.map.entry(key.clone()).or_insert_with(|| Entry {
            turns: Vec::new(),
            expires_at: None,
        });
        if entry.is_expired(now) {
            entry.turns.clear();
        }
        entry.turns.extend_from_slice(turns);
        entry.expires_at = self.ttl.map(|ttl| now + ttl);
        Ok(())
    }

    async fn read_all(&self, key: &SessionKey) -> StoreResult<Vec<Turn>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.map.get(key) {
                None => return Ok(Vec::new()),
                Some(entry) if !entry.is_expired(now) => return Ok(entry.turns.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.map.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.map.remove(key);
        }
        Ok(Vec::new())
    }

    async fn clear(&self, key: &SessionKey) -> StoreResult<()> {
        self.entries.write().await.map.remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let live = entries.map.values().filter(|e| !e.is_expired(now)).count();
        entries.map.clear();
        Ok(live)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
