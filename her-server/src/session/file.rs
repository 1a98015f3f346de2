//! File-backed transcript store.
//!
//! Directory layout: `{dir}/{session_key}.json`, each file a JSON array of
//! turns in append order. Transcripts survive restarts and never expire.

use super::key::SessionKey;
use super::store::{StoreError, StoreResult, TranscriptStore};
use super::types::Turn;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const EXTENSION: &str = "json";

/// JSON-file transcript store.
pub struct FileTranscriptStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileTranscriptStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", key.as_str()))
    }

    async fn load(path: &Path) -> StoreResult<Vec<Turn>> {
        match fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(path: &Path, turns: &[Turn]) -> StoreResult<()> {
        let bytes = serde_json::to_vec(turns)
            .map_err(|e| StoreError::Corrupt(format!("cannot encode transcript: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for FileTranscriptStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, key: &SessionKey, turns: &[Turn]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let mut existing = Self::load(&path).await?;
        existing.extend_from_slice(turns);
        Self::save(&path, &existing).await
    }

    async fn read_all(&self, key: &SessionKey) -> StoreResult<Vec<Turn>> {
        Self::load(&self.path_for(key)).await
    }

    async fn clear(&self, key: &SessionKey) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_all(&self) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        fs::metadata(&self.dir).await.is_ok_and(|m| m.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::contract;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_contract() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        contract::round_trip(&store).await;
        contract::absent_is_empty(&store).await;
        contract::clear_is_idempotent(&store).await;
        contract::keys_are_isolated(&store).await;
    }

    #[tokio::test]
    async fn file_store_clear_all() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        contract::clear_all_counts_transcripts(&store).await;
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn transcripts_survive_a_new_instance() {
        let dir = TempDir::new().unwrap();
        let key = SessionKey::derive("host1", "persist");
        {
            let store = FileTranscriptStore::new(dir.path()).unwrap();
            store
                .append(&key, &[Turn::human("hi"), Turn::assistant("hello")])
                .await
                .unwrap();
        }

        let reopened = FileTranscriptStore::new(dir.path()).unwrap();
        assert_eq!(reopened.read_all(&key).await.unwrap().len(), 2);
        assert!(dir.path().join(format!("{}.json", key.as_str())).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        let key = SessionKey::derive("host1", "corrupt");
        std::fs::write(store.path_for(&key), "{ not a list").unwrap();

        let err = store.read_all(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("chat_histories").join("deep");
        let store = FileTranscriptStore::new(&nested).unwrap();
        assert!(store.health_check().await);
        assert_eq!(store.dir(), nested.as_path());
    }
}
