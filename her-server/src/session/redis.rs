//! Redis-backed transcript store.
//!
//! Each transcript is a Redis list at `{prefix}{session_key}`; every element is
//! one JSON-encoded [`Turn`]. Appends run in a `MULTI`/`EXEC` pipeline together
//! with the TTL refresh, so readers never observe half a batch.

use super::key::SessionKey;
use super::store::{StoreError, StoreResult, TranscriptStore};
use super::types::Turn;
use crate::connection::{classify, ConnectError, ConnectionPool, RedisConnector};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use std::sync::Arc;
use std::time::Duration;

const SCAN_BATCH: usize = 100;

/// Remote transcript store over a shared connection pool.
pub struct RedisTranscriptStore {
    pool: Arc<ConnectionPool<RedisConnector>>,
    prefix: String,
    ttl: Option<Duration>,
}

impl RedisTranscriptStore {
    pub fn new(
        pool: Arc<ConnectionPool<RedisConnector>>,
        prefix: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<RedisConnector>> {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<MultiplexedConnection> {
        self.pool.acquire().await
    }

    /// Translate a command failure, dropping the handle if the link is gone.
    async fn command_failed(&self, err: RedisError) -> StoreError {
        match classify(&err) {
            ConnectError::Connectivity(msg) => {
                tracing::warn!(error = %msg, "Redis command failed on a broken connection");
                self.pool.invalidate().await;
                StoreError::Unavailable(msg)
            }
            ConnectError::Authentication(msg) => StoreError::Authentication(msg),
            ConnectError::Unknown(msg) => StoreError::Transport(msg),
        }
    }

    fn scan_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 1);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

#[async_trait]
impl TranscriptStore for RedisTranscriptStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn append(&self, key: &SessionKey, turns: &[Turn]) -> StoreResult<()> {
        if turns.is_empty() {
            return Ok(());
        }

        let records = turns
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Corrupt(format!("cannot encode turn: {e}")))?;

        let storage_key = key.storage_key(&self.prefix);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(&storage_key)
            .arg(records)
            .ignore();
        if let Some(ttl) = self.ttl {
            pipe.cmd("EXPIRE")
                .arg(&storage_key)
                .arg(ttl.as_secs())
                .ignore();
        }

        let mut conn = self.conn().await?;
        match pipe.query_async::<()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.command_failed(e).await),
        }
    }

    async fn read_all(&self, key: &SessionKey) -> StoreResult<Vec<Turn>> {
        let mut conn = self.conn().await?;
        let records = match redis::cmd("LRANGE")
            .arg(key.storage_key(&self.prefix))
            .arg(0)
            .arg(-1)
            .query_async::<Vec<String>>(&mut conn)
            .await
        {
            Ok(records) => records,
            Err(e) => return Err(self.command_failed(e).await),
        };

        records
            .iter()
            .map(|record| {
                serde_json::from_str::<Turn>(record)
                    .map_err(|e| StoreError::Corrupt(format!("{key}: {e}")))
            })
            .collect()
    }

    async fn clear(&self, key: &SessionKey) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        match redis::cmd("DEL")
            .arg(key.storage_key(&self.prefix))
            .query_async::<i64>(&mut conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.command_failed(e).await),
        }
    }

    async fn clear_all(&self) -> StoreResult<usize> {
        let mut conn = self.conn().await?;
        let pattern = self.scan_pattern();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
            {
                Ok(page) => page,
                Err(e) => return Err(self.command_failed(e).await),
            };

            if !keys.is_empty() {
                match redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<usize>(&mut conn)
                    .await
                {
                    Ok(n) => removed += n,
                    Err(e) => return Err(self.command_failed(e).await),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::info!(removed, pattern = %pattern, "Cleared Redis transcripts");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(response) => response == "PONG",
            Err(e) => {
                self.command_failed(e).await;
                false
            }
        }
    }
}
