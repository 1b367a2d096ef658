//! Redis-backed queue store.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:entry:{id}`: the entry as JSON
//! - `{prefix}:pending`: sorted set of pending ids scored by `available_at` (ms)
//! - `{prefix}:dispatched`: sorted set of dispatched ids scored by last heartbeat (ms)
//!
//! Every status change rewrites the entry and moves its id between the
//! indexes in one Lua script, so a crash mid-transition leaves the old state
//! intact. Claiming is a `ZREM` from the pending set inside that script, so
//! only one worker wins a given entry even when several poll the same queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use vgen_models::{GenerationRequest, JobId};

use crate::entry::{EntryStatus, QueueEntry};
use crate::error::{QueueError, QueueResult};
use crate::store::{after, QueueSession, QueueStore};

/// Redis queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key namespace
    pub key_prefix: String,
    /// TTL applied to finished entries
    pub finished_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vgen:queue".to_string(),
            finished_ttl: Duration::from_secs(86400),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX")
                .unwrap_or_else(|_| "vgen:queue".to_string()),
            finished_ttl: Duration::from_secs(
                std::env::var("QUEUE_FINISHED_TTL")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(86400),
            ),
        }
    }

    fn entry_key(&self, entry_id: &str) -> String {
        format!("{}:entry:{}", self.key_prefix, entry_id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.key_prefix)
    }

    fn dispatched_key(&self) -> String {
        format!("{}:dispatched", self.key_prefix)
    }
}

/// Atomic index transitions.
///
/// KEYS: entry key, index the id leaves, index the id joins.
/// ARGV: entry id, entry JSON, target score (or TTL seconds for `finish`).
struct Scripts {
    /// Store and index a new entry.
    insert: Script,
    /// Move from pending to dispatched, only if still pending.
    claim: Script,
    /// Refresh the dispatched score, only if still dispatched.
    heartbeat: Script,
    /// Move from dispatched back to pending, only if still dispatched.
    requeue: Script,
    /// Drop from both indexes and store with a TTL.
    finish: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            insert: Script::new(
                r#"
                redis.call('SET', KEYS[1], ARGV[2])
                redis.call('ZREM', KEYS[2], ARGV[1])
                redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
                return 1
                "#,
            ),
            claim: Script::new(
                r#"
                if redis.call('ZREM', KEYS[2], ARGV[1]) == 0 then
                    return 0
                end
                redis.call('SET', KEYS[1], ARGV[2])
                redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
                return 1
                "#,
            ),
            heartbeat: Script::new(
                r#"
                if not redis.call('ZSCORE', KEYS[3], ARGV[1]) then
                    return 0
                end
                redis.call('SET', KEYS[1], ARGV[2])
                redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
                return 1
                "#,
            ),
            requeue: Script::new(
                r#"
                if redis.call('ZREM', KEYS[2], ARGV[1]) == 0 then
                    return 0
                end
                redis.call('SET', KEYS[1], ARGV[2])
                redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
                return 1
                "#,
            ),
            finish: Script::new(
                r#"
                redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
                redis.call('ZREM', KEYS[2], ARGV[1])
                redis.call('ZREM', KEYS[3], ARGV[1])
                return 1
                "#,
            ),
        }
    }
}

/// Queue store backed by Redis.
pub struct RedisQueueStore {
    client: redis::Client,
    config: QueueConfig,
    scripts: Arc<Scripts>,
}

impl RedisQueueStore {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            scripts: Arc::new(Scripts::new()),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn session(&self) -> QueueResult<Box<dyn QueueSession>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        Ok(Box::new(RedisSession {
            conn,
            config: self.config.clone(),
            scripts: Arc::clone(&self.scripts),
        }))
    }
}

struct RedisSession {
    conn: MultiplexedConnection,
    config: QueueConfig,
    scripts: Arc<Scripts>,
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl RedisSession {
    async fn load(&mut self, entry_id: &str) -> QueueResult<Option<QueueEntry>> {
        let raw: Option<String> = self.conn.get(self.config.entry_key(entry_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_existing(&mut self, entry_id: &str) -> QueueResult<QueueEntry> {
        self.load(entry_id)
            .await?
            .ok_or_else(|| QueueError::not_found(entry_id))
    }

    /// Run a transition script for `entry`. Returns whether it applied.
    async fn transition(
        &mut self,
        script: &Script,
        entry: &QueueEntry,
        from_index: &str,
        to_index: &str,
        score_or_ttl: i64,
    ) -> QueueResult<bool> {
        let payload = serde_json::to_string(entry)?;
        let applied: i64 = script
            .key(self.config.entry_key(&entry.entry_id))
            .key(from_index)
            .key(to_index)
            .arg(&entry.entry_id)
            .arg(payload)
            .arg(score_or_ttl)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(applied == 1)
    }

    /// Load entries by id, dropping ids whose payload is gone or malformed.
    async fn load_many(&mut self, ids: Vec<String>, index_key: &str) -> QueueResult<Vec<QueueEntry>> {
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {
                    warn!("Queue index {} references missing entry {}", index_key, id);
                    self.conn.zrem::<_, _, ()>(index_key, &id).await?;
                }
                Err(QueueError::Json(e)) => {
                    warn!("Dropping malformed queue entry {}: {}", id, e);
                    self.conn.zrem::<_, _, ()>(index_key, &id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    async fn finish(&mut self, mut entry: QueueEntry) -> QueueResult<()> {
        entry.heartbeat_at = None;
        let ttl = self.config.finished_ttl.as_secs().max(1) as i64;
        let scripts = Arc::clone(&self.scripts);
        self.transition(
            &scripts.finish,
            &entry,
            &self.config.dispatched_key(),
            &self.config.pending_key(),
            ttl,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueSession for RedisSession {
    async fn enqueue(&mut self, request: GenerationRequest) -> QueueResult<QueueEntry> {
        let entry = QueueEntry::new(request);
        let scripts = Arc::clone(&self.scripts);
        self.transition(
            &scripts.insert,
            &entry,
            &self.config.dispatched_key(),
            &self.config.pending_key(),
            score(entry.available_at),
        )
        .await?;
        info!("Enqueued generation request {}", entry.entry_id);
        Ok(entry)
    }

    async fn get(&mut self, entry_id: &str) -> QueueResult<Option<QueueEntry>> {
        self.load(entry_id).await
    }

    async fn fetch_pending(&mut self, limit: usize) -> QueueResult<Vec<QueueEntry>> {
        let pending_key = self.config.pending_key();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&pending_key)
            .arg("-inf")
            .arg(score(Utc::now()))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn)
            .await?;

        let mut entries = self.load_many(ids, &pending_key).await?;
        entries.retain(QueueEntry::is_pending);
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    async fn mark_dispatched(&mut self, entry_id: &str, job_id: &JobId) -> QueueResult<bool> {
        let Some(mut entry) = self.load(entry_id).await? else {
            return Ok(false);
        };
        if !entry.is_pending() {
            debug!("Entry {} is {}, not claiming", entry_id, entry.status.as_str());
            return Ok(false);
        }

        entry.dispatch(job_id);
        let scripts = Arc::clone(&self.scripts);
        let claimed = self
            .transition(
                &scripts.claim,
                &entry,
                &self.config.pending_key(),
                &self.config.dispatched_key(),
                score(Utc::now()),
            )
            .await?;
        if !claimed {
            debug!("Entry {} already claimed", entry_id);
        }
        Ok(claimed)
    }

    async fn heartbeat(&mut self, entry_id: &str) -> QueueResult<()> {
        let mut entry = self.load_existing(entry_id).await?;
        if entry.status != EntryStatus::Dispatched {
            return Ok(());
        }
        let now = Utc::now();
        entry.heartbeat_at = Some(now);
        let scripts = Arc::clone(&self.scripts);
        if !self
            .transition(
                &scripts.heartbeat,
                &entry,
                &self.config.pending_key(),
                &self.config.dispatched_key(),
                score(now),
            )
            .await?
        {
            debug!("Entry {} left the dispatched set, heartbeat skipped", entry_id);
        }
        Ok(())
    }

    async fn mark_completed(&mut self, entry_id: &str) -> QueueResult<()> {
        let mut entry = self.load_existing(entry_id).await?;
        entry.finish(EntryStatus::Completed, None);
        self.finish(entry).await
    }

    async fn mark_failed(&mut self, entry_id: &str, error: &str) -> QueueResult<()> {
        let mut entry = self.load_existing(entry_id).await?;
        entry.finish(EntryStatus::Failed, Some(error.to_string()));
        self.finish(entry).await
    }

    async fn requeue(&mut self, entry_id: &str, error: &str, delay: Duration) -> QueueResult<()> {
        let mut entry = self.load_existing(entry_id).await?;
        entry.requeue(error, after(delay));
        let scripts = Arc::clone(&self.scripts);
        if !self
            .transition(
                &scripts.requeue,
                &entry,
                &self.config.dispatched_key(),
                &self.config.pending_key(),
                score(entry.available_at),
            )
            .await?
        {
            debug!("Entry {} no longer dispatched, requeue skipped", entry_id);
        }
        Ok(())
    }

    async fn stale_dispatched(&mut self, cutoff: DateTime<Utc>) -> QueueResult<Vec<QueueEntry>> {
        let dispatched_key = self.config.dispatched_key();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&dispatched_key)
            .arg("-inf")
            .arg(format!("({}", score(cutoff)))
            .query_async(&mut self.conn)
            .await?;
        self.load_many(ids, &dispatched_key).await
    }
}
