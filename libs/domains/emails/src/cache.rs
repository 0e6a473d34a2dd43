//! Read-through cache for point lookups.
//!
//! The cache is never the source of truth. Backend failures are logged and
//! read as misses so the request path never fails because of the cache.
//!
//! Every entry has an invalidation counter next to it. A miss reports the
//! counter it saw and the populate that follows only lands if the counter is
//! unchanged, so a snapshot read before a status transition can never be
//! written back after that transition's invalidation.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::metrics;
use crate::models::EmailRecord;

const KEY_PREFIX: &str = "emails";

/// Invalidation counters outlive any single read by a wide margin.
const VERSION_TTL_SECS: u64 = 3600;

pub fn cache_key(id: Uuid) -> String {
    format!("{}:{}", KEY_PREFIX, id)
}

pub fn version_key(id: Uuid) -> String {
    format!("{}:{}:version", KEY_PREFIX, id)
}

/// Invalidation counter observed on a miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheVersion {
    Seen(u64),
    /// The backend could not be read; the populate is skipped.
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Hit(EmailRecord),
    Miss(CacheVersion),
}

impl CacheLookup {
    pub fn hit(self) -> Option<EmailRecord> {
        match self {
            CacheLookup::Hit(record) => Some(record),
            CacheLookup::Miss(_) => None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailCache: Send + Sync {
    async fn get(&self, id: Uuid) -> CacheLookup;

    /// Store `record` unless its id was invalidated after `version` was read.
    async fn set(&self, record: &EmailRecord, version: CacheVersion, ttl: Duration);

    /// Drop the entry and bump its invalidation counter.
    async fn invalidate(&self, id: Uuid);
}

/// Redis-backed cache storing JSON snapshots under `emails:<id>` and the
/// invalidation counter under `emails:<id>:version`.
#[derive(Clone)]
pub struct RedisEmailCache {
    redis: ConnectionManager,
    op_timeout: Duration,
}

impl RedisEmailCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            op_timeout: Duration::from_millis(250),
        }
    }

    /// Bound every cache call.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }
}

#[async_trait]
impl EmailCache for RedisEmailCache {
    async fn get(&self, id: Uuid) -> CacheLookup {
        let mut conn = self.redis.clone();
        let key = cache_key(id);
        let version_key = version_key(id);

        let (raw, version) = match tokio::time::timeout(
            self.op_timeout,
            conn.mget::<_, (Option<String>, Option<u64>)>(&[&key, &version_key]),
        )
        .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(email_id = %id, error = %e, "Cache read failed");
                metrics::cache_error("get");
                return CacheLookup::Miss(CacheVersion::Unknown);
            }
            Err(_) => {
                tracing::warn!(email_id = %id, "Cache read timed out");
                metrics::cache_error("get");
                return CacheLookup::Miss(CacheVersion::Unknown);
            }
        };

        let Some(raw) = raw else {
            return CacheLookup::Miss(CacheVersion::Seen(version.unwrap_or(0)));
        };

        match serde_json::from_str(&raw) {
            Ok(record) => CacheLookup::Hit(record),
            Err(e) => {
                tracing::warn!(email_id = %id, error = %e, "Discarding undecodable cache entry");
                metrics::cache_error("decode");
                self.invalidate(id).await;
                CacheLookup::Miss(CacheVersion::Unknown)
            }
        }
    }

    async fn set(&self, record: &EmailRecord, version: CacheVersion, ttl: Duration) {
        let CacheVersion::Seen(version) = version else {
            return;
        };

        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(email_id = %record.id, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        let mut conn = self.redis.clone();
        let key = cache_key(record.id);
        let version_key = version_key(record.id);
        let seconds = ttl.as_secs().max(1);

        let script = redis::Script::new(
            r"
            local current = redis.call('get', KEYS[2]) or '0'
            if current == ARGV[1] then
                redis.call('set', KEYS[1], ARGV[2], 'EX', ARGV[3])
                return 1
            else
                return 0
            end
            ",
        );
        let populate = async {
            let stored: i32 = script
                .key(&key)
                .key(&version_key)
                .arg(version.to_string())
                .arg(value)
                .arg(seconds)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(stored == 1)
        };

        match tokio::time::timeout(self.op_timeout, populate).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                tracing::debug!(email_id = %record.id, "Entry invalidated during read, not cached");
            }
            Ok(Err(e)) => {
                tracing::warn!(email_id = %record.id, error = %e, "Cache write failed");
                metrics::cache_error("set");
            }
            Err(_) => {
                tracing::warn!(email_id = %record.id, "Cache write timed out");
                metrics::cache_error("set");
            }
        }
    }

    async fn invalidate(&self, id: Uuid) {
        let mut conn = self.redis.clone();
        let key = cache_key(id);
        let version_key = version_key(id);

        let script = redis::Script::new(
            r"
            redis.call('incr', KEYS[2])
            redis.call('expire', KEYS[2], ARGV[1])
            redis.call('del', KEYS[1])
            return 1
            ",
        );
        let invalidate = async {
            let _: i32 = script
                .key(&key)
                .key(&version_key)
                .arg(VERSION_TTL_SECS)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(())
        };

        match tokio::time::timeout(self.op_timeout, invalidate).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The entry expires on its own after the TTL.
                tracing::warn!(email_id = %id, error = %e, "Cache invalidation failed");
                metrics::cache_error("invalidate");
            }
            Err(_) => {
                tracing::warn!(email_id = %id, "Cache invalidation timed out");
                metrics::cache_error("invalidate");
            }
        }
    }
}

#[derive(Default)]
struct Entries {
    records: HashMap<Uuid, (EmailRecord, Instant)>,
    versions: HashMap<Uuid, u64>,
}

/// Process-local cache honouring TTLs; for tests and single-instance runs.
#[derive(Clone, Default)]
pub struct InMemoryEmailCache {
    entries: Arc<RwLock<Entries>>,
}

impl InMemoryEmailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.get(id).await.hit().is_some()
    }
}

#[async_trait]
impl EmailCache for InMemoryEmailCache {
    async fn get(&self, id: Uuid) -> CacheLookup {
        let entries = self.entries.read().await;
        match entries.records.get(&id) {
            Some((record, expires_at)) if Instant::now() < *expires_at => {
                CacheLookup::Hit(record.clone())
            }
            _ => CacheLookup::Miss(CacheVersion::Seen(
                entries.versions.get(&id).copied().unwrap_or(0),
            )),
        }
    }

    async fn set(&self, record: &EmailRecord, version: CacheVersion, ttl: Duration) {
        let mut entries = self.entries.write().await;
        let current = entries.versions.get(&record.id).copied().unwrap_or(0);
        if version == CacheVersion::Seen(current) {
            entries
                .records
                .insert(record.id, (record.clone(), Instant::now() + ttl));
        }
    }

    async fn invalidate(&self, id: Uuid) {
        let mut entries = self.entries.write().await;
        entries.records.remove(&id);
        *entries.versions.entry(id).or_insert(0) += 1;
    }
}

/// Cache disabled: every lookup misses.
#[derive(Clone, Copy, Default)]
pub struct NoopEmailCache;

#[async_trait]
impl EmailCache for NoopEmailCache {
    async fn get(&self, _id: Uuid) -> CacheLookup {
        CacheLookup::Miss(CacheVersion::Unknown)
    }

    async fn set(&self, _record: &EmailRecord, _version: CacheVersion, _ttl: Duration) {}

    async fn invalidate(&self, _id: Uuid) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateEmail;

    fn record() -> EmailRecord {
        EmailRecord::new(CreateEmail {
            from: "ops@example.com".to_string(),
            to: vec!["a@b.com".to_string()],
            subject: "hi".to_string(),
            body: String::new(),
        })
    }

    #[test]
    fn test_cache_keys() {
        let id = Uuid::nil();
        assert_eq!(cache_key(id), "emails:00000000-0000-0000-0000-000000000000");
        assert_eq!(
            version_key(id),
            "emails:00000000-0000-0000-0000-000000000000:version"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_entry_expires() {
        let cache = InMemoryEmailCache::new();
        let record = record();

        cache
            .set(&record, CacheVersion::Seen(0), Duration::from_secs(10))
            .await;
        assert_eq!(cache.get(record.id).await, CacheLookup::Hit(record.clone()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            cache.get(record.id).await,
            CacheLookup::Miss(CacheVersion::Seen(0))
        );
    }

    #[tokio::test]
    async fn test_in_memory_invalidate_bumps_version() {
        let cache = InMemoryEmailCache::new();
        let record = record();

        cache
            .set(&record, CacheVersion::Seen(0), Duration::from_secs(60))
            .await;
        cache.invalidate(record.id).await;

        assert!(!cache.contains(record.id).await);
        assert_eq!(
            cache.get(record.id).await,
            CacheLookup::Miss(CacheVersion::Seen(1))
        );
    }

    #[tokio::test]
    async fn test_in_memory_populate_after_invalidation_is_dropped() {
        let cache = InMemoryEmailCache::new();
        let record = record();

        let CacheLookup::Miss(seen) = cache.get(record.id).await else {
            panic!("expected a miss");
        };
        cache.invalidate(record.id).await;
        cache.set(&record, seen, Duration::from_secs(60)).await;

        assert!(!cache.contains(record.id).await);
    }

    #[tokio::test]
    async fn test_noop_always_misses() {
        let cache = NoopEmailCache;
        let record = record();

        cache
            .set(&record, CacheVersion::Seen(0), Duration::from_secs(60))
            .await;
        assert_eq!(
            cache.get(record.id).await,
            CacheLookup::Miss(CacheVersion::Unknown)
        );
    }
}
