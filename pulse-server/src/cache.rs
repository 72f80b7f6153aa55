//! Best-effort key/value cache
//!
//! Nothing here ever fails: an unavailable backend makes reads miss and writes no-ops, so
//! callers can treat the cache purely as an optimization.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

/// Upper bound on the time a single backend call may take before it counts as failed
const OPERATION_TIMEOUT: Duration = Duration::from_secs(1);

pub mod keys {
    use pulse_api::{CommentId, SortBy};

    /// Matches every comment list page, whatever its parameters
    pub const LIST_PATTERN: &str = "comments:list:*";

    pub fn comment_list(page: u64, limit: u64, sort_by: SortBy, max_depth: u32) -> String {
        format!("comments:list:{page}:{limit}:{sort_by}:{max_depth}")
    }

    pub fn comment_details(id: CommentId, max_depth: u32) -> String {
        format!("comments:details:{id}:{max_depth}")
    }

    /// Matches every cached tree rooted at `id`, which includes its replies
    pub fn comment_details_pattern(id: CommentId) -> String {
        format!("comments:details:{id}:*")
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
    async fn del_pattern(&self, pattern: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Cache(Arc<dyn CacheBackend>);

impl Cache {
    pub fn new(backend: impl 'static + CacheBackend) -> Cache {
        Cache(Arc::new(backend))
    }

    pub fn noop() -> Cache {
        Cache::new(NoopCache)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = match bounded(self.0.get(key)).await {
            Ok(Some(json)) => json,
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                return None;
            }
            Err(err) => {
                tracing::warn!(?err, key, "cache get failed, treating as a miss");
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(v) => {
                tracing::debug!(key, "cache hit");
                Some(v)
            }
            Err(err) => {
                tracing::warn!(?err, key, "cached value does not parse, treating as a miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(?err, key, "failed serializing value to cache");
                return;
            }
        };
        if let Err(err) = bounded(self.0.set(key, json, ttl)).await {
            tracing::warn!(?err, key, "cache set failed");
        }
    }

    pub async fn del(&self, key: &str) {
        if let Err(err) = bounded(self.0.del(key)).await {
            tracing::warn!(?err, key, "cache del failed");
        }
    }

    pub async fn del_pattern(&self, pattern: &str) {
        if let Err(err) = bounded(self.0.del_pattern(pattern)).await {
            tracing::warn!(?err, pattern, "cache pattern deletion failed");
        }
    }
}

async fn bounded<T>(f: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    tokio::time::timeout(OPERATION_TIMEOUT, f)
        .await
        .context("cache operation timed out")?
}

/// Cache used when no real cache is reachable
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn del_pattern(&self, _pattern: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-process cache, for single-instance deployments without redis
pub struct MemoryCache(RwLock<HashMap<String, (String, Instant)>>);

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache(RwLock::new(HashMap::new()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(match self.0.read().await.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut map = self.0.write().await;
        map.retain(|_, (_, expires)| *expires > now);
        map.insert(String::from(key), (value, now + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.0.write().await.remove(key);
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> anyhow::Result<()> {
        self.0
            .write()
            .await
            .retain(|key, _| !glob_match(pattern.as_bytes(), key.as_bytes()));
        Ok(())
    }
}

/// Redis-style glob matching, supporting `*` and `?`
fn glob_match(pattern: &[u8], s: &[u8]) -> bool {
    match (pattern.first(), s.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], s) || (!s.is_empty() && glob_match(pattern, &s[1..]))
        }
        (Some(_), None) => false,
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &s[1..]),
        (Some(p), Some(c)) => p == c && glob_match(&pattern[1..], &s[1..]),
    }
}

pub struct RedisCache(redis::aio::ConnectionManager);

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<RedisCache> {
        let client = redis::Client::open(url).context("parsing redis url")?;
        let conn = bounded(async {
            client
                .get_tokio_connection_manager()
                .await
                .context("connecting to redis")
        })
        .await?;
        Ok(RedisCache(conn))
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.0.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .with_context(|| format!("redis GET {key}"))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.0.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .with_context(|| format!("redis SET {key}"))
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.0.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .with_context(|| format!("redis DEL {key}"))
    }

    async fn del_pattern(&self, pattern: &str) -> anyhow::Result<()> {
        // SCAN rather than KEYS, to not block the server on large keyspaces
        let mut conn = self.0.clone();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await
                .with_context(|| format!("redis SCAN {pattern}"))?;
            if !keys.is_empty() {
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .with_context(|| format!("redis DEL of keys matching {pattern}"))?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use pulse_api::{CommentId, SortBy, Uuid};

    /// Backend failing every call, as an unreachable cache would
    pub struct BrokenCache;

    #[async_trait]
    impl CacheBackend for BrokenCache {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("cache is down"))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("cache is down"))
        }

        async fn del(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("cache is down"))
        }

        async fn del_pattern(&self, _pattern: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("cache is down"))
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn globs() {
        assert!(glob_match(b"comments:list:*", b"comments:list:1:10:newest:3"));
        assert!(glob_match(b"comments:list:*", b"comments:list:"));
        assert!(!glob_match(b"comments:list:*", b"comments:details:1"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(!glob_match(b"a?c", b"ac"));
        assert!(glob_match(b"*:3", b"x:y:3"));
    }

    #[test]
    fn keys_of_all_list_variants_match_the_list_pattern() {
        for sort in [
            SortBy::Newest,
            SortBy::Oldest,
            SortBy::MostLiked,
            SortBy::MostDisliked,
        ] {
            let key = keys::comment_list(2, 25, sort, 3);
            assert!(glob_match(keys::LIST_PATTERN.as_bytes(), key.as_bytes()));
        }
        let id = CommentId(Uuid::new_v4());
        let other = CommentId(Uuid::new_v4());
        let pattern = keys::comment_details_pattern(id);
        assert!(glob_match(
            pattern.as_bytes(),
            keys::comment_details(id, 0).as_bytes()
        ));
        assert!(!glob_match(
            pattern.as_bytes(),
            keys::comment_details(other, 0).as_bytes()
        ));
    }

    #[tokio::test]
    async fn memory_cache_roundtrip_and_invalidation() {
        let cache = Cache::new(MemoryCache::new());
        cache.set("comments:list:1", &vec![1, 2, 3], TTL).await;
        cache.set("comments:list:2", &vec![4], TTL).await;
        cache.set("comments:details:x:3", &5, TTL).await;
        assert_eq!(cache.get::<Vec<u32>>("comments:list:1").await, Some(vec![1, 2, 3]));

        cache.del_pattern(keys::LIST_PATTERN).await;
        assert_eq!(cache.get::<Vec<u32>>("comments:list:1").await, None);
        assert_eq!(cache.get::<Vec<u32>>("comments:list:2").await, None);
        assert_eq!(cache.get::<u32>("comments:details:x:3").await, Some(5));
    }

    #[tokio::test]
    async fn invalidating_twice_is_harmless() {
        let cache = Cache::new(MemoryCache::new());
        cache.set("k", &1, TTL).await;
        cache.del("k").await;
        cache.del("k").await;
        assert_eq!(cache.get::<u32>("k").await, None);
        cache.del_pattern("k*").await;
        cache.del_pattern("k*").await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = Cache::new(MemoryCache::new());
        cache.set("k", &1, Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn unavailable_cache_degrades_to_pass_through() {
        for cache in [Cache::noop(), Cache::new(BrokenCache)] {
            cache.set("k", &1, TTL).await;
            assert_eq!(cache.get::<u32>("k").await, None);
            cache.del("k").await;
            cache.del_pattern("*").await;
        }
    }

    #[tokio::test]
    async fn undecodable_entries_are_misses() {
        let cache = Cache::new(MemoryCache::new());
        cache.set("k", &"not a number", TTL).await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }
}
