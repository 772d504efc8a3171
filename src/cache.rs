//! Preview memoization, keyed by model/query/token-cap hash. Any backend
//! failure degrades silently to a cache miss — the race must never fail
//! because the cache is unavailable.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::query::ModelId;

/// Stable content-addressed key for a preview.
pub fn cache_key(model: &ModelId, query_text: &str, preview_token_cap: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(query_text.as_bytes());
    hasher.update(b"\x00");
    hasher.update(preview_token_cap.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait::async_trait]
pub trait PreviewCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, text: String, ttl: Duration);
}

struct Entry {
    text: String,
    expires_at: Instant,
}

/// In-process cache backed by a concurrent map; entries past their TTL are
/// treated as misses and lazily evicted on the next write.
pub struct LocalPreviewCache {
    entries: DashMap<String, Entry>,
}

impl LocalPreviewCache {
    pub fn new() -> Self {
        LocalPreviewCache { entries: DashMap::new() }
    }
}

impl Default for LocalPreviewCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PreviewCache for LocalPreviewCache {
    async fn get(&self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.text.clone()),
            _ => None,
        }
    }

    async fn put(&self, key: &str, text: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry { text, expires_at: Instant::now() + ttl },
        );
        self.entries.retain(|_, e| e.expires_at > Instant::now());
    }
}

/// Wraps a local cache and an optional remote backend. Writes go to both;
/// reads prefer the remote, falling back to local on remote failure or miss.
pub struct LayeredPreviewCache<R> {
    local: LocalPreviewCache,
    remote: Option<R>,
}

#[async_trait::async_trait]
pub trait RemotePreviewBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, text: &str, ttl: Duration);
}

impl<R: RemotePreviewBackend> LayeredPreviewCache<R> {
    pub fn new(remote: Option<R>) -> Self {
        LayeredPreviewCache { local: LocalPreviewCache::new(), remote }
    }
}

#[async_trait::async_trait]
impl<R: RemotePreviewBackend> PreviewCache for LayeredPreviewCache<R> {
    async fn get(&self, key: &str) -> Option<String> {
        if let Some(remote) = &self.remote {
            if let Some(text) = remote.get(key).await {
                return Some(text);
            }
        }
        self.local.get(key).await
    }

    async fn put(&self, key: &str, text: String, ttl: Duration) {
        if let Some(remote) = &self.remote {
            remote.set(key, &text, ttl).await;
        }
        self.local.put(key, text, ttl).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_deterministic_and_distinguishes_inputs() {
        let m = ModelId::new("gpt-x");
        let a = cache_key(&m, "hello", 128);
        let b = cache_key(&m, "hello", 128);
        let c = cache_key(&m, "hello", 256);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn local_cache_hit_then_expiry() {
        let cache = LocalPreviewCache::new();
        cache.put("k", "v".to_string(), Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let cache = LocalPreviewCache::new();
        assert_eq!(cache.get("nope").await, None);
    }
}
