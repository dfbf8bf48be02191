//! Retrieval cache keyed by `(user_id, query_hash)` with TTL.
//!
//! Invalidated for a user on session end and maintenance; disabled entirely
//! by `enable_cache = false`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use memory_core::{Episode, Fact, UserProfile};

/// Retrieved state for one query, cached between retrievals.
#[derive(Clone)]
pub(crate) struct RetrievedBundle {
    pub profile: Option<UserProfile>,
    pub facts: Vec<Fact>,
    pub episodes: Vec<Episode>,
}

struct CacheEntry {
    bundle: RetrievedBundle,
    created_at: Instant,
}

pub(crate) struct RetrievalCache {
    enabled: bool,
    ttl: Duration,
    entries: RwLock<HashMap<(String, u64), CacheEntry>>,
}

impl RetrievalCache {
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn query_hash(query: Option<&str>) -> u64 {
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        hasher.finish()
    }

    pub async fn get(&self, user_id: &str, query_hash: u64) -> Option<RetrievedBundle> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.read().await;
        entries
            .get(&(user_id.to_string(), query_hash))
            .filter(|entry| entry.created_at.elapsed() <= self.ttl)
            .map(|entry| entry.bundle.clone())
    }

    pub async fn put(&self, user_id: &str, query_hash: u64, bundle: RetrievedBundle) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.insert(
            (user_id.to_string(), query_hash),
            CacheEntry {
                bundle,
                created_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.retain(|(uid, _), _| uid != user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> RetrievedBundle {
        RetrievedBundle {
            profile: None,
            facts: Vec::new(),
            episodes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let cache = RetrievalCache::new(false, Duration::from_secs(60));
        let hash = RetrievalCache::query_hash(Some("恐龙"));
        cache.put("u1", hash, bundle()).await;
        assert!(cache.get("u1", hash).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_is_per_user() {
        let cache = RetrievalCache::new(true, Duration::from_secs(60));
        let hash = RetrievalCache::query_hash(None);
        cache.put("u1", hash, bundle()).await;
        cache.put("u2", hash, bundle()).await;

        cache.invalidate_user("u1").await;
        assert!(cache.get("u1", hash).await.is_none());
        assert!(cache.get("u2", hash).await.is_some());
    }
}
