//! Advisory cache of recommendation lists
//!
//! Entries expire after a TTL and are dropped whenever the tracker reports a
//! material preference change for the user. A miss only costs a recompute.

use crate::config::RecommenderConfig;
use crate::models::{ContentId, RecommendationSet, Strategy, UserId};
use moka::future::Cache;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: UserId,
    pub strategy: Strategy,
    pub limit: usize,
    /// Sorted and deduplicated
    pub exclude_ids: Vec<ContentId>,
}

impl CacheKey {
    pub fn new(
        user_id: UserId,
        strategy: Strategy,
        limit: usize,
        exclude_ids: &[ContentId],
    ) -> Self {
        let mut exclude_ids = exclude_ids.to_vec();
        exclude_ids.sort_unstable();
        exclude_ids.dedup();
        Self {
            user_id,
            strategy,
            limit,
            exclude_ids,
        }
    }
}

/// Bounded TTL cache keyed by request shape
pub struct RecommendationCache {
    entries: Cache<CacheKey, RecommendationSet>,
}

impl RecommendationCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cache sized from the recommender settings, or `None` when the TTL is 0
    pub fn from_config(config: &RecommenderConfig) -> Option<Self> {
        if config.cache_ttl_seconds == 0 {
            tracing::debug!("Recommendation cache disabled");
            return None;
        }
        Some(Self::new(
            Duration::from_secs(config.cache_ttl_seconds),
            config.cache_max_entries,
        ))
    }

    /// A live entry for the key, if any
    pub async fn get(&self, key: &CacheKey) -> Option<RecommendationSet> {
        self.entries.get(key).await
    }

    pub async fn put(&self, key: CacheKey, set: RecommendationSet) {
        self.entries.insert(key, set).await;
    }

    /// Drop every cached list of one user, returning how many were removed
    pub async fn invalidate_user(&self, user_id: UserId) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.entries.invalidate(key.as_ref()).await;
        }
        if !keys.is_empty() {
            tracing::debug!(
                "Dropped {} cached recommendation lists for user {}",
                keys.len(),
                user_id
            );
        }
        keys.len()
    }

    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for RecommendationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationCache")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}
