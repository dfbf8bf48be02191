//! Decay-based forgetting and cap enforcement.
//!
//! Strength comes from [`Episode::strength`]; this module only decides which
//! rows fall below the line and deletes them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use memory_core::{Episode, EpisodeFilter, MemoryConfig, MemoryStore, Result};

pub struct Forgetter {
    store: Arc<dyn MemoryStore>,
    config: MemoryConfig,
}

impl Forgetter {
    pub fn new(store: Arc<dyn MemoryStore>, config: MemoryConfig) -> Self {
        Self { store, config }
    }

    /// Deletes episodes whose strength fell below the threshold and facts
    /// below half the threshold. Idempotent: a second run removes nothing.
    pub async fn run_forget(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let episodes = self
            .store
            .list_episodes(user_id, &EpisodeFilter::default())
            .await?;

        let weak: Vec<_> = episodes
            .iter()
            .filter(|e| e.strength(now, &self.config) < self.config.min_importance_threshold)
            .map(|e| e.id)
            .collect();
        let removed_episodes = self.store.delete_episodes(&weak).await?;

        let removed_facts = self
            .store
            .delete_facts_below(user_id, self.config.min_importance_threshold / 2.0)
            .await?;

        let removed = removed_episodes + removed_facts;
        if removed > 0 {
            info!(
                user_id = user_id,
                episodes = removed_episodes,
                facts = removed_facts,
                "forgot weak memories"
            );
        }
        Ok(removed)
    }

    /// Trims per-user stores back to their caps: lowest-strength episodes and
    /// lowest-confidence facts (oldest sighting as tie-break) go first.
    /// Fixed point: a second call right after removes nothing.
    pub async fn enforce_caps(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;

        let episode_count = self.store.count_episodes(user_id).await? as usize;
        if episode_count > self.config.max_episodes_per_user {
            let mut episodes: Vec<Episode> = self
                .store
                .list_episodes(user_id, &EpisodeFilter::default())
                .await?;
            episodes.sort_by(|a, b| {
                a.strength(now, &self.config)
                    .partial_cmp(&b.strength(now, &self.config))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let excess = episode_count - self.config.max_episodes_per_user;
            let victims: Vec<_> = episodes.iter().take(excess).map(|e| e.id).collect();
            removed += self.store.delete_episodes(&victims).await?;
        }

        let fact_count = self.store.count_facts(user_id).await? as usize;
        if fact_count > self.config.max_facts_per_user {
            let mut facts = self.store.list_facts(user_id, None).await?;
            facts.sort_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.last_seen_at.cmp(&b.last_seen_at))
            });
            let excess = fact_count - self.config.max_facts_per_user;
            let victims: Vec<_> = facts.iter().take(excess).map(|f| f.id).collect();
            removed += self.store.delete_facts(&victims).await?;
        }

        if removed > 0 {
            info!(user_id = user_id, removed = removed, "enforced per-user caps");
        }
        Ok(removed)
    }
}
