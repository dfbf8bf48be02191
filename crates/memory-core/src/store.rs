//! # Memory Storage
//!
//! This module defines the storage interface for persisted memory entities.
//!
//! The `MemoryStore` trait is implemented by storage backends (SQLite today;
//! the contract leaves room for others). Every operation is atomic: a failed
//! call leaves no partial write behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Episode, Fact, Message, SessionInfo, UserProfile};

/// Ordering for episode listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOrder {
    ByImportanceDesc,
    ByRecentDesc,
}

/// Filter for [`MemoryStore::list_episodes`].
#[derive(Debug, Clone)]
pub struct EpisodeFilter {
    /// Match episodes containing any of these keywords (in summary or keyword set).
    pub keywords_any: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub order: EpisodeOrder,
    pub limit: Option<u32>,
}

impl Default for EpisodeFilter {
    fn default() -> Self {
        Self {
            keywords_any: Vec::new(),
            since: None,
            until: None,
            order: EpisodeOrder::ByImportanceDesc,
            limit: None,
        }
    }
}

/// Trait for durable persistence of profiles, sessions, episodes and facts.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Inserts or fully replaces a profile. The tag cap is enforced before write.
    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()>;

    /// Returns the profile for a user, or `None` if absent.
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Inserts a new episode.
    async fn insert_episode(&self, episode: &Episode) -> Result<()>;

    /// Lists a user's episodes per the filter.
    async fn list_episodes(&self, user_id: &str, filter: &EpisodeFilter) -> Result<Vec<Episode>>;

    /// Bumps `access_count` and sets `last_accessed_at` on the given episodes.
    /// One transaction for the whole batch.
    async fn touch_episodes(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()>;

    /// Deletes the given episodes; returns how many rows were removed.
    async fn delete_episodes(&self, ids: &[Uuid]) -> Result<u64>;

    async fn count_episodes(&self, user_id: &str) -> Result<u64>;

    /// Inserts a fact, coalescing on `(user_id, subject, predicate, object)`:
    /// an existing row keeps `max(confidence)` and gets `last_seen_at` refreshed.
    async fn upsert_fact(&self, fact: &Fact) -> Result<()>;

    /// Lists a user's facts, optionally restricted to one subject,
    /// ordered by confidence then recency.
    async fn list_facts(&self, user_id: &str, subject: Option<&str>) -> Result<Vec<Fact>>;

    /// Deletes facts with confidence strictly below the threshold.
    async fn delete_facts_below(&self, user_id: &str, confidence: f32) -> Result<u64>;

    /// Deletes the given facts; returns how many rows were removed.
    async fn delete_facts(&self, ids: &[Uuid]) -> Result<u64>;

    async fn count_facts(&self, user_id: &str) -> Result<u64>;

    /// Records a newly started session.
    async fn record_session_start(&self, session: &SessionInfo) -> Result<()>;

    /// Marks a session as ended.
    async fn record_session_end(&self, session_id: Uuid, ended_at: DateTime<Utc>) -> Result<()>;

    /// Persists a raw message. Only called when debug retention is enabled.
    async fn persist_message(&self, session_id: Uuid, message: &Message) -> Result<()>;

    /// Commits one session-end extraction atomically: profile upsert, episode
    /// insert, fact upserts and per-user cap trims happen in one transaction.
    async fn commit_extraction(
        &self,
        user_id: &str,
        episode: &Episode,
        facts: &[Fact],
        profile: &UserProfile,
    ) -> Result<()>;

    /// Every user id that owns any persisted state. Used by the global
    /// maintenance sweep.
    async fn list_user_ids(&self) -> Result<Vec<String>>;
}
