//! # Core Types
//!
//! This module defines the persisted and transient types of the memory system.
//!
//! ## Tiers
//!
//! - Working memory: [`Message`] sequences held in RAM for an active session
//! - Episodic memory: [`Episode`] summaries of ended sessions
//! - Semantic memory: [`Fact`] triples and the [`UserProfile`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MemoryConfig;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    /// Stable storage name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// A single conversation message. Immutable once added to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Monotonically increasing per-session sequence number.
    pub seq: u64,
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata of a session. The live ring buffer is owned by the manager;
/// this record is what gets persisted and returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Closed emotion tag set for episodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Scared,
    Curious,
    Neutral,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Scared => "scared",
            Emotion::Curious => "curious",
            Emotion::Neutral => "neutral",
        }
    }

    /// Maps a free-form label (English tag or the Chinese labels the LLM may
    /// echo back) onto the closed set. Unknown labels collapse to `Neutral`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "happy" | "开心" | "高兴" | "快乐" => Emotion::Happy,
            "sad" | "难过" | "伤心" => Emotion::Sad,
            "angry" | "生气" => Emotion::Angry,
            "scared" | "害怕" => Emotion::Scared,
            "curious" | "好奇" => Emotion::Curious,
            _ => Emotion::Neutral,
        }
    }
}

/// Episodic memory: the structured summary of one ended session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub user_id: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub emotion: Emotion,
    /// Importance score in `[0, 1]`.
    pub importance: f32,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Session this episode was compressed from.
    pub source_session_id: Uuid,
    /// Optional vector representation used by the vector retrieval mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Episode {
    /// Memory strength in `[0, importance]`, combining time decay and access
    /// frequency. Pure function of the stored fields and `now`.
    pub fn strength(&self, now: DateTime<Utc>, config: &MemoryConfig) -> f32 {
        let days_since = (now - self.last_accessed_at).num_seconds() as f32 / 86_400.0;
        let time_factor = (1.0 - days_since / config.memory_decay_days as f32).max(0.0);
        let access_factor = (self.access_count as f32 / 10.0).min(1.0);
        self.importance
            * (config.time_decay_weight * time_factor + config.access_count_weight * access_factor)
    }
}

/// Semantic memory: a subject-predicate-object triple about one user.
///
/// `(user_id, subject, predicate, object)` is unique; re-extraction coalesces
/// to the maximum confidence and refreshes `last_seen_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub user_id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Fact {
    /// Renders the triple as one line for the system prompt.
    pub fn to_natural_language(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// Per-user identity and interest record.
///
/// `tags` is ordered by insertion recency; re-adding an existing tag moves it
/// to the most-recent position instead of duplicating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            name: None,
            age: None,
            gender: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds a tag, coalescing duplicates to the most-recent position and
    /// dropping the oldest tags above `max_tags`.
    pub fn add_tag(&mut self, tag: &str, max_tags: usize) {
        if let Some(pos) = self.tags.iter().position(|t| t == tag) {
            self.tags.remove(pos);
        }
        self.tags.push(tag.to_string());
        while self.tags.len() > max_tags {
            self.tags.remove(0);
        }
    }

    /// Re-applies the tag cap after a bulk replace (e.g. a profile PUT).
    pub fn enforce_tag_cap(&mut self, max_tags: usize) {
        while self.tags.len() > max_tags {
            self.tags.remove(0);
        }
    }
}

/// Profile fields discovered during extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub add_tags: Vec<String>,
}

impl ProfileDelta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.age.is_none() && self.gender.is_none() && self.add_tags.is_empty()
    }

    /// Applies the delta onto a profile and stamps `updated_at`.
    pub fn apply(&self, profile: &mut UserProfile, max_tags: usize, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            profile.name = Some(name.clone());
        }
        if let Some(age) = self.age {
            profile.age = Some(age);
        }
        if let Some(gender) = &self.gender {
            profile.gender = Some(gender.clone());
        }
        for tag in &self.add_tags {
            profile.add_tag(tag, max_tags);
        }
        profile.updated_at = now;
    }
}

/// A candidate fact produced by extraction, before storage assigns identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactCandidate {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
}

/// Result of distilling a message sequence. Pure data; committing it to
/// storage is the manager's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub summary: String,
    pub keywords: Vec<String>,
    pub emotion: Emotion,
    pub importance: f32,
    pub facts: Vec<FactCandidate>,
    pub profile_delta: ProfileDelta,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> MemoryConfig {
        MemoryConfig::default()
    }

    #[test]
    fn strength_is_bounded_by_importance() {
        let now = Utc::now();
        let ep = Episode {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            summary: "聊了恐龙".into(),
            keywords: vec!["恐龙".into()],
            emotion: Emotion::Happy,
            importance: 0.8,
            access_count: 5,
            created_at: now,
            last_accessed_at: now,
            source_session_id: Uuid::new_v4(),
            embedding: None,
        };
        let s = ep.strength(now, &config());
        assert!(s > 0.5 && s <= 0.8);
    }

    #[test]
    fn strength_decays_to_zero_past_decay_window() {
        let now = Utc::now();
        let ep = Episode {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            summary: "old".into(),
            keywords: vec!["old".into()],
            emotion: Emotion::Neutral,
            importance: 0.3,
            access_count: 0,
            created_at: now - Duration::days(40),
            last_accessed_at: now - Duration::days(40),
            source_session_id: Uuid::new_v4(),
            embedding: None,
        };
        assert_eq!(ep.strength(now, &config()), 0.0);
    }

    #[test]
    fn add_tag_coalesces_and_caps() {
        let now = Utc::now();
        let mut profile = UserProfile::new("u1", now);
        profile.add_tag("喜欢恐龙", 3);
        profile.add_tag("5岁", 3);
        profile.add_tag("喜欢恐龙", 3);
        assert_eq!(profile.tags, vec!["5岁".to_string(), "喜欢恐龙".to_string()]);

        profile.add_tag("a", 3);
        profile.add_tag("b", 3);
        assert_eq!(profile.tags.len(), 3);
        assert!(!profile.tags.contains(&"5岁".to_string()));
    }

    #[test]
    fn emotion_labels_map_to_closed_set() {
        assert_eq!(Emotion::from_label("开心"), Emotion::Happy);
        assert_eq!(Emotion::from_label("scared"), Emotion::Scared);
        assert_eq!(Emotion::from_label("whatever"), Emotion::Neutral);
    }

    #[test]
    fn fact_natural_language() {
        let now = Utc::now();
        let fact = Fact {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            subject: "小明".into(),
            predicate: "喜欢".into(),
            object: "恐龙".into(),
            confidence: 0.8,
            created_at: now,
            last_seen_at: now,
        };
        assert_eq!(fact.to_natural_language(), "小明 喜欢 恐龙");
    }
}
