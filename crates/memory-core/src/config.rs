//! Configuration record and presets.
//!
//! A single closed record flows down into every component; the presets are
//! constructors returning that record. API credentials come from the
//! environment (`LLM_API_KEY`, `LLM_BASE_URL`).

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// LLM provider selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Zhipu,
    Mock,
}

impl LlmProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "zhipu" => Some(LlmProvider::Zhipu),
            "mock" => Some(LlmProvider::Mock),
            _ => None,
        }
    }
}

/// Memory system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    // Storage
    pub data_dir: String,
    pub db_name: String,
    /// Persist raw messages for debugging. Off by default.
    pub debug_retain_messages: bool,

    // Working memory
    /// Sliding window size in turns; the ring buffer holds twice this many messages.
    pub working_memory_size: usize,

    // Episodic memory
    pub max_episodes_per_user: usize,
    pub episode_summary_max_length: usize,
    /// Minimum number of user turns before an ended session is compressed.
    pub episode_compress_threshold: usize,

    // Semantic memory
    pub max_profile_tags: usize,
    pub max_facts_per_user: usize,

    // Forgetting
    pub memory_decay_days: u32,
    pub min_importance_threshold: f32,
    pub access_count_weight: f32,
    pub time_decay_weight: f32,

    // LLM
    pub llm_provider: LlmProvider,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: String,
    /// Cheaper model used for memory extraction.
    pub extraction_model: String,
    pub llm_max_retries: u32,
    pub llm_timeout_secs: u64,

    // Vector retrieval
    pub enable_vector_search: bool,
    pub vector_dim: usize,
    pub similarity_threshold: f32,
    pub max_retrieval_results: usize,

    // Caching
    pub cache_ttl_secs: u64,
    pub enable_cache: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            db_name: "memory.db".to_string(),
            debug_retain_messages: false,
            working_memory_size: 10,
            max_episodes_per_user: 100,
            episode_summary_max_length: 200,
            episode_compress_threshold: 5,
            max_profile_tags: 20,
            max_facts_per_user: 50,
            memory_decay_days: 30,
            min_importance_threshold: 0.2,
            access_count_weight: 0.3,
            time_decay_weight: 0.7,
            llm_provider: LlmProvider::OpenAi,
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_base_url: env::var("LLM_BASE_URL").ok(),
            llm_model: "gpt-4o-mini".to_string(),
            extraction_model: "gpt-4o-mini".to_string(),
            llm_max_retries: 3,
            llm_timeout_secs: 30,
            enable_vector_search: false,
            vector_dim: 384,
            similarity_threshold: 0.7,
            max_retrieval_results: 5,
            cache_ttl_secs: 3600,
            enable_cache: true,
        }
    }
}

impl MemoryConfig {
    /// Full path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.db_name)
    }

    /// Validates the closed field set. Called once at startup; a failure here
    /// means the process refuses to serve.
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, v: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(MemoryError::Config(format!("{name} must be in [0, 1], got {v}")));
            }
            Ok(())
        }

        if self.working_memory_size == 0 {
            return Err(MemoryError::Config("working_memory_size must be >= 1".into()));
        }
        if self.episode_compress_threshold == 0 {
            return Err(MemoryError::Config("episode_compress_threshold must be >= 1".into()));
        }
        if self.memory_decay_days == 0 {
            return Err(MemoryError::Config("memory_decay_days must be >= 1".into()));
        }
        if self.max_retrieval_results == 0 {
            return Err(MemoryError::Config("max_retrieval_results must be >= 1".into()));
        }
        unit("min_importance_threshold", self.min_importance_threshold)?;
        unit("access_count_weight", self.access_count_weight)?;
        unit("time_decay_weight", self.time_decay_weight)?;
        unit("similarity_threshold", self.similarity_threshold)?;
        let weight_sum = self.access_count_weight + self.time_decay_weight;
        if (weight_sum - 1.0).abs() > 1e-3 {
            return Err(MemoryError::Config(format!(
                "time_decay_weight + access_count_weight must sum to 1, got {weight_sum}"
            )));
        }
        if self.llm_provider != LlmProvider::Mock && self.llm_api_key.is_none() {
            return Err(MemoryError::Config(
                "LLM_API_KEY is required unless llm_provider is mock".into(),
            ));
        }
        Ok(())
    }
}

/// Named configuration presets.
pub struct ConfigPresets;

impl ConfigPresets {
    /// Lowest cost: small caps, mock LLM, no vector search. Used in tests.
    pub fn minimal() -> MemoryConfig {
        MemoryConfig {
            working_memory_size: 5,
            max_episodes_per_user: 20,
            max_facts_per_user: 10,
            enable_vector_search: false,
            llm_provider: LlmProvider::Mock,
            ..MemoryConfig::default()
        }
    }

    /// Balance of quality and cost.
    pub fn balanced() -> MemoryConfig {
        MemoryConfig {
            working_memory_size: 10,
            max_episodes_per_user: 50,
            max_facts_per_user: 30,
            enable_vector_search: false,
            llm_provider: LlmProvider::OpenAi,
            llm_model: "gpt-4o-mini".to_string(),
            ..MemoryConfig::default()
        }
    }

    /// Best quality: larger caps, vector retrieval enabled.
    pub fn full_featured() -> MemoryConfig {
        MemoryConfig {
            working_memory_size: 15,
            max_episodes_per_user: 100,
            max_facts_per_user: 50,
            enable_vector_search: true,
            llm_provider: LlmProvider::OpenAi,
            llm_model: "gpt-4o".to_string(),
            ..MemoryConfig::default()
        }
    }

    pub fn by_name(name: &str) -> Option<MemoryConfig> {
        match name {
            "minimal" => Some(Self::minimal()),
            "balanced" => Some(Self::balanced()),
            "full_featured" => Some(Self::full_featured()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_mock_provider_validates() {
        let mut config = MemoryConfig::default();
        config.llm_provider = LlmProvider::Mock;
        config.llm_api_key = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = ConfigPresets::minimal();
        config.time_decay_weight = 0.5;
        assert!(matches!(config.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn presets_resolve_by_name() {
        assert!(ConfigPresets::by_name("minimal").is_some());
        assert!(ConfigPresets::by_name("balanced").is_some());
        assert!(ConfigPresets::by_name("full_featured").is_some());
        assert!(ConfigPresets::by_name("huge").is_none());
    }
}
