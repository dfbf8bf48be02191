//! # memory-extract
//!
//! Turns a message sequence into structured memory: an episode summary,
//! keywords, emotion, importance, candidate facts and a profile delta.
//!
//! Two interchangeable variants implement [`MemoryExtractor`]:
//!
//! - [`LlmExtractor`] - one structured LLM call with validation and clipping
//! - [`RuleBasedExtractor`] - deterministic pattern matching, zero cost
//!
//! [`FallbackExtractor`] composes them: LLM first, rules when the LLM fails.
//! Both variants are pure; committing results to storage is the manager's job.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use llm_client::LlmClient;
use memory_core::{ExtractionResult, LlmProvider, MemoryConfig, MemoryError, Message, Result};

mod llm_extract;
mod rules;
pub mod tokenize;

pub use llm_extract::LlmExtractor;
pub use rules::RuleBasedExtractor;

/// Capability of distilling a conversation into an [`ExtractionResult`].
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    /// Variant name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Extracts structured memory from the message sequence. Pure: no side
    /// effects on storage.
    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult>;
}

/// LLM-first composition with an explicit rule-based fallback.
///
/// Extraction failures other than cancellation are logged and absorbed here;
/// the rule-based pass cannot fail, so session closure never blocks on the LLM.
pub struct FallbackExtractor {
    primary: LlmExtractor,
    fallback: RuleBasedExtractor,
}

impl FallbackExtractor {
    pub fn new(primary: LlmExtractor, fallback: RuleBasedExtractor) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl MemoryExtractor for FallbackExtractor {
    fn name(&self) -> &str {
        "llm-with-fallback"
    }

    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        match self.primary.extract(messages, user_id, cancel).await {
            Ok(result) => Ok(result),
            Err(MemoryError::Cancelled) => Err(MemoryError::Cancelled),
            Err(e) => {
                warn!(
                    user_id = user_id,
                    error = %e,
                    "llm extraction failed, falling back to rules"
                );
                self.fallback.extract(messages, user_id, cancel).await
            }
        }
    }
}

/// Builds the extractor configured for the given provider: rule-based only for
/// the mock provider, LLM-with-fallback otherwise.
pub fn create_extractor(
    config: &MemoryConfig,
    llm: Arc<dyn LlmClient>,
) -> Arc<dyn MemoryExtractor> {
    match config.llm_provider {
        LlmProvider::Mock => Arc::new(RuleBasedExtractor::new(config.clone())),
        _ => Arc::new(FallbackExtractor::new(
            LlmExtractor::new(config.clone(), llm),
            RuleBasedExtractor::new(config.clone()),
        )),
    }
}
