//! Deterministic mock client used by tests and the minimal preset.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ChatMessage, LlmClient, LlmError, Role};

/// Keyword candidates the mock scans the prompt for.
const KEYWORD_CANDIDATES: &[&str] = &["喜欢", "讨厌", "想要", "名字", "岁", "学校", "朋友", "家"];

/// Canned-output client: no network, equal inputs give equal outputs.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.chars().take(20).collect::<String>())
            .unwrap_or_default();
        Ok(format!("这是对'{last_user}'的模拟回复"))
    }

    async fn extract_json(
        &self,
        prompt: &str,
        _schema_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let summary: String = prompt.chars().take(100).collect();
        let keywords: Vec<&str> = KEYWORD_CANDIDATES
            .iter()
            .copied()
            .filter(|kw| prompt.contains(kw))
            .collect();

        Ok(json!({
            "summary": summary,
            "keywords": keywords,
            "emotion": "neutral",
            "importance": 0.5,
            "facts": [],
            "profile_updates": {},
        }))
    }
}
