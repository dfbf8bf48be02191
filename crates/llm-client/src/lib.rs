//! # llm-client
//!
//! LLM 调用抽象：[`LlmClient`] trait（chat + 结构化提取）与多个提供商实现。
//! 与 HTTP 服务层无关，供 memory-extract 与宿主程序使用。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use memory_core::{LlmProvider, MemoryConfig, MemoryError};

mod mock_llm;
mod openai_llm;

pub use mock_llm::MockLlmClient;
pub use openai_llm::{OpenAiCompatClient, OPENAI_API_BASE, ZHIPU_API_BASE};

/// Role of a chat message, one-to-one with the chat-completions API `role` values.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message, one element of the API `messages` array.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Errors from LLM calls.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Network-level failure (connect, timeout, decode). Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status from the provider. Retryable only for 5xx.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The model's output did not match the requested structure. Not retried.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transport failures and server-side (5xx) statuses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Schema(_) | LlmError::Cancelled => false,
        }
    }

    /// Maps onto the shared memory error taxonomy.
    pub fn into_memory_error(self) -> MemoryError {
        match self {
            LlmError::Schema(msg) => MemoryError::Schema(msg),
            LlmError::Cancelled => MemoryError::Cancelled,
            other => MemoryError::TransientLlm(other.to_string()),
        }
    }
}

/// LLM client abstraction: reply generation and structured extraction.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends the message list and returns the model's reply text.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError>;

    /// Asks the model for a JSON value matching `schema_hint`.
    /// Returns [`LlmError::Schema`] when the output cannot be parsed.
    async fn extract_json(
        &self,
        prompt: &str,
        schema_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, LlmError>;
}

/// Builds the client for the configured provider.
///
/// `openai` and `zhipu` share the OpenAI-compatible wire format and differ in
/// their default base URL; `LLM_BASE_URL` overrides either.
pub fn create_llm_client(config: &MemoryConfig) -> Result<Arc<dyn LlmClient>, MemoryError> {
    match config.llm_provider {
        LlmProvider::Mock => Ok(Arc::new(MockLlmClient::new())),
        LlmProvider::OpenAi | LlmProvider::Zhipu => {
            let api_key = config
                .llm_api_key
                .clone()
                .ok_or_else(|| MemoryError::Config("LLM_API_KEY not set".to_string()))?;
            let default_base = match config.llm_provider {
                LlmProvider::Zhipu => ZHIPU_API_BASE,
                _ => OPENAI_API_BASE,
            };
            let base_url = config
                .llm_base_url
                .clone()
                .unwrap_or_else(|| default_base.to_string());
            Ok(Arc::new(OpenAiCompatClient::new(
                api_key,
                base_url,
                config.llm_model.clone(),
                config.extraction_model.clone(),
                config.llm_max_retries,
                std::time::Duration::from_secs(config.llm_timeout_secs),
            )?))
        }
    }
}

/// Masks an API key for safe logging: first 7 chars + "***" + last 4 chars.
/// Keys of length <= 11 collapse to "***" so no part leaks.
pub fn mask_token(token: &str) -> String {
    let len = token.len();
    if len <= 11 {
        "***".to_string()
    } else {
        format!("{}***{}", &token[..7], &token[len - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_token_hides_short_keys_entirely() {
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token("sk-abcd1234efgh5678"), "sk-abcd***5678");
    }

    #[test]
    fn retryability_classification() {
        assert!(LlmError::Transport("timeout".into()).is_retryable());
        assert!(LlmError::Api { status: 503, message: "overloaded".into() }.is_retryable());
        assert!(!LlmError::Api { status: 401, message: "bad key".into() }.is_retryable());
        assert!(!LlmError::Schema("not json".into()).is_retryable());
    }

    #[test]
    fn schema_error_maps_to_schema_not_transient() {
        let err = LlmError::Schema("bad".into()).into_memory_error();
        assert!(matches!(err, MemoryError::Schema(_)));
        let err = LlmError::Transport("down".into()).into_memory_error();
        assert!(matches!(err, MemoryError::TransientLlm(_)));
    }
}
