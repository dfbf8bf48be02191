//! OpenAI-compatible implementation of [`LlmClient`] over raw HTTP.
//!
//! Covers both the `openai` and `zhipu` providers (same chat-completions wire
//! format, different base URL). Retries transport and 5xx failures with
//! exponential backoff and jitter; cancellation is observed between attempts.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{mask_token, ChatMessage, LlmClient, LlmError};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const ZHIPU_API_BASE: &str = "https://open.bigmodel.cn/api/paas/v4";

/// Backoff schedule: 500 ms base, doubled per attempt, capped at 8 s,
/// plus up to 50% random jitter.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// System instruction for structured extraction calls.
const EXTRACT_SYSTEM_PROMPT: &str =
    "你是一个信息提取助手。请从用户输入中提取关键信息，并以JSON格式返回。只返回JSON，不要有其他文字。";

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    /// Cheaper model used for extraction calls.
    extraction_model: String,
    max_retries: u32,
}

impl OpenAiCompatClient {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        extraction_model: String,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self, memory_core::MemoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| memory_core::MemoryError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            extraction_model,
            max_retries,
        })
    }

    async fn try_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if let Some(usage) = &body.usage {
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "chat completion usage"
            );
        }

        body.choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Transport("no choices in response".to_string()))
    }

    /// Retry wrapper around [`try_chat`](Self::try_chat).
    async fn chat_with_retries(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let mut delay = BACKOFF_BASE;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            info!(
                model = %model,
                attempt = attempt,
                message_count = messages.len(),
                api_key = %mask_token(&self.api_key),
                "chat completion request"
            );

            match self.try_chat(model, messages, temperature, max_tokens).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..=0.5));
                    let sleep_for = (delay + jitter).min(BACKOFF_CAP);
                    warn!(
                        attempt = attempt,
                        delay_ms = sleep_for.as_millis() as u64,
                        error = %e,
                        "retrying chat completion"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                    delay = (delay * 2).min(BACKOFF_CAP);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Strips markdown code fences the model may wrap JSON in.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    trimmed
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        self.chat_with_retries(&self.model, messages, temperature, max_tokens, cancel)
            .await
    }

    async fn extract_json(
        &self,
        prompt: &str,
        schema_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, LlmError> {
        let system = format!("{EXTRACT_SYSTEM_PROMPT}\n{schema_hint}");
        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];

        // Low temperature keeps the structured output stable.
        let response = self
            .chat_with_retries(&self.extraction_model, &messages, 0.1, 800, cancel)
            .await?;

        let json = strip_code_fences(&response);
        serde_json::from_str(json).map_err(|e| LlmError::Schema(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }
}
