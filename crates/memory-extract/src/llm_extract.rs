//! LLM-backed extractor: one structured-extraction call per ended session.
//!
//! The prompt pins the JSON shape and the closed emotion set; the response is
//! validated and clipped before anything reaches storage. Malformed output is
//! a schema error, which the fallback composition turns into a rule-based run.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use llm_client::LlmClient;
use memory_core::{
    Emotion, ExtractionResult, FactCandidate, MemoryConfig, MemoryError, Message, MessageRole,
    ProfileDelta, Result,
};

use super::tokenize::keywords;
use super::MemoryExtractor;

/// Confidence assumed for LLM facts that omit the field.
const DEFAULT_FACT_CONFIDENCE: f32 = 0.7;

const EXTRACTION_PROMPT: &str = r#"请分析以下对话内容，提取关键记忆信息。

对话内容：
{conversation}

请以JSON格式返回，包含以下字段：
{
    "summary": "对话的简短摘要（不超过100字）",
    "keywords": ["关键词列表，3-8个"],
    "emotion": "对话情感，只能取 happy/sad/angry/scared/curious/neutral 之一",
    "importance": 0.5,
    "facts": [
        {"subject": "主语", "predicate": "谓语", "object": "宾语", "confidence": 0.7}
    ],
    "profile_updates": {
        "name": "用户名字（如果提到）",
        "age": null,
        "gender": null,
        "tags": ["新发现的兴趣/特征标签"]
    }
}

注意：
1. 只提取明确提到的信息，不要推测
2. facts中的三元组要简洁准确
3. 儿童对话特别关注：喜好、害怕的事物、家庭成员、学校生活"#;

const SCHEMA_HINT: &str = r#"期望的JSON结构：
- summary: 字符串
- keywords: 字符串数组
- emotion: 字符串（happy/sad/angry/scared/curious/neutral）
- importance: 0-1的浮点数
- facts: 对象数组，每个对象有subject/predicate/object/confidence
- profile_updates: 对象，包含name/age/gender/tags"#;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}

/// Extractor that delegates to an [`LlmClient`]. Pure with respect to storage.
pub struct LlmExtractor {
    config: MemoryConfig,
    llm: std::sync::Arc<dyn LlmClient>,
}

impl LlmExtractor {
    pub fn new(config: MemoryConfig, llm: std::sync::Arc<dyn LlmClient>) -> Self {
        Self { config, llm }
    }

    fn format_conversation(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::User => "用户",
                    _ => "助手",
                };
                format!("{role}: {}", m.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Validates and clips the raw JSON into an [`ExtractionResult`].
    fn validate(&self, value: &Value) -> Result<ExtractionResult> {
        let object = value
            .as_object()
            .ok_or_else(|| MemoryError::Schema("extraction output is not an object".into()))?;

        let summary = object
            .get("summary")
            .and_then(Value::as_str)
            .ok_or_else(|| MemoryError::Schema("missing string field: summary".into()))?;
        let summary = truncate_chars(summary, self.config.episode_summary_max_length);

        let raw_keywords = object
            .get("keywords")
            .and_then(Value::as_array)
            .ok_or_else(|| MemoryError::Schema("missing array field: keywords".into()))?;
        let mut kws: Vec<String> = raw_keywords
            .iter()
            .filter_map(Value::as_str)
            .map(|k| truncate_chars(k, 20))
            .filter(|k| !k.is_empty())
            .take(8)
            .collect();
        if kws.is_empty() && !summary.is_empty() {
            kws = keywords(&summary, 8);
            if kws.is_empty() {
                kws.push(summary.chars().take(2).collect());
            }
        }

        let emotion = object
            .get("emotion")
            .and_then(Value::as_str)
            .map(Emotion::from_label)
            .ok_or_else(|| MemoryError::Schema("missing string field: emotion".into()))?;

        let importance = object
            .get("importance")
            .and_then(Value::as_f64)
            .ok_or_else(|| MemoryError::Schema("missing number field: importance".into()))?
            .clamp(0.0, 1.0) as f32;

        let mut facts = Vec::new();
        if let Some(raw_facts) = object.get("facts").and_then(Value::as_array) {
            for raw in raw_facts.iter().take(10) {
                let (Some(subject), Some(predicate), Some(obj)) = (
                    raw.get("subject").and_then(Value::as_str),
                    raw.get("predicate").and_then(Value::as_str),
                    raw.get("object").and_then(Value::as_str),
                ) else {
                    continue;
                };
                if subject.is_empty() || predicate.is_empty() || obj.is_empty() {
                    continue;
                }
                let confidence = raw
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_FACT_CONFIDENCE as f64)
                    .clamp(0.0, 1.0) as f32;
                facts.push(FactCandidate {
                    subject: truncate_chars(subject, 50),
                    predicate: truncate_chars(predicate, 30),
                    object: truncate_chars(obj, 50),
                    confidence,
                });
            }
        }

        let mut profile_delta = ProfileDelta::default();
        if let Some(updates) = object.get("profile_updates").and_then(Value::as_object) {
            if let Some(name) = updates.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    profile_delta.name = Some(truncate_chars(name, 20));
                }
            }
            if let Some(age) = updates.get("age").and_then(Value::as_u64) {
                if (1..150).contains(&age) {
                    profile_delta.age = Some(age as u32);
                }
            }
            if let Some(gender) = updates.get("gender").and_then(Value::as_str) {
                if !gender.is_empty() {
                    profile_delta.gender = Some(truncate_chars(gender, 10));
                }
            }
            if let Some(tags) = updates.get("tags").and_then(Value::as_array) {
                profile_delta.add_tags = tags
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| truncate_chars(t, 20))
                    .take(5)
                    .collect();
            }
        }

        Ok(ExtractionResult {
            summary,
            keywords: kws,
            emotion,
            importance,
            facts,
            profile_delta,
        })
    }
}

#[async_trait]
impl MemoryExtractor for LlmExtractor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let conversation = Self::format_conversation(messages);
        let prompt = EXTRACTION_PROMPT.replace("{conversation}", &conversation);

        let value = self
            .llm
            .extract_json(&prompt, SCHEMA_HINT, cancel)
            .await
            .map_err(|e| e.into_memory_error())?;

        let result = self.validate(&value)?;
        debug!(
            user_id = user_id,
            fact_count = result.facts.len(),
            importance = result.importance,
            "llm extraction complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_core::ConfigPresets;
    use serde_json::json;
    use std::sync::Arc;

    fn extractor() -> LlmExtractor {
        LlmExtractor::new(
            ConfigPresets::minimal(),
            Arc::new(llm_client::MockLlmClient::new()),
        )
    }

    #[test]
    fn validate_clips_importance_and_limits() {
        let value = json!({
            "summary": "聊了恐龙",
            "keywords": ["恐龙", "动物园"],
            "emotion": "happy",
            "importance": 1.7,
            "facts": [
                {"subject": "小明", "predicate": "喜欢", "object": "恐龙", "confidence": 2.0},
                {"subject": "", "predicate": "x", "object": "y"}
            ],
            "profile_updates": {"name": "小明", "age": 5, "tags": ["喜欢恐龙"]}
        });
        let result = extractor().validate(&value).unwrap();
        assert_eq!(result.importance, 1.0);
        assert_eq!(result.facts.len(), 1);
        assert_eq!(result.facts[0].confidence, 1.0);
        assert_eq!(result.profile_delta.name.as_deref(), Some("小明"));
        assert_eq!(result.profile_delta.age, Some(5));
    }

    #[test]
    fn validate_rejects_non_object() {
        let err = extractor().validate(&json!("not an object")).unwrap_err();
        assert!(matches!(err, MemoryError::Schema(_)));
    }

    #[test]
    fn validate_rejects_missing_summary() {
        let err = extractor()
            .validate(&json!({"keywords": [], "emotion": "neutral", "importance": 0.5}))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Schema(_)));
    }

    #[test]
    fn validate_backfills_keywords_from_summary() {
        let value = json!({
            "summary": "今天聊了恐龙化石",
            "keywords": [],
            "emotion": "neutral",
            "importance": 0.5
        });
        let result = extractor().validate(&value).unwrap();
        assert!(!result.keywords.is_empty());
    }

    #[test]
    fn chinese_emotion_labels_accepted() {
        let value = json!({
            "summary": "s",
            "keywords": ["k1"],
            "emotion": "开心",
            "importance": 0.4
        });
        let result = extractor().validate(&value).unwrap();
        assert_eq!(result.emotion, Emotion::Happy);
    }
}
