//! Rule-based extractor: deterministic, zero-cost distillation without an LLM.
//!
//! Pattern-matches user messages against a closed template set for identity
//! and preferences, ranks keywords by frequency, and looks emotions up in a
//! small lexicon. Used as the fallback when LLM extraction fails and as the
//! only extractor for the mock provider.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use memory_core::{
    Emotion, ExtractionResult, FactCandidate, MemoryConfig, Message, MessageRole, ProfileDelta,
    Result,
};

use super::tokenize::keywords;
use super::MemoryExtractor;

/// Confidence assigned to pattern-matched facts.
const RULE_FACT_CONFIDENCE: f32 = 0.8;
/// Keyword count kept per episode.
const KEYWORD_LIMIT: usize = 8;
/// Fact count kept per extraction.
const FACT_LIMIT: usize = 10;

static NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"我叫(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(),
        Regex::new(r"(?i)my name is ([A-Za-z]+)").unwrap(),
    ]
});

static AGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"我(\d{1,2})岁").unwrap(),
        Regex::new(r"(?i)i am (\d{1,3}) years old").unwrap(),
    ]
});

/// Gender tokens; first hit wins.
static GENDER_TOKENS: &[(&str, &str)] = &[
    ("我是男生", "男"),
    ("我是男孩", "男"),
    ("我是女生", "女"),
    ("我是女孩", "女"),
    ("i am a boy", "男"),
    ("i am a girl", "女"),
];

/// Preference verb templates. Ordered: more specific patterns first so
/// "我有个朋友叫..." is not swallowed by "我有...".
static PREFERENCE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"我不喜欢(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "不喜欢"),
        (Regex::new(r"我喜欢(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "喜欢"),
        (Regex::new(r"我讨厌(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "讨厌"),
        (Regex::new(r"我(?:很)?害怕(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "害怕"),
        (Regex::new(r"我想要?(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "想要"),
        (Regex::new(r"我有(?:一个|个)?朋友叫(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "有朋友叫"),
        (Regex::new(r"我有(.{1,10}?)(?:[，。,！!？?\s]|$)").unwrap(), "拥有"),
        (Regex::new(r"(?i)i like ([a-z ]{1,30}?)(?:[,.!?]|$)").unwrap(), "likes"),
        (Regex::new(r"(?i)i hate ([a-z ]{1,30}?)(?:[,.!?]|$)").unwrap(), "hates"),
        (Regex::new(r"(?i)i'?m afraid of ([a-z ]{1,30}?)(?:[,.!?]|$)").unwrap(), "is afraid of"),
    ]
});

/// Emotion lexicon; scanned in order, first hit wins, default neutral.
static EMOTION_LEXICON: &[(Emotion, &[&str])] = &[
    (Emotion::Happy, &["开心", "高兴", "快乐", "好玩", "哈哈", "太好了", "喜欢", "爱", "happy"]),
    (Emotion::Sad, &["难过", "伤心", "哭", "不开心", "sad"]),
    (Emotion::Angry, &["生气", "气死", "烦", "angry"]),
    (Emotion::Scared, &["害怕", "怕", "吓", "可怕", "恐怖", "scared", "afraid"]),
    (Emotion::Curious, &["为什么", "怎么", "是什么", "什么是", "？", "?", "why", "how"]),
];

/// Deterministic extractor over the closed pattern set. Pure: no storage
/// access, no network.
#[derive(Debug, Clone)]
pub struct RuleBasedExtractor {
    config: MemoryConfig,
}

impl RuleBasedExtractor {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    fn detect_name(text: &str) -> Option<String> {
        NAME_PATTERNS.iter().find_map(|re| {
            re.captures(text)
                .map(|c| c.get(1).unwrap().as_str().trim().to_string())
        })
    }

    fn detect_age(text: &str) -> Option<u32> {
        AGE_PATTERNS.iter().find_map(|re| {
            re.captures(text)
                .and_then(|c| c.get(1).unwrap().as_str().parse::<u32>().ok())
                .filter(|age| (1..150).contains(age))
        })
    }

    fn detect_gender(text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        GENDER_TOKENS
            .iter()
            .find(|(token, _)| lowered.contains(token))
            .map(|(_, gender)| gender.to_string())
    }

    fn detect_emotion(text: &str) -> Emotion {
        let lowered = text.to_lowercase();
        for (emotion, words) in EMOTION_LEXICON {
            if words.iter().any(|w| lowered.contains(w)) {
                return *emotion;
            }
        }
        Emotion::Neutral
    }

    /// Preference statements become facts plus profile tags.
    fn extract_preferences(text: &str, subject: &str) -> (Vec<FactCandidate>, Vec<String>) {
        let mut facts: Vec<FactCandidate> = Vec::new();
        let mut tags = Vec::new();

        for (re, predicate) in PREFERENCE_PATTERNS.iter() {
            for captures in re.captures_iter(text) {
                let object = captures.get(1).unwrap().as_str().trim();
                if object.is_empty() {
                    continue;
                }
                let duplicate = facts
                    .iter()
                    .any(|f| f.predicate == *predicate && f.object == object);
                if duplicate {
                    continue;
                }
                facts.push(FactCandidate {
                    subject: subject.to_string(),
                    predicate: predicate.to_string(),
                    object: object.to_string(),
                    confidence: RULE_FACT_CONFIDENCE,
                });
                tags.push(format!("{predicate} {object}"));
                if facts.len() >= FACT_LIMIT {
                    return (facts, tags);
                }
            }
        }

        (facts, tags)
    }

    /// First sentence of each user message, joined and truncated.
    fn summarize(user_texts: &[&str], max_chars: usize) -> String {
        let first_sentences: Vec<&str> = user_texts
            .iter()
            .filter_map(|text| {
                text.split(['。', '！', '？', '!', '?', '.', '\n'])
                    .map(str::trim)
                    .find(|s| !s.is_empty())
            })
            .collect();
        let joined = first_sentences.join(" ");
        if joined.chars().count() > max_chars {
            joined.chars().take(max_chars).collect()
        } else {
            joined
        }
    }
}

#[async_trait]
impl MemoryExtractor for RuleBasedExtractor {
    fn name(&self) -> &str {
        "rule-based"
    }

    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let user_texts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.text.as_str())
            .collect();
        let full_text = user_texts.join(" ");

        let name = Self::detect_name(&full_text);
        let age = Self::detect_age(&full_text);
        let gender = Self::detect_gender(&full_text);

        let subject = name.clone().unwrap_or_else(|| "user".to_string());
        let (facts, add_tags) = Self::extract_preferences(&full_text, &subject);

        let summary = Self::summarize(&user_texts, self.config.episode_summary_max_length);
        let mut kws = keywords(&full_text, KEYWORD_LIMIT);
        if kws.is_empty() && !summary.is_empty() {
            // Degenerate input (all stopwords / single chars): keep the
            // keywords-nonempty invariant by falling back to the summary head.
            kws.push(summary.chars().take(2).collect());
        }

        let emotion = Self::detect_emotion(&full_text);
        let profile_delta = ProfileDelta {
            name,
            age,
            gender,
            add_tags,
        };

        let mut importance = 0.3 + 0.1 * facts.len() as f32;
        if !profile_delta.is_empty() {
            importance += 0.1;
        }
        if emotion != Emotion::Neutral {
            importance += 0.1;
        }
        let importance = importance.clamp(0.0, 1.0);

        debug!(
            user_id = user_id,
            fact_count = facts.len(),
            keyword_count = kws.len(),
            emotion = emotion.as_str(),
            "rule-based extraction complete"
        );

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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use memory_core::ConfigPresets;

    fn msg(seq: u64, role: MessageRole, text: &str) -> Message {
        Message {
            seq,
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn extract(texts: &[&str]) -> ExtractionResult {
        let extractor = RuleBasedExtractor::new(ConfigPresets::minimal());
        let mut messages = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            messages.push(msg(2 * i as u64, MessageRole::User, text));
            messages.push(msg(2 * i as u64 + 1, MessageRole::Assistant, "好的"));
        }
        extractor
            .extract(&messages, "u1", &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn extracts_name_and_age() {
        let result = extract(&["我叫小明，我5岁了"]).await;
        assert_eq!(result.profile_delta.name.as_deref(), Some("小明"));
        assert_eq!(result.profile_delta.age, Some(5));
    }

    #[tokio::test]
    async fn preference_becomes_fact_and_tag() {
        let result = extract(&["我叫小明", "我喜欢恐龙"]).await;
        let fact = result
            .facts
            .iter()
            .find(|f| f.predicate == "喜欢")
            .expect("preference fact");
        assert_eq!(fact.subject, "小明");
        assert_eq!(fact.object, "恐龙");
        assert!((fact.confidence - 0.8).abs() < 1e-6);
        assert!(result.profile_delta.add_tags.contains(&"喜欢 恐龙".to_string()));
    }

    #[tokio::test]
    async fn subject_defaults_to_user_without_name() {
        let result = extract(&["我害怕打雷"]).await;
        let fact = result.facts.iter().find(|f| f.predicate == "害怕").unwrap();
        assert_eq!(fact.subject, "user");
        assert_eq!(fact.object, "打雷");
    }

    #[tokio::test]
    async fn emotion_from_lexicon_defaults_neutral() {
        let scared = extract(&["我害怕打雷"]).await;
        assert_eq!(scared.emotion, Emotion::Scared);

        let neutral = extract(&["今天去了超市"]).await;
        assert_eq!(neutral.emotion, Emotion::Neutral);
    }

    #[tokio::test]
    async fn keywords_nonempty_for_nonempty_summary() {
        let result = extract(&["今天和朋友去了动物园，看到了恐龙化石"]).await;
        assert!(!result.summary.is_empty());
        assert!(!result.keywords.is_empty());
    }

    #[tokio::test]
    async fn importance_formula() {
        // One fact + nonempty delta + scared emotion: 0.3 + 0.1 + 0.1 + 0.1.
        let result = extract(&["我害怕打雷"]).await;
        assert!((result.importance - 0.6).abs() < 1e-5);

        // Nothing extracted, neutral emotion: floor value.
        let plain = extract(&["今天去了超市"]).await;
        assert!((plain.importance - 0.3).abs() < 1e-5);
    }

    #[tokio::test]
    async fn summary_is_first_sentences_joined() {
        let result = extract(&["今天好开心！我们去了公园", "明天想去动物园。还要看恐龙"]).await;
        assert!(result.summary.contains("今天好开心"));
        assert!(result.summary.contains("明天想去动物园"));
        assert!(!result.summary.contains("还要看恐龙"));
    }
}
