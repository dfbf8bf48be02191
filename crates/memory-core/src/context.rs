//! Memory context assembly and system-prompt rendering.
//!
//! The context is a transient per-query value; rendering it to text is a pure
//! function with a stable format so prompts are reproducible across calls.

use serde::{Deserialize, Serialize};

use crate::types::{Episode, Fact, Message, UserProfile};

/// Everything the host needs to remind the LLM of prior interactions:
/// the profile, the most relevant facts and episodes, and the live
/// working-memory slice of the current session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    pub profile: Option<UserProfile>,
    pub facts: Vec<Fact>,
    pub episodes: Vec<Episode>,
    pub working: Vec<Message>,
}

impl MemoryContext {
    /// Renders the context into the fixed three-block system prompt.
    ///
    /// Blocks are omitted when empty; the result is trimmed. The working
    /// slice is not rendered here: the host replays it as chat turns.
    pub fn to_system_prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(profile) = &self.profile {
            let mut lines: Vec<String> = Vec::new();
            if let Some(name) = &profile.name {
                lines.push(format!("名字：{name}"));
            }
            if let Some(age) = profile.age {
                lines.push(format!("年龄：{age}岁"));
            }
            if let Some(gender) = &profile.gender {
                lines.push(format!("性别：{gender}"));
            }
            if !profile.tags.is_empty() {
                lines.push(format!("兴趣特征：{}", profile.tags.join(", ")));
            }
            if !lines.is_empty() {
                parts.push(format!("【用户信息】\n{}", lines.join("\n")));
            }
        }

        if !self.facts.is_empty() {
            let lines: Vec<String> = self
                .facts
                .iter()
                .map(|f| format!("- {}", f.to_natural_language()))
                .collect();
            parts.push(format!("【已知信息】\n{}", lines.join("\n")));
        }

        if !self.episodes.is_empty() {
            let lines: Vec<String> = self
                .episodes
                .iter()
                .map(|e| format!("- {}", e.summary))
                .collect();
            parts.push(format!("【相关记忆】\n{}", lines.join("\n")));
        }

        parts.join("\n\n").trim().to_string()
    }
}
