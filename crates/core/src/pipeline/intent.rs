//! Intent gate: decides whether a message warrants a full pipeline run.

use serde::{Deserialize, Serialize};

/// Words that signal a concrete project request
const SIGNAL_WORDS: &[&str] = &[
    // Chinese action verbs
    "开发", "做", "设计", "创建", "构建", "实现", "制作", "搭建", "规划", "写",
    // Chinese domain nouns
    "助手", "平台", "系统", "应用", "app", "网站", "工具", "产品", "项目", "小程序",
    // English
    "build", "develop", "design", "create", "make", "implement", "platform", "system",
    "application", "website", "tool", "product", "project", "assistant",
];

/// Messages must be longer than this (in chars, after trimming)
const MIN_CHARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDecision {
    pub full_pipeline: bool,
}

/// Anything that can route a message to the full pipeline or a simple reply
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, message: &str) -> IntentDecision;
}

/// Signal-word plus length heuristic
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordGate;

impl KeywordGate {
    pub fn has_signal_word(message: &str) -> bool {
        let lowered = message.to_lowercase();
        SIGNAL_WORDS.iter().any(|word| lowered.contains(word))
    }

    pub fn long_enough(message: &str) -> bool {
        message.trim().chars().count() > MIN_CHARS
    }
}

impl IntentClassifier for KeywordGate {
    fn classify(&self, message: &str) -> IntentDecision {
        IntentDecision {
            full_pipeline: Self::has_signal_word(message) && Self::long_enough(message),
        }
    }
}
