//! # ThinkTank Models
//!
//! Centralized LLM configuration types. A `ModelConfig` is built once by the
//! caller (CLI, server, tests) and injected into the capability provider;
//! nothing in the core reads the process environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::capabilities::CapabilityRole;

/// Supported OpenAI-compatible providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    DeepSeek,
    OpenRouter,
    Grok,
}

impl LlmProvider {
    /// Get all available providers
    pub fn all() -> Vec<LlmProvider> {
        vec![
            LlmProvider::OpenAI,
            LlmProvider::DeepSeek,
            LlmProvider::OpenRouter,
            LlmProvider::Grok,
        ]
    }

    /// Display name for logs and `GET /config`
    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "OpenAI",
            LlmProvider::DeepSeek => "DeepSeek",
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::Grok => "Grok",
        }
    }

    /// Chat-completions base URL used when no override is configured
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "https://api.openai.com/v1",
            LlmProvider::DeepSeek => "https://api.deepseek.com/v1",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
            LlmProvider::Grok => "https://api.x.ai/v1",
        }
    }

    /// Model used when the configuration leaves it empty
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "gpt-4o-mini",
            LlmProvider::DeepSeek => "deepseek-chat",
            LlmProvider::OpenRouter => "openai/gpt-4o-mini",
            LlmProvider::Grok => "grok-2",
        }
    }

    /// Parse a provider name as written in config files and env vars
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAI),
            "deepseek" => Some(LlmProvider::DeepSeek),
            "openrouter" => Some(LlmProvider::OpenRouter),
            "grok" | "xai" => Some(LlmProvider::Grok),
            _ => None,
        }
    }
}

/// Configuration for the capability provider backend
///
/// Supports per-role model overrides, keyed by the role slug
/// (`requirement_analyst`, `task_planner`, ...).
///
/// ## Example
/// ```rust,ignore
/// use thinktank_core::models::{LlmProvider, ModelConfig};
///
/// let config = ModelConfig::with_provider(LlmProvider::DeepSeek, "deepseek-chat")
///     .with_api_key("sk-...");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// LLM provider to use
    #[serde(default)]
    pub provider: LlmProvider,
    /// Model name (e.g., "gpt-4o-mini")
    pub model: String,
    /// Optional base URL override for OpenAI-compatible gateways
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key sent as a bearer token
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Per-role model overrides (role slug -> model name)
    #[serde(default)]
    pub per_role_models: HashMap<String, String>,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::with_provider(LlmProvider::OpenAI, LlmProvider::OpenAI.default_model())
    }
}

impl ModelConfig {
    /// Create a new model config with the default provider (OpenAI)
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_provider(LlmProvider::OpenAI, model)
    }

    /// Create config for a specific provider
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            per_role_models: HashMap::new(),
        }
    }

    /// Set base URL (for OpenAI-compatible endpoints)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Override the model for one role
    pub fn with_role_model(mut self, role: CapabilityRole, model: impl Into<String>) -> Self {
        self.per_role_models
            .insert(role.slug().to_string(), model.into());
        self
    }

    /// Resolve the model for a role: per-role override -> global -> provider default
    pub fn model_for(&self, role: CapabilityRole) -> &str {
        if let Some(model) = self.per_role_models.get(role.slug()) {
            return model;
        }
        if self.model.trim().is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    /// Full chat-completions URL
    pub fn completions_url(&self) -> String {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url());
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
