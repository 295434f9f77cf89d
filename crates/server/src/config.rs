//! Server configuration: `.thinktank/config.json` layered under environment
//! variables (loaded from `.env` by `dotenvy` at startup).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thinktank_core::capabilities::CapabilityRole;
use thinktank_core::models::{LlmProvider, ModelConfig};
use thinktank_core::pipeline::{ParseFailurePolicy, PipelineConfig};

pub const CONFIG_PATH: &str = ".thinktank/config.json";

/// Persisted configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_failure_policy: Option<ParseFailurePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake_enabled: Option<bool>,
    /// Role slug -> model name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_role_models: HashMap<String, String>,
}

impl PersistedConfig {
    pub async fn load() -> Self {
        Self::load_from(Path::new(CONFIG_PATH)).await
    }

    pub async fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Could not read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Build the provider configuration; environment wins over the file
    pub fn model_config(&self, env: &EnvConfig) -> Result<ModelConfig> {
        let provider_name = env.provider.as_ref().or(self.provider.as_ref());
        let provider = match provider_name {
            Some(name) => match LlmProvider::from_name(name) {
                Some(provider) => provider,
                None => bail!("Unknown provider '{}'", name),
            },
            None => LlmProvider::default(),
        };

        let model = env
            .model
            .clone()
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());

        let mut config = ModelConfig::with_provider(provider, model);
        if let Some(url) = env.api_base.clone().or_else(|| self.base_url.clone()) {
            config = config.with_base_url(url);
        }
        if let Some(key) = env.api_key.clone() {
            config = config.with_api_key(key);
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }

        for (slug, model) in &self.per_role_models {
            match CapabilityRole::from_slug(slug) {
                Some(role) => config = config.with_role_model(role, model.clone()),
                None => tracing::warn!("Ignoring model override for unknown role '{}'", slug),
            }
        }

        Ok(config)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        match self.stage_timeout_secs {
            Some(0) => tracing::warn!(
                default_ms = config.stage_timeout_ms,
                "stage_timeout_secs must be at least 1; keeping the default"
            ),
            Some(secs) => config.stage_timeout_ms = secs.saturating_mul(1000),
            None => {}
        }
        if let Some(policy) = self.parse_failure_policy {
            config.parse_failure_policy = policy;
        }
        if let Some(enabled) = self.intake_enabled {
            config.intake_enabled = enabled;
        }
        config
    }
}

/// Provider settings taken from the process environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub provider: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            provider: get("THINKTANK_PROVIDER"),
            api_base: get("OPENAI_API_BASE"),
            api_key: get("OPENAI_API_KEY"),
            model: get("OPENAI_MODEL"),
        }
    }
}

/// Database path: explicit flag, else the default location
pub fn db_path(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| PathBuf::from(thinktank_core::state::db::DEFAULT_DB_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = PersistedConfig::default()
            .model_config(&EnvConfig::default())
            .unwrap();
        assert_eq!(config.provider, LlmProvider::OpenAI);
        assert_eq!(config.model, "gpt-4o-mini");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = PersistedConfig {
            provider: Some("deepseek".to_string()),
            model: Some("deepseek-chat".to_string()),
            base_url: Some("https://file.example/v1".to_string()),
            ..Default::default()
        };
        let env = env(&[
            ("OPENAI_API_BASE", "https://gateway.example/v1"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL", ""),
        ]);

        let config = file.model_config(&env).unwrap();
        assert_eq!(config.provider, LlmProvider::DeepSeek);
        // blank env values are ignored
        assert_eq!(config.model, "deepseek-chat");
        assert_eq!(
            config.completions_url(),
            "https://gateway.example/v1/chat/completions"
        );
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let env = env(&[("THINKTANK_PROVIDER", "skynet")]);
        assert!(PersistedConfig::default().model_config(&env).is_err());
    }

    #[test]
    fn test_role_models_and_pipeline_settings() {
        let file = PersistedConfig {
            stage_timeout_secs: Some(30),
            parse_failure_policy: Some(ParseFailurePolicy::FailFast),
            intake_enabled: Some(false),
            per_role_models: HashMap::from([
                ("evaluator".to_string(), "gpt-4o".to_string()),
                ("oracle".to_string(), "ignored".to_string()),
            ]),
            ..Default::default()
        };

        let model = file.model_config(&EnvConfig::default()).unwrap();
        assert_eq!(model.model_for(CapabilityRole::Evaluator), "gpt-4o");
        assert_eq!(model.model_for(CapabilityRole::Researcher), "gpt-4o-mini");

        let pipeline = file.pipeline_config();
        assert_eq!(pipeline.stage_timeout_ms, 30_000);
        assert_eq!(pipeline.parse_failure_policy, ParseFailurePolicy::FailFast);
        assert!(!pipeline.intake_enabled);
    }

    #[test]
    fn test_zero_stage_timeout_keeps_default() {
        let file = PersistedConfig {
            stage_timeout_secs: Some(0),
            ..Default::default()
        };

        let pipeline = file.pipeline_config();
        assert_eq!(
            pipeline.stage_timeout_ms,
            PipelineConfig::default().stage_timeout_ms
        );
        assert!(pipeline.stage_timeout_ms > 0);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".thinktank").join("config.json");

        assert_eq!(PersistedConfig::load_from(&path).await, PersistedConfig::default());

        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, r#"{"provider": "openrouter", "stage_timeout_secs": 90}"#)
            .await
            .unwrap();
        let config = PersistedConfig::load_from(&path).await;
        assert_eq!(config.provider.as_deref(), Some("openrouter"));
        assert_eq!(config.stage_timeout_secs, Some(90));

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(PersistedConfig::load_from(&path).await, PersistedConfig::default());
    }
}
