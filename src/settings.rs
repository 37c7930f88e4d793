//! Engine settings shared by the library and the cache tool.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::agent::{AgentConfig, DEFAULT_REPLANNING_CYCLE_LIMIT};
use crate::cache::{CacheConfig, CacheStrategy, DEFAULT_CACHE_MAX_FILENAME_LENGTH};
use crate::error::EngineError;
use crate::model::ModelConfig;

/// Engine settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Model API base URL
    pub base_url: String,
    /// Model API key
    pub api_key: String,
    /// Model name
    pub model_name: String,
    /// Maximum retries for model requests
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
    /// Cache id; empty disables caching
    pub cache_id: String,
    /// "read-only", "read-write" or "write-only"
    pub cache_strategy: String,
    /// Cache directory; empty means the platform default
    pub cache_dir: String,
    pub cache_max_filename_length: usize,
    /// Maximum planning rounds per instruction
    pub replanning_cycle_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            base_url: model.base_url,
            api_key: model.api_key,
            model_name: model.model_name,
            max_retries: model.max_retries,
            retry_delay: model.retry_delay_secs,
            cache_id: String::new(),
            cache_strategy: CacheStrategy::default().as_str().to_string(),
            cache_dir: String::new(),
            cache_max_filename_length: DEFAULT_CACHE_MAX_FILENAME_LENGTH,
            replanning_cycle_limit: DEFAULT_REPLANNING_CYCLE_LIMIT,
        }
    }
}

impl EngineSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "moderras", "ui-agent")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str::<Self>(&content).ok())
            .unwrap_or_default()
            .backfilled()
    }

    /// Load settings, then overlay environment variables (including `.env`).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut settings = Self::load();
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings
    }

    /// Backfill fields left empty by older config files.
    fn backfilled(mut self) -> Self {
        let defaults = Self::default();
        if self.base_url.is_empty() {
            self.base_url = defaults.base_url;
        }
        if self.model_name.is_empty() {
            self.model_name = defaults.model_name;
        }
        if self.cache_strategy.is_empty() {
            self.cache_strategy = defaults.cache_strategy;
        }
        if self.cache_max_filename_length == 0 {
            self.cache_max_filename_length = defaults.cache_max_filename_length;
        }
        if self.replanning_cycle_limit == 0 {
            self.replanning_cycle_limit = defaults.replanning_cycle_limit;
        }
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = var("MODEL_BASE_URL") {
            self.base_url = value;
        }
        if let Some(value) = var("MODEL_API_KEY") {
            self.api_key = value;
        }
        if let Some(value) = var("MODEL_NAME") {
            self.model_name = value;
        }
        if let Some(value) = var("UI_AGENT_CACHE_ID") {
            self.cache_id = value;
        }
        if let Some(value) = var("UI_AGENT_CACHE_STRATEGY") {
            self.cache_strategy = value;
        }
        if let Some(value) = var("UI_AGENT_CACHE_DIR") {
            self.cache_dir = value;
        }
        match var("UI_AGENT_CACHE_MAX_FILENAME_LENGTH").map(|v| v.parse::<usize>()) {
            Some(Ok(value)) if value > 0 => self.cache_max_filename_length = value,
            Some(_) => tracing::warn!("Ignoring invalid UI_AGENT_CACHE_MAX_FILENAME_LENGTH"),
            None => {}
        }
        match var("UI_AGENT_REPLANNING_CYCLE_LIMIT").map(|v| v.parse::<usize>()) {
            Some(Ok(value)) if value > 0 => self.replanning_cycle_limit = value,
            Some(_) => tracing::warn!("Ignoring invalid UI_AGENT_REPLANNING_CYCLE_LIMIT"),
            None => {}
        }
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), EngineError> {
        let dir = Self::config_dir().ok_or_else(|| {
            EngineError::InvalidParam("Cannot determine config directory".to_string())
        })?;
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("settings.json"), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(self.base_url.clone())
            .with_api_key(self.api_key.clone())
            .with_model_name(self.model_name.clone())
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
    }

    /// Cache config, or `None` when no cache id is set.
    pub fn cache_config(&self) -> Result<Option<CacheConfig>, EngineError> {
        if self.cache_id.trim().is_empty() {
            return Ok(None);
        }
        let mut config = CacheConfig::new(self.cache_id.clone())?
            .with_strategy(self.cache_strategy.parse::<CacheStrategy>()?)
            .with_max_filename_length(self.cache_max_filename_length);
        if !self.cache_dir.is_empty() {
            config = config.with_cache_dir(&self.cache_dir);
        }
        Ok(Some(config))
    }

    pub fn agent_config(&self) -> Result<AgentConfig, EngineError> {
        let mut config =
            AgentConfig::default().with_replanning_cycle_limit(self.replanning_cycle_limit);
        if let Some(cache) = self.cache_config()? {
            config = config.with_cache(cache);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_backfill_from_partial_json() {
        let loaded: EngineSettings =
            serde_json::from_str(r#"{"api_key":"secret","model_name":"","replanning_cycle_limit":0}"#)
                .unwrap();
        let settings = loaded.backfilled();
        assert_eq!(settings.api_key, "secret");
        assert_eq!(settings.model_name, "gpt-4o");
        assert_eq!(settings.replanning_cycle_limit, DEFAULT_REPLANNING_CYCLE_LIMIT);
        assert_eq!(settings.cache_strategy, "read-write");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MODEL_NAME", "vision-large"),
            ("UI_AGENT_CACHE_ID", "checkout flow"),
            ("UI_AGENT_CACHE_STRATEGY", "read-only"),
            ("UI_AGENT_CACHE_DIR", "/tmp/ui-cache"),
            ("UI_AGENT_REPLANNING_CYCLE_LIMIT", "5"),
            ("UI_AGENT_CACHE_MAX_FILENAME_LENGTH", "not-a-number"),
        ]);
        let mut settings = EngineSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.model_config().model_name, "vision-large");
        assert_eq!(settings.cache_max_filename_length, DEFAULT_CACHE_MAX_FILENAME_LENGTH);

        let cache = settings.cache_config().unwrap().unwrap();
        assert_eq!(cache.strategy, CacheStrategy::ReadOnly);
        assert_eq!(
            cache.file_path().unwrap(),
            PathBuf::from("/tmp/ui-cache/checkout-flow.cache.yaml")
        );
        assert_eq!(settings.agent_config().unwrap().replanning_cycle_limit, 5);
    }

    #[test]
    fn test_no_cache_without_id() {
        let settings = EngineSettings::default();
        assert!(settings.cache_config().unwrap().is_none());
        assert!(settings.agent_config().unwrap().cache.is_none());
    }

    #[test]
    fn test_invalid_strategy() {
        let settings = EngineSettings {
            cache_id: "run".to_string(),
            cache_strategy: "sometimes".to_string(),
            ..Default::default()
        };
        assert!(matches!(settings.cache_config(), Err(EngineError::Cache(_))));
    }
}
