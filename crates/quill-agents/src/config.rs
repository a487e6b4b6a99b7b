//! Engine configuration: thresholds, retry budgets, run limits, the provider
//! endpoint, and an optional stage-graph override.
//!
//! Resolution order: built-in defaults, then the TOML file (if any), then
//! `QUILL_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quill_coordination::{GateConfig, GraphError, RetryPolicy, StageGraph, StageSpec};

use crate::pipeline;
use crate::selector::SelectorConfig;

pub const ENV_BASE_URL: &str = "QUILL_BASE_URL";
pub const ENV_API_KEY: &str = "QUILL_API_KEY";
pub const ENV_MODEL: &str = "QUILL_MODEL";
pub const ENV_REASONING_MODEL: &str = "QUILL_REASONING_MODEL";
pub const ENV_QUALITY_THRESHOLD: &str = "QUILL_QUALITY_THRESHOLD";
pub const ENV_MAX_REVISIONS: &str = "QUILL_MAX_REVISIONS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid stage graph: {0}")]
    Graph(#[from] GraphError),
}

/// OpenAI-compatible endpoint used for generation, evaluation and reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    /// Model for the action selector; falls back to `model`.
    pub reasoning_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".into(),
            api_key: None,
            model: "default".into(),
            reasoning_model: None,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

impl ProviderConfig {
    pub fn reasoning_model(&self) -> &str {
        self.reasoning_model.as_deref().unwrap_or(&self.model)
    }
}

/// Top-level engine configuration, shared read-only by concurrent runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gate: GateConfig,
    pub retry: RetryPolicy,
    pub selector: SelectorConfig,
    /// Cap on StageExecutor invocations per run, retries included.
    pub max_total_executions: usize,
    /// Per-call timeout for every collaborator call.
    pub call_timeout_secs: u64,
    pub provider: ProviderConfig,
    /// Start stage of a custom graph; defaults to the first declared stage.
    pub start: Option<String>,
    /// Final stage of a custom graph; defaults to the last declared stage.
    pub final_stage: Option<String>,
    /// Custom stage graph. Empty means the built-in writing pipeline.
    pub stages: Vec<StageSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            retry: RetryPolicy::default(),
            selector: SelectorConfig::default(),
            max_total_executions: 32,
            call_timeout_secs: 120,
            provider: ProviderConfig::default(),
            start: None,
            final_stage: None,
            stages: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` (or defaults), apply the process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `QUILL_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.provider.base_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.provider.api_key = Some(key);
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.provider.model = model;
        }
        if let Some(model) = lookup(ENV_REASONING_MODEL) {
            self.provider.reasoning_model = Some(model);
        }
        if let Some(raw) = lookup(ENV_QUALITY_THRESHOLD) {
            self.gate.quality_threshold = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_QUALITY_THRESHOLD}={raw} is not a number"))
            })?;
        }
        if let Some(raw) = lookup(ENV_MAX_REVISIONS) {
            self.gate.max_revision_attempts = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_MAX_REVISIONS}={raw} is not an integer"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gate.validate().map_err(ConfigError::Invalid)?;
        self.retry.validate().map_err(ConfigError::Invalid)?;
        if self.max_total_executions == 0 {
            return Err(ConfigError::Invalid(
                "max_total_executions must be at least 1".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs must be at least 1".into(),
            ));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.base_url is empty".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Build the configured stage graph, or the built-in pipeline when none is given.
    pub fn build_graph(&self) -> Result<StageGraph, ConfigError> {
        if self.stages.is_empty() {
            return Ok(pipeline::default_graph()?);
        }
        let start = match &self.start {
            Some(start) => start.clone(),
            None => self.stages[0].name.clone(),
        };
        let final_stage = match &self.final_stage {
            Some(name) => name.clone(),
            None => self.stages[self.stages.len() - 1].name.clone(),
        };
        Ok(StageGraph::new(start, final_stage, self.stages.clone())?)
    }
}
