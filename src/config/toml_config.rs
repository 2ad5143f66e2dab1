//! TOML Configuration with Environment Variable Overrides
//!
//! Supports:
//! - TOML configuration file (`<config_dir>/kai/config.toml` by default)
//! - `.env` loading and `KAI_*` environment overrides
//! - Atomic writes with backup

use crate::gateway::AgentRole;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pipeline: StageConfig,
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Resilience settings for the generation gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Primary timeout for a single generation attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failures before a role's circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Millisecond override for the cooldown, mostly for tests
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_similarity")]
    pub cache_similarity: f32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_per_role: usize,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_similarity() -> f32 {
    0.8
}
fn default_cache_capacity() -> usize {
    32
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_ms: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_similarity: default_cache_similarity(),
            cache_capacity_per_role: default_cache_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        match self.cooldown_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.cooldown_secs),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Orchestration thresholds and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Buffer length at which the trait profiler runs
    #[serde(default = "default_genetic_threshold")]
    pub genetic_threshold: usize,
    /// Buffer length at which the wellness monitor runs
    #[serde(default = "default_wellness_threshold")]
    pub wellness_threshold: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Defaults to half of the gateway timeout when unset
    #[serde(default)]
    pub background_timeout_secs: Option<u64>,
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_buffer_capacity() -> usize {
    20
}
fn default_genetic_threshold() -> usize {
    6
}
fn default_wellness_threshold() -> usize {
    4
}
fn default_max_message_chars() -> usize {
    5000
}
fn default_locale() -> String {
    "en".to_string()
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            genetic_threshold: default_genetic_threshold(),
            wellness_threshold: default_wellness_threshold(),
            max_message_chars: default_max_message_chars(),
            background_timeout_secs: None,
            locale: default_locale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Weight applied to an observation's confidence when it is merged
    #[serde(default = "default_decay")]
    pub decay: f32,
}

fn default_decay() -> f32 {
    0.5
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            decay: default_decay(),
        }
    }
}

/// OpenAI-compatible endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub guardrail_model: Option<String>,
    #[serde(default)]
    pub kai_model: Option<String>,
    #[serde(default)]
    pub profiler_model: Option<String>,
    #[serde(default)]
    pub wellness_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}
fn default_model() -> String {
    "default".to_string()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            guardrail_model: None,
            kai_model: None,
            profiler_model: None,
            wellness_model: None,
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    /// Model name for a role, falling back to the shared default
    pub fn model_for(&self, role: AgentRole) -> &str {
        let specific = match role {
            AgentRole::SafetyClassifier => self.guardrail_model.as_deref(),
            AgentRole::Kai => self.kai_model.as_deref(),
            AgentRole::TraitProfiler => self.profiler_model.as_deref(),
            AgentRole::WellnessMonitor => self.wellness_model.as_deref(),
        };
        specific.unwrap_or(&self.model)
    }
}

impl PipelineConfig {
    /// Secondary timeout for background stages
    pub fn background_timeout(&self) -> Duration {
        match self.pipeline.background_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.gateway.timeout() / 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.buffer_capacity == 0 {
            bail!("pipeline.buffer_capacity must be at least 1");
        }
        if self.pipeline.genetic_threshold == 0 || self.pipeline.wellness_threshold == 0 {
            bail!("pipeline thresholds must be at least 1");
        }
        if self.pipeline.max_message_chars == 0 {
            bail!("pipeline.max_message_chars must be at least 1");
        }
        if self.gateway.timeout_secs == 0 {
            bail!("gateway.timeout_secs must be at least 1");
        }
        if self.pipeline.background_timeout_secs == Some(0) {
            bail!("pipeline.background_timeout_secs must be at least 1");
        }
        if self.gateway.max_attempts == 0 {
            bail!("gateway.max_attempts must be at least 1");
        }
        if self.gateway.failure_threshold == 0 {
            bail!("gateway.failure_threshold must be at least 1");
        }
        if !(self.profiler.decay > 0.0 && self.profiler.decay <= 1.0) {
            bail!("profiler.decay must be in (0, 1], got {}", self.profiler.decay);
        }
        if !(0.0..=1.0).contains(&self.gateway.cache_similarity) {
            bail!("gateway.cache_similarity must be in [0, 1]");
        }
        Ok(())
    }
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("kai");
    path.push("config.toml");
    path
}

/// Load configuration from `path` (or the default location), then apply
/// `.env` and environment overrides.
///
/// A missing file yields the defaults; a malformed file is an error.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file found or error loading: {}", e);
    }

    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let config = if path.exists() {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: PipelineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        tracing::info!("Loaded TOML config from {:?}", path);
        config
    } else {
        tracing::debug!("No config at {:?}, using defaults", path);
        PipelineConfig::default()
    };

    let config = apply_env_overrides(config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Write configuration atomically, keeping a `.bak` of the previous file
pub fn save_config(config: &PipelineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.exists() {
        let backup_path = path.with_extension("toml.bak");
        let _ = fs::copy(path, &backup_path);
    }

    let contents = toml::to_string_pretty(config)?;
    let temp_path = path.with_extension("toml.tmp");
    fs::write(&temp_path, &contents)?;
    fs::rename(&temp_path, path)?;

    tracing::info!("Saved TOML config to {:?}", path);
    Ok(())
}

fn apply_env_overrides<F>(mut config: PipelineConfig, lookup: F) -> PipelineConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("KAI_LLM_BASE_URL").filter(|v| !v.is_empty()) {
        config.llm.base_url = url;
    }
    if let Some(key) = lookup("KAI_LLM_API_KEY").filter(|v| !v.is_empty()) {
        config.llm.api_key = Some(key);
    }
    if let Some(model) = lookup("KAI_LLM_MODEL").filter(|v| !v.is_empty()) {
        config.llm.model = model;
    }
    if let Some(timeout) = lookup("KAI_GATEWAY_TIMEOUT_SECS") {
        match timeout.parse::<u64>() {
            Ok(t) => config.gateway.timeout_secs = t,
            Err(_) => tracing::warn!("Ignoring invalid KAI_GATEWAY_TIMEOUT_SECS: {}", timeout),
        }
    }
    if let Some(capacity) = lookup("KAI_BUFFER_CAPACITY") {
        match capacity.parse::<usize>() {
            Ok(c) => config.pipeline.buffer_capacity = c,
            Err(_) => tracing::warn!("Ignoring invalid KAI_BUFFER_CAPACITY: {}", capacity),
        }
    }
    config
}
