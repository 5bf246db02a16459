use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline per task dispatch when the task declares none. 0 disables it.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// `source` field on published events.
    #[serde(default = "default_source")]
    pub source: String,
    /// TTL for persisted execution snapshots. 0 keeps them forever.
    #[serde(default)]
    pub state_ttl_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            state_ttl_secs: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-agent admission limit. Absent means unlimited.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Extra or overriding prices, merged over the built-in table.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        secs_to_duration(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        secs_to_duration(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_secs: default_window_secs(),
            max_tracked_keys: default_max_tracked_keys(),
        }
    }
}

/// USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the sqlite backend.
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Resolve the sqlite path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        let raw = self.path.as_deref().unwrap_or("~/.weft/state.db");
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing-subscriber filter directive; RUST_LOG wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_task_timeout_secs() -> u64 { 300 }
fn default_source() -> String { "orchestrator".to_string() }
fn default_event_capacity() -> usize { 256 }
fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout_secs() -> f64 { 60.0 }
fn default_success_threshold() -> u32 { 2 }
fn default_max_calls() -> usize { 10 }
fn default_window_secs() -> f64 { 60.0 }
fn default_max_tracked_keys() -> usize { 10_000 }
fn default_log_filter() -> String { "weft=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject numeric settings that cannot become a delay or a price.
    pub fn validate(&self) -> Result<()> {
        check_secs(
            "resilience.circuit_breaker.recovery_timeout_secs",
            self.resilience.circuit_breaker.recovery_timeout_secs,
        )?;
        if let Some(rl) = &self.resilience.rate_limit {
            check_secs("resilience.rate_limit.window_secs", rl.window_secs)?;
        }
        for (model, price) in &self.resilience.pricing {
            for (field, value) in [("prompt", price.prompt), ("completion", price.completion)] {
                if !value.is_finite() || value < 0.0 {
                    return Err(WeftError::Config(format!(
                        "resilience.pricing.{}.{} must be a non-negative number, got {}",
                        model, field, value
                    )));
                }
            }
        }
        Ok(())
    }

    /// Load from `path` if given, else fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

fn check_secs(field: &str, secs: f64) -> Result<()> {
    if secs.is_finite() && secs >= 0.0 && Duration::try_from_secs_f64(secs).is_ok() {
        Ok(())
    } else {
        Err(WeftError::Config(format!(
            "{} must be a non-negative number of seconds, got {}",
            field, secs
        )))
    }
}

/// Seconds as a `Duration`. Negative and NaN map to zero, values beyond
/// `Duration::MAX` saturate.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
