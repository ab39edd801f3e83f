//! Configuration for the refinement core
//!
//! Plain config structs with defaults, an env loader, and TOML file loading.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default model identifier for new requests
    pub default_model: String,

    /// Retry configuration for model calls
    pub retry: RetryConfig,

    /// External validator configuration
    pub validator: ValidatorConfig,

    /// Reflection loop configuration
    pub reflection: ReflectionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o".to_string(),
            retry: RetryConfig::default(),
            validator: ValidatorConfig::default(),
            reflection: ReflectionConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum total call attempts (first call included)
    pub max_attempts: usize,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Cap on the backoff delay
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,

    /// Add random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// External validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Per-invocation timeout for the validator process
    pub timeout: Duration,

    /// Number of compiler passes over the artifact (LaTeX toolchains
    /// need two for stable positioning)
    pub passes: usize,

    /// Cap on captured stdout+stderr, in bytes
    pub output_limit: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            passes: 2,
            output_limit: 64 * 1024,
        }
    }
}

/// Reflection loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    /// Maximum critique/revise rounds after the initial generation
    pub max_iterations: usize,

    /// Fence language marker tagging the artifact block (fenced contract)
    pub marker: String,

    /// Termination phrase (fenced contract)
    pub sentinel: String,

    /// Use the typed forced-function reply contract instead of fenced
    /// blocks and sentinel phrases
    pub structured: bool,

    /// Sampling temperature for loop queries
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            marker: "latex".to_string(),
            sentinel: "I am done".to_string(),
            structured: true,
            temperature: None,
        }
    }
}

/// Builder for settings
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.settings.default_model = model.into();
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.settings.retry.max_attempts = attempts;
        self
    }

    pub fn max_iterations(mut self, iterations: usize) -> Self {
        self.settings.reflection.max_iterations = iterations;
        self
    }

    pub fn validator_timeout(mut self, timeout: Duration) -> Self {
        self.settings.validator.timeout = timeout;
        self
    }

    pub fn structured_replies(mut self, enabled: bool) -> Self {
        self.settings.reflection.structured = enabled;
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

/// Load settings from environment variables, falling back to defaults
pub fn from_env() -> Settings {
    let mut settings = Settings::default();

    if let Ok(model) = std::env::var("REFINE_MODEL") {
        settings.default_model = model;
    }

    if let Ok(iters) = std::env::var("REFINE_MAX_ITERATIONS") {
        if let Ok(n) = iters.parse::<usize>() {
            settings.reflection.max_iterations = n;
        }
    }

    if let Ok(attempts) = std::env::var("REFINE_MAX_ATTEMPTS") {
        if let Ok(n) = attempts.parse::<usize>() {
            settings.retry.max_attempts = n;
        }
    }

    if let Ok(timeout) = std::env::var("REFINE_VALIDATOR_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            settings.validator.timeout = Duration::from_secs(secs);
        }
    }

    settings
}

/// Load settings from a TOML file
pub fn from_file(path: impl AsRef<Path>) -> Result<Settings, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let settings: Settings = toml::from_str(&contents)?;
    Ok(settings)
}
