//! Runtime settings for the relay.
//!
//! Settings start from defaults and are overridden by environment variables.
//! The CLI applies its own flags on top.

use std::time::Duration;

use thiserror::Error;

use crate::generation::{LlmSettings, MockGenerator};
use crate::scheduler::{QueueConfig, WorkerPoolConfig};

/// Errors that can occur while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings shared by the dispatcher, workers and CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    // Redis settings
    /// Full connection URL; built from host, port, password and db if unset.
    pub redis_url: Option<String>,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: u32,

    // Queue settings
    /// Name of the work queue.
    pub queue_name: String,
    /// Deliveries one worker holds at a time.
    pub prefetch_count: usize,
    /// Redeliveries before a message is dead-lettered.
    pub max_redeliveries: u32,
    /// Lease on a dequeued message.
    pub visibility_timeout: Duration,

    // Task record settings
    /// Lifetime of a task record.
    pub task_ttl: Duration,
    /// Key prefix for task records.
    pub task_prefix: String,

    // Worker settings
    pub generation_timeout: Duration,
    pub num_workers: usize,

    // Mock generator settings
    /// Lower bound of the simulated delay in seconds.
    pub mock_min_delay: f64,
    /// Upper bound of the simulated delay in seconds.
    pub mock_max_delay: f64,

    // LLM settings
    pub llm_api_base: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_temperature: f64,
}

impl Default for Settings {
    fn default() -> Self {
        let llm = LlmSettings::default();
        Self {
            redis_url: None,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,

            queue_name: crate::scheduler::queue::DEFAULT_QUEUE_NAME.to_string(),
            prefetch_count: 1,
            max_redeliveries: crate::scheduler::message::DEFAULT_MAX_REDELIVERIES,
            visibility_timeout: crate::scheduler::queue::DEFAULT_VISIBILITY_TIMEOUT,

            task_ttl: crate::store::DEFAULT_TASK_TTL,
            task_prefix: crate::store::DEFAULT_TASK_PREFIX.to_string(),

            generation_timeout: Duration::from_secs(120),
            num_workers: 1,

            mock_min_delay: crate::generation::mock::DEFAULT_MIN_DELAY_SECS,
            mock_max_delay: crate::generation::mock::DEFAULT_MAX_DELAY_SECS,

            llm_api_base: None,
            llm_api_key: None,
            llm_model: llm.model,
            llm_max_tokens: llm.max_tokens,
            llm_temperature: llm.temperature,
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Full Redis URL (overrides the four below)
    /// - `REDIS_HOST` / `REDIS_PORT` / `REDIS_PASSWORD` / `REDIS_DB`
    /// - `TEXT_GENERATION_QUEUE`: Queue name (default: text_generation_tasks)
    /// - `PREFETCH_COUNT`: Deliveries per worker (default: 1)
    /// - `MAX_REDELIVERIES`: Redeliveries before dead-lettering (default: 3)
    /// - `VISIBILITY_TIMEOUT_SECS`: Delivery lease (default: 300)
    /// - `TASK_TTL`: Record lifetime in seconds (default: 3600)
    /// - `TASK_PREFIX`: Record key prefix (default: task:)
    /// - `GENERATION_TIMEOUT_SECS`: Per-task generation limit (default: 120)
    /// - `NUM_WORKERS`: Workers per pool (default: 1)
    /// - `MOCK_MIN_DELAY` / `MOCK_MAX_DELAY`: Mock delay bounds (default: 2.0 / 5.0)
    /// - `LLM_API_BASE` / `LLM_API_KEY`: OpenAI-compatible endpoint
    /// - `LLM_MODEL` / `LLM_MAX_TOKENS` / `LLM_TEMPERATURE`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Redis settings
        config.redis_url = lookup("REDIS_URL").filter(|v| !v.is_empty());

        if let Some(val) = lookup("REDIS_HOST") {
            config.redis_host = val;
        }

        if let Some(val) = lookup("REDIS_PORT") {
            config.redis_port = parse_env_value(&val, "REDIS_PORT")?;
        }

        config.redis_password = lookup("REDIS_PASSWORD").filter(|v| !v.is_empty());

        if let Some(val) = lookup("REDIS_DB") {
            config.redis_db = parse_env_value(&val, "REDIS_DB")?;
        }

        // Queue settings
        if let Some(val) = lookup("TEXT_GENERATION_QUEUE") {
            config.queue_name = val;
        }

        if let Some(val) = lookup("PREFETCH_COUNT") {
            config.prefetch_count = parse_env_value(&val, "PREFETCH_COUNT")?;
        }

        if let Some(val) = lookup("MAX_REDELIVERIES") {
            config.max_redeliveries = parse_env_value(&val, "MAX_REDELIVERIES")?;
        }

        if let Some(val) = lookup("VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "VISIBILITY_TIMEOUT_SECS")?;
            config.visibility_timeout = Duration::from_secs(secs);
        }

        // Task record settings
        if let Some(val) = lookup("TASK_TTL") {
            let secs: u64 = parse_env_value(&val, "TASK_TTL")?;
            config.task_ttl = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("TASK_PREFIX") {
            config.task_prefix = val;
        }

        // Worker settings
        if let Some(val) = lookup("GENERATION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "GENERATION_TIMEOUT_SECS")?;
            config.generation_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "NUM_WORKERS")?;
        }

        // Mock generator settings
        if let Some(val) = lookup("MOCK_MIN_DELAY") {
            config.mock_min_delay = parse_env_value(&val, "MOCK_MIN_DELAY")?;
        }

        if let Some(val) = lookup("MOCK_MAX_DELAY") {
            config.mock_max_delay = parse_env_value(&val, "MOCK_MAX_DELAY")?;
        }

        // LLM settings
        config.llm_api_base = lookup("LLM_API_BASE").filter(|v| !v.is_empty());
        config.llm_api_key = lookup("LLM_API_KEY").filter(|v| !v.is_empty());

        if let Some(val) = lookup("LLM_MODEL") {
            config.llm_model = val;
        }

        if let Some(val) = lookup("LLM_MAX_TOKENS") {
            config.llm_max_tokens = parse_env_value(&val, "LLM_MAX_TOKENS")?;
        }

        if let Some(val) = lookup("LLM_TEMPERATURE") {
            config.llm_temperature = parse_env_value(&val, "LLM_TEMPERATURE")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.prefetch_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "prefetch_count must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        if self.task_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_ttl must be greater than 0".to_string(),
            ));
        }

        if self.generation_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "generation_timeout must be greater than 0".to_string(),
            ));
        }

        // A reclaimed delivery must find its abandoned claim already stale
        if self.visibility_timeout <= self.generation_timeout * 2 {
            return Err(ConfigError::ValidationFailed(format!(
                "visibility_timeout ({:?}) must exceed twice generation_timeout ({:?})",
                self.visibility_timeout, self.generation_timeout
            )));
        }

        if self.mock_min_delay < 0.0 || self.mock_max_delay < self.mock_min_delay {
            return Err(ConfigError::ValidationFailed(
                "mock delays must satisfy 0 <= mock_min_delay <= mock_max_delay".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(ConfigError::ValidationFailed(
                "llm_temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the Redis connection URL.
    pub fn redis_url(&self) -> String {
        if let Some(url) = &self.redis_url {
            return url.clone();
        }

        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    /// Queue configuration derived from these settings.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(&self.queue_name)
            .with_visibility_timeout(self.visibility_timeout)
            .with_max_redeliveries(self.max_redeliveries)
    }

    /// Worker pool configuration derived from these settings.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers)
            .with_prefetch(self.prefetch_count)
            .with_generation_timeout(self.generation_timeout)
    }

    /// Sampling settings for the LLM generator.
    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            model: self.llm_model.clone(),
            max_tokens: self.llm_max_tokens,
            temperature: self.llm_temperature,
        }
    }

    /// Mock generator with the configured delay bounds.
    pub fn mock_generator(&self) -> MockGenerator {
        MockGenerator::from_secs(self.mock_min_delay, self.mock_max_delay)
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set the mock delay bounds.
    pub fn with_mock_delays(mut self, min: f64, max: f64) -> Self {
        self.mock_min_delay = min;
        self.mock_max_delay = max;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
