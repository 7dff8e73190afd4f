//! Execution configuration with builder pattern
//!
//! Provides a unified configuration for retry policy, transport locking,
//! diagnostics and batch limits with sane defaults. Values can come from
//! code, environment variables (including a `.env` file) or a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::api::constants::{
    DEFAULT_MAX_BATCHES, DEFAULT_MAX_REQUESTS_PER_BATCH, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_PAUSE_MS, EVENTUAL_CONSISTENCY_ENTITIES,
};

/// Whether calls through one transport are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportLocking {
    /// One call at a time per engine (safe for non-thread-safe transports)
    #[default]
    Enabled,
    /// Calls may overlap; only use with a transport that tolerates it
    Disabled,
}

impl TransportLocking {
    pub fn is_enabled(&self) -> bool {
        matches!(self, TransportLocking::Enabled)
    }
}

impl From<bool> for TransportLocking {
    fn from(enabled: bool) -> Self {
        if enabled {
            TransportLocking::Enabled
        } else {
            TransportLocking::Disabled
        }
    }
}

/// Unconditional retry of reads on entities with read-after-write gaps
///
/// Records of these entities may not be visible right after they are written,
/// and the service reports that as a generic error. Single-record reads and
/// queries against them are retried whatever the error says.
#[derive(Debug, Clone, PartialEq)]
pub struct EventualConsistencyPolicy {
    pub enabled: bool,
    /// Entity logical names the policy applies to
    pub entities: Vec<String>,
}

impl Default for EventualConsistencyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            entities: EVENTUAL_CONSISTENCY_ENTITIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EventualConsistencyPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether reads of `entity_name` are retried unconditionally
    pub fn applies_to(&self, entity_name: &str) -> bool {
        self.enabled
            && self
                .entities
                .iter()
                .any(|e| e.eq_ignore_ascii_case(entity_name))
    }
}

/// Limits enforced by the batch registry
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Maximum number of batches held at once
    pub max_batches: usize,
    /// Maximum number of requests in one batch
    pub max_requests_per_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batches: DEFAULT_MAX_BATCHES,
            max_requests_per_batch: DEFAULT_MAX_REQUESTS_PER_BATCH,
        }
    }
}

/// Global execution configuration for organization service calls
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Base pause between retries
    pub retry_pause: Duration,
    pub locking: TransportLocking,
    pub eventual_consistency: EventualConsistencyPolicy,
    /// Caller-supplied id attached to every diagnostic record
    pub session_tracking_id: Option<Uuid>,
    pub batch: BatchConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_pause: Duration::from_millis(DEFAULT_RETRY_PAUSE_MS),
            locking: TransportLocking::Enabled,
            eventual_consistency: EventualConsistencyPolicy::default(),
            session_tracking_id: None,
            batch: BatchConfig::default(),
        }
    }
}

/// Environment variable names read by [`ExecutionConfig::from_env`]
pub mod env_keys {
    pub const MAX_RETRIES: &str = "DYNAMICS_MAX_RETRIES";
    pub const RETRY_PAUSE_MS: &str = "DYNAMICS_RETRY_PAUSE_MS";
    pub const CROSS_THREAD_LOCKING: &str = "DYNAMICS_CROSS_THREAD_LOCKING";
    pub const EVENTUAL_CONSISTENCY_RETRY: &str = "DYNAMICS_EVENTUAL_CONSISTENCY_RETRY";
    pub const SESSION_TRACKING_ID: &str = "DYNAMICS_SESSION_TRACKING_ID";
    pub const MAX_BATCHES: &str = "DYNAMICS_MAX_BATCHES";
    pub const MAX_REQUESTS_PER_BATCH: &str = "DYNAMICS_MAX_REQUESTS_PER_BATCH";
}

/// On-disk representation, every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    retry: RetrySection,
    locking: LockingSection,
    diagnostics: DiagnosticsSection,
    batch: BatchSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetrySection {
    max_retries: Option<u32>,
    pause_ms: Option<u64>,
    eventual_consistency: Option<bool>,
    eventual_consistency_entities: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LockingSection {
    cross_thread: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiagnosticsSection {
    session_tracking_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BatchSection {
    max_batches: Option<usize>,
    max_requests_per_batch: Option<usize>,
}

impl ExecutionConfig {
    /// Create a new builder for ExecutionConfig
    pub fn builder() -> ExecutionConfigBuilder {
        ExecutionConfigBuilder::new()
    }

    /// No retries and no pauses (for testing)
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            retry_pause: Duration::ZERO,
            eventual_consistency: EventualConsistencyPolicy::disabled(),
            ..Self::default()
        }
    }

    /// Load config from process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self> {
        // A missing .env file is not an error
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load config from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(env_keys::MAX_RETRIES) {
            config.max_retries = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", env_keys::MAX_RETRIES, value))?;
        }
        if let Some(value) = lookup(env_keys::RETRY_PAUSE_MS) {
            let ms: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", env_keys::RETRY_PAUSE_MS, value))?;
            config.retry_pause = Duration::from_millis(ms);
        }
        if let Some(value) = lookup(env_keys::CROSS_THREAD_LOCKING) {
            config.locking = parse_bool(env_keys::CROSS_THREAD_LOCKING, &value)?.into();
        }
        if let Some(value) = lookup(env_keys::EVENTUAL_CONSISTENCY_RETRY) {
            config.eventual_consistency.enabled =
                parse_bool(env_keys::EVENTUAL_CONSISTENCY_RETRY, &value)?;
        }
        if let Some(value) = lookup(env_keys::SESSION_TRACKING_ID) {
            let id = Uuid::parse_str(value.trim()).with_context(|| {
                format!("Invalid {}: '{}'", env_keys::SESSION_TRACKING_ID, value)
            })?;
            config.session_tracking_id = Some(id);
        }
        if let Some(value) = lookup(env_keys::MAX_BATCHES) {
            config.batch.max_batches = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", env_keys::MAX_BATCHES, value))?;
        }
        if let Some(value) = lookup(env_keys::MAX_REQUESTS_PER_BATCH) {
            config.batch.max_requests_per_batch = value.trim().parse().with_context(|| {
                format!("Invalid {}: '{}'", env_keys::MAX_REQUESTS_PER_BATCH, value)
            })?;
        }

        Ok(config)
    }

    /// Parse config from TOML text; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).context("Failed to parse execution config")?;

        let mut config = Self::default();
        if let Some(max_retries) = file.retry.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(pause_ms) = file.retry.pause_ms {
            config.retry_pause = Duration::from_millis(pause_ms);
        }
        if let Some(enabled) = file.retry.eventual_consistency {
            config.eventual_consistency.enabled = enabled;
        }
        if let Some(entities) = file.retry.eventual_consistency_entities {
            config.eventual_consistency.entities = entities;
        }
        if let Some(cross_thread) = file.locking.cross_thread {
            config.locking = cross_thread.into();
        }
        config.session_tracking_id = file.diagnostics.session_tracking_id;
        if let Some(max_batches) = file.batch.max_batches {
            config.batch.max_batches = max_batches;
        }
        if let Some(max_requests) = file.batch.max_requests_per_batch {
            config.batch.max_requests_per_batch = max_requests;
        }

        Ok(config)
    }

    /// Load config from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Default config file location (`<config dir>/dynamics-client/execution.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dynamics-client").join("execution.toml"))
    }

    /// Load the default config file if it exists, otherwise defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid {}: '{}' (expected true/false)", key, value),
    }
}

/// Builder for ExecutionConfig
#[derive(Debug)]
pub struct ExecutionConfigBuilder {
    config: ExecutionConfig,
}

impl ExecutionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ExecutionConfig::default(),
        }
    }

    /// Set max retries after the first attempt
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the base pause between retries
    pub fn retry_pause(mut self, pause: Duration) -> Self {
        self.config.retry_pause = pause;
        self
    }

    /// Enable/disable serialization of transport calls
    pub fn cross_thread_locking(mut self, enabled: bool) -> Self {
        self.config.locking = enabled.into();
        self
    }

    /// Configure the eventual-consistency retry policy
    pub fn eventual_consistency(mut self, policy: EventualConsistencyPolicy) -> Self {
        self.config.eventual_consistency = policy;
        self
    }

    /// Enable/disable the eventual-consistency retry policy
    pub fn eventual_consistency_retry(mut self, enabled: bool) -> Self {
        self.config.eventual_consistency.enabled = enabled;
        self
    }

    /// Attach a session tracking id to diagnostics
    pub fn session_tracking_id(mut self, id: Uuid) -> Self {
        self.config.session_tracking_id = Some(id);
        self
    }

    /// Configure batch limits
    pub fn batch_config(mut self, batch: BatchConfig) -> Self {
        self.config.batch = batch;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ExecutionConfig {
        self.config
    }
}

impl Default for ExecutionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
