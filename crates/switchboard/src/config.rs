//! Bus Configuration
//!
//! Defines the structure of `switchboard.toml` and how it is loaded and
//! validated.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use switchboard_common::BodyCodec;

use crate::isolation::RegistrySettings;

/// Characters that may not appear in a queue key.
pub const INVALID_KEY_CHARS: &str = "~!@#$%&*()<>[]{}/;'|";

/// Longest allowed queue key.
pub const MAX_KEY_LEN: usize = 255;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Handler path is not set")]
    MissingHandlerPath,

    #[error("No queues are configured")]
    NoQueues,

    #[error("Queue {id} has an invalid key '{key}': {reason}")]
    InvalidQueueKey { id: u32, key: String, reason: String },

    #[error("Duplicate queue key '{0}'")]
    DuplicateQueueKey(String),

    #[error("Duplicate queue id {0}")]
    DuplicateQueueId(u32),
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Types
// ─────────────────────────────────────────────────────────────────────────────

/// Bus configuration (switchboard.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Directory scanned for plugin subdirectories
    #[serde(default)]
    pub handler_path: PathBuf,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    #[default]
    Process,
    Thread,
}

/// Isolation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default)]
    pub boundary: BoundaryKind,
    /// Plugin host executable (defaults to searching next to this binary,
    /// then PATH)
    pub host_binary: Option<PathBuf>,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub exclude_faulted_hosts: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            boundary: BoundaryKind::default(),
            host_binary: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            exclude_faulted_hosts: true,
        }
    }
}

impl IsolationConfig {
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            exclude_faulted: self.exclude_faulted_hosts,
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Queue descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub id: u32,
    pub key: String,
    #[serde(default)]
    pub path: String,
    /// Codec for messages that do not name one
    #[serde(default = "default_codec")]
    pub codec: BodyCodec,
}

impl QueueConfig {
    pub fn new(id: u32, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id,
            path: format!("memory://{key}"),
            key,
            codec: default_codec(),
        }
    }

    pub fn with_codec(mut self, codec: BodyCodec) -> Self {
        self.codec = codec;
        self
    }
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_codec() -> BodyCodec {
    BodyCodec::Json
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading & Validation
// ─────────────────────────────────────────────────────────────────────────────

impl BusConfig {
    pub fn new(handler_path: impl Into<PathBuf>) -> Self {
        Self {
            handler_path: handler_path.into(),
            isolation: IsolationConfig::default(),
            dispatch: DispatchConfig::default(),
            queues: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_boundary(mut self, boundary: BoundaryKind) -> Self {
        self.isolation.boundary = boundary;
        self
    }

    /// Load configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        let config: BusConfig = toml::from_str(&content)?;
        info!(
            "Loaded configuration from {} ({} queue(s))",
            path.display(),
            config.queues.len()
        );
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handler_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingHandlerPath);
        }
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        let mut keys = HashSet::new();
        let mut ids = HashSet::new();
        for queue in &self.queues {
            validate_key(queue)?;
            if !keys.insert(queue.key.as_str()) {
                return Err(ConfigError::DuplicateQueueKey(queue.key.clone()));
            }
            if !ids.insert(queue.id) {
                return Err(ConfigError::DuplicateQueueId(queue.id));
            }
        }
        Ok(())
    }

    pub fn queue(&self, key: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.key == key)
    }
}

fn validate_key(queue: &QueueConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidQueueKey {
        id: queue.id,
        key: queue.key.clone(),
        reason: reason.to_string(),
    };

    if queue.key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if queue.key.chars().count() > MAX_KEY_LEN {
        return Err(invalid("key is longer than 255 characters"));
    }
    if let Some(c) = queue.key.chars().find(|c| INVALID_KEY_CHARS.contains(*c)) {
        return Err(invalid(&format!("character '{c}' is not allowed")));
    }
    Ok(())
}
