//! Configuration types for the replication pipeline
//!
//! Layout:
//!   source   → where change events come from (live engine or recorded file)
//!   target   → the temporal database written to
//!   pipeline → batching, retries, checkpoint and schema-history locations
//!
//! Values support `${VAR}` and `${VAR:-default}` environment expansion so
//! credentials stay out of checked-in files.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    /// Event source settings
    pub source: SourceSettings,

    /// Temporal target connection
    pub target: TargetConfig,

    /// Directory for checkpoint files
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Schema history file (JSON lines, append-only)
    #[serde(default = "default_schema_history_path")]
    pub schema_history_path: PathBuf,

    /// Tables to replicate; empty means all
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Identity field expected in change-event images
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Batching settings
    #[serde(default)]
    pub batch: BatchSettings,

    /// Retry settings for target calls
    #[serde(default)]
    pub retry: RetrySettings,

    /// How long shutdown waits for the in-flight batch (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Event source settings
///
/// When `events_file` is set the pipeline replays that recorded file and
/// exits at end of stream; otherwise it expects a live capture engine
/// configured with the connection fields.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceSettings {
    /// Recorded event file to replay (JSON lines, one envelope per line)
    #[serde(default)]
    pub events_file: Option<PathBuf>,

    /// Logical stream name, used as the checkpoint key
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Upstream database host (live capture)
    #[serde(default)]
    pub host: Option<String>,

    /// Upstream database port (live capture)
    #[serde(default)]
    pub port: Option<u16>,

    /// Upstream database user (live capture)
    #[serde(default)]
    pub user: Option<String>,

    /// Upstream database password (live capture)
    #[serde(default)]
    pub password: Option<String>,
}

impl SourceSettings {
    /// Whether this source replays a recorded file.
    ///
    /// Replay is the only mode the bundled binary drives end to end; a
    /// live-capture source needs an external engine feeding a queue source
    /// through the library API.
    pub fn is_replay(&self) -> bool {
        self.events_file.is_some()
    }
}

/// Temporal target connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Connection URL, e.g. "postgresql://localhost:5439/chronosink"
    pub url: String,

    /// User override (takes precedence over the URL)
    #[serde(default)]
    pub user: Option<String>,

    /// Password override (takes precedence over the URL)
    #[serde(default)]
    pub password: Option<String>,
}

/// Batching settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSettings {
    /// Maximum envelopes per batch
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Timeout for each individual target call (milliseconds)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Retry settings for target calls
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Maximum retry attempts, not counting the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new()
            .with_max_retries(settings.max_retries)
            .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .with_max_delay(Duration::from_millis(settings.max_delay_ms))
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/checkpoints")
}

fn default_schema_history_path() -> PathBuf {
    PathBuf::from("./data/schema_history.jsonl")
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_stream() -> String {
    "default".to_string()
}

fn default_max_events() -> usize {
    500
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl PipelineConfig {
    /// Load configuration from a YAML file, expanding environment variables.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let expanded = Self::expand_env_vars(&content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target.url.is_empty() {
            anyhow::bail!("target.url must not be empty");
        }

        if self.source.stream.is_empty() {
            anyhow::bail!("source.stream must not be empty");
        }

        if self.source.events_file.is_none() && self.source.host.is_none() {
            anyhow::bail!(
                "source needs either 'events_file' (replay) or 'host' (live capture)"
            );
        }

        if self.id_field.is_empty() {
            anyhow::bail!("id_field must not be empty");
        }

        if self.batch.max_events == 0 {
            anyhow::bail!("batch.max_events must be at least 1");
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.batch.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
