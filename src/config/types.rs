use crate::gateway::RetryPolicy;
use crate::writer::{BatchCompression, CommitPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log: LogConfig,
    pub gateway: GatewayConfig,
    pub writer: WriterConfig,
    pub object_store: ObjectStoreConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    Memory,
    #[default]
    DuckDb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub backend: LogBackend,
    /// DuckDB file holding the log. Ignored by the memory backend.
    pub path: PathBuf,
    pub topic: String,
    pub partitions: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::DuckDb,
            path: PathBuf::from("~/.local/share/tigerscope/log.duckdb"),
            topic: "telemetry.events".to_string(),
            partitions: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub listen: String,
    /// Stamped on every accepted event as `environment`.
    pub environment: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub publish: PublishConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:8080".to_string(),
            environment: "local".to_string(),
            request_timeout: Duration::from_secs(3),
            publish: PublishConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_retries: retry.max_retries,
            initial_backoff: retry.initial_backoff,
            max_backoff: retry.max_backoff,
        }
    }
}

impl PublishConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    pub enabled: bool,
    /// Consumer group whose committed offsets the writer resumes from.
    pub group: String,
    /// Partitions to claim. `None` claims every partition of the topic.
    pub partitions: Option<Vec<u32>>,
    pub flush_max_events: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub commit: CommitPolicy,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub key_prefix: String,
    pub compression: BatchCompression,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: "tigerscope-writer".to_string(),
            partitions: None,
            flush_max_events: 500,
            flush_interval: Duration::from_secs(5),
            commit: CommitPolicy::OnAppend,
            shutdown_grace: Duration::from_secs(10),
            key_prefix: "telemetry".to_string(),
            compression: BatchCompression::Snappy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    #[default]
    Memory,
    Local,
    S3,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectStoreConfig {
    pub backend: ObjectStoreBackend,
    /// Root directory for the local backend.
    pub path: Option<PathBuf>,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Permit plain-HTTP endpoints, as local MinIO deployments need.
    pub allow_http: bool,
}
