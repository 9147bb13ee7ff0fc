use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for sitepulse.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Durable log configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Event store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Public HTTP API configuration.
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Consumer loop configuration.
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which part of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// HTTP API only: accepts events and serves stats.
    Ingress,
    /// Consumer loops only.
    Processor,
    /// API and consumers in one process.
    Standalone,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Processor => "processor",
            Self::Standalone => "standalone",
        }
    }

    /// Whether this role runs processor loops.
    pub fn consumes(self) -> bool {
        matches!(self, Self::Processor | Self::Standalone)
    }

    /// Whether this role serves the public HTTP API.
    pub fn serves_api(self) -> bool {
        matches!(self, Self::Ingress | Self::Standalone)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable log backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Kafka,
    Memory,
}

/// Durable log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Backend. Default: kafka.
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,

    /// Kafka bootstrap brokers. Required for the kafka backend.
    #[serde(default)]
    pub brokers: Vec<String>,

    /// Topic carrying encoded events. Required.
    #[serde(default)]
    pub topic: String,

    /// Consumer group shared by all processors. Required for consuming roles.
    #[serde(default)]
    pub group_id: String,

    /// Partition count of the in-process log. Default: 4.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Maximum wait for an append to be confirmed. Default: 5s.
    #[serde(default = "default_append_timeout", with = "humantime_serde")]
    pub append_timeout: Duration,
}

/// Event store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[serde(rename = "clickhouse")]
    ClickHouse,
    Memory,
}

/// Event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend. Default: clickhouse.
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Full clickhouse-rs DSN. Overrides endpoint, database and credentials.
    #[serde(default)]
    pub url: String,

    /// ClickHouse native protocol endpoint (host:port). Required for the
    /// clickhouse backend unless `url` is set.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// Public HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_ingress_addr")]
    pub addr: String,
}

/// Consumer loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Number of independent processor loops. Default: 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pause after a fetch or rewind failure. Default: 1s.
    #[serde(default = "default_fetch_backoff", with = "humantime_serde")]
    pub fetch_backoff: Duration,

    /// Offset commit cadence. Zero commits after every message. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub commit_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Kafka
}

fn default_partitions() -> usize {
    4
}

fn default_append_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::ClickHouse
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "events".to_string()
}

fn default_ingress_addr() -> String {
    ":8080".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_fetch_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            ingress: IngressConfig::default(),
            processor: ProcessorConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            brokers: Vec::new(),
            topic: String::new(),
            group_id: String::new(),
            partitions: default_partitions(),
            append_timeout: default_append_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: String::new(),
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            addr: default_ingress_addr(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fetch_backoff: default_fetch_backoff(),
            commit_interval: Duration::ZERO,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides_from(|name| std::env::var(name).ok());

        Ok(cfg)
    }

    /// Applies the deployment environment variables on top of the file.
    ///
    /// Unset or empty variables leave the file value in place.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.store.url = url;
        }
        if let Some(brokers) = get("KAFKA_BROKER_URLS") {
            self.queue.brokers = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = get("KAFKA_TOPIC") {
            self.queue.topic = topic;
        }
        if let Some(group_id) = get("KAFKA_GROUP_ID") {
            self.queue.group_id = group_id;
        }
    }

    /// Validate the configuration for the given role.
    pub fn validate(&self, role: Role) -> Result<()> {
        if self.queue.topic.is_empty() {
            bail!("queue.topic is required");
        }

        match self.queue.backend {
            QueueBackend::Kafka => {
                if !cfg!(feature = "kafka") {
                    bail!("queue.backend kafka requires building with the kafka feature");
                }
                if self.queue.brokers.iter().all(|b| b.is_empty()) {
                    bail!("queue.brokers is required for the kafka backend");
                }
            }
            QueueBackend::Memory => {
                if role != Role::Standalone {
                    bail!("queue.backend memory is only supported in standalone mode");
                }
                if self.queue.partitions == 0 {
                    bail!("queue.partitions must be positive");
                }
                if self.processor.workers > self.queue.partitions {
                    bail!(
                        "processor.workers ({}) must not exceed queue.partitions ({}) for the memory backend",
                        self.processor.workers,
                        self.queue.partitions
                    );
                }
            }
        }

        if self.queue.append_timeout.is_zero() {
            bail!("queue.append_timeout must be positive");
        }

        match self.store.backend {
            StoreBackend::ClickHouse => {
                if self.store.url.is_empty() && self.store.endpoint.is_empty() {
                    bail!("store.endpoint or store.url is required for the clickhouse backend");
                }
                if self.store.table.is_empty() {
                    bail!("store.table is required");
                }
            }
            StoreBackend::Memory => {
                if role != Role::Standalone {
                    bail!("store.backend memory is only supported in standalone mode");
                }
            }
        }

        if role.consumes() {
            if self.queue.group_id.is_empty() {
                bail!("queue.group_id is required");
            }
            if self.processor.workers == 0 {
                bail!("processor.workers must be positive");
            }
            if self.processor.fetch_backoff.is_zero() {
                bail!("processor.fetch_backoff must be positive");
            }
        }

        if role.serves_api() && self.ingress.addr.is_empty() {
            bail!("ingress.addr is required");
        }

        Ok(())
    }
}
