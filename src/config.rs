use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::core_types::Height;
use crate::fee_correlator::FEE_CHANNEL_CAPACITY;
use crate::pipeline::{PUBLICATION_QUEUE_CAPACITY, REMOVAL_QUEUE_CAPACITY};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub publication: PublicationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// hourly | daily | never
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "marketdata_pub.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

/// Market data publication settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PublicationConfig {
    pub publish_order_updates: bool,
    pub publish_account_balance: bool,
    pub publish_order_book: bool,
    pub publish_block_fee: bool,

    pub publish_kafka: bool,
    pub publish_local: bool,

    pub queue_capacity: usize,
    pub removal_queue_capacity: usize,
    pub fee_channel_capacity: usize,
    /// Blocks below this height are not published
    pub from_height_inclusive: Height,

    pub local: LocalSinkConfig,
    pub kafka: KafkaConfig,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            publish_order_updates: true,
            publish_account_balance: true,
            publish_order_book: true,
            publish_block_fee: true,
            publish_kafka: false,
            publish_local: false,
            queue_capacity: PUBLICATION_QUEUE_CAPACITY,
            removal_queue_capacity: REMOVAL_QUEUE_CAPACITY,
            fee_channel_capacity: FEE_CHANNEL_CAPACITY,
            from_height_inclusive: 0,
            local: LocalSinkConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }
}

impl PublicationConfig {
    /// At least one family is enabled and there is somewhere to send it
    pub fn should_publish_any(&self) -> bool {
        let any_family = self.publish_order_updates
            || self.publish_account_balance
            || self.publish_order_book
            || self.publish_block_fee;
        any_family && (self.publish_kafka || self.publish_local)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LocalSinkConfig {
    pub data_dir: String,
    /// Rotate once the current file grows beyond this
    pub max_size_mb: u64,
    /// Rotated archives older than this are deleted
    pub max_age_days: u64,
}

impl Default for LocalSinkConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            max_size_mb: 1024,
            max_age_days: 7,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TopicConfig {
    pub enabled: bool,
    pub topic: String,
    /// `;`-separated broker list
    pub brokers: String,
}

impl TopicConfig {
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KafkaConfig {
    pub order_updates: TopicConfig,
    pub account_balance: TopicConfig,
    pub order_book: TopicConfig,
    pub block_fee: TopicConfig,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    /// Stop dispatching after a message exhausted its retries
    pub fail_fast: bool,
    pub essential_log_dir: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            order_updates: TopicConfig::default(),
            account_balance: TopicConfig::default(),
            order_book: TopicConfig::default(),
            block_fee: TopicConfig::default(),
            max_retries: 20,
            retry_backoff_ms: 100,
            ack_timeout_ms: 10_000,
            fail_fast: false,
            essential_log_dir: "./data/essential".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Load `config/{env}.yaml`
    pub fn load_env(env: &str) -> Result<Self, ConfigError> {
        Self::load(format!("config/{}.yaml", env))
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }
}
