use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use telemetry_worker::nats::RedeliveryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream stream holding raw telemetry
    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    /// Subject filter for the consumer
    #[serde(default = "default_nats_subject")]
    pub nats_subject: String,

    /// Durable consumer name
    #[serde(default = "default_nats_consumer_name")]
    pub nats_consumer_name: String,

    /// Max messages per delivery
    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    /// Max wait time for batches in seconds
    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    /// Ack deadline per delivery; this is also the processing time budget
    #[serde(default = "default_nats_ack_wait_secs")]
    pub nats_ack_wait_secs: u64,

    /// How failed records are redelivered
    #[serde(default)]
    pub redelivery_policy: RedeliveryPolicy,

    // ClickHouse configuration
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,

    #[serde(default = "default_clickhouse_database")]
    pub clickhouse_database: String,

    #[serde(default = "default_clickhouse_username")]
    pub clickhouse_username: String,

    #[serde(default)]
    pub clickhouse_password: String,

    #[serde(default = "default_clickhouse_table")]
    pub clickhouse_table: String,

    // Elasticsearch configuration
    #[serde(default = "default_elasticsearch_node")]
    pub elasticsearch_node: String,

    /// Basic auth is only sent when this is non-empty
    #[serde(default)]
    pub elasticsearch_username: String,

    #[serde(default)]
    pub elasticsearch_password: String,

    #[serde(default = "default_elasticsearch_index")]
    pub elasticsearch_index: String,

    // Processing configuration
    /// Attempts per sink call, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Timeout for a single sink call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Time kept in reserve before the delivery deadline
    #[serde(default = "default_min_remaining_time_ms")]
    pub min_remaining_time_ms: u64,

    /// Records validated between two time-budget checks
    #[serde(default = "default_time_check_interval")]
    pub time_check_interval: usize,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

// NATS defaults
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "telemetry".to_string()
}

fn default_nats_subject() -> String {
    "telemetry.>".to_string()
}

fn default_nats_consumer_name() -> String {
    "cloudsight-telemetry-processor".to_string()
}

fn default_nats_batch_size() -> usize {
    100
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_nats_ack_wait_secs() -> u64 {
    30
}

// ClickHouse defaults
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "cloudsight".to_string()
}

fn default_clickhouse_username() -> String {
    "default".to_string()
}

fn default_clickhouse_table() -> String {
    "metrics".to_string()
}

// Elasticsearch defaults
fn default_elasticsearch_node() -> String {
    "http://localhost:9200".to_string()
}

fn default_elasticsearch_index() -> String {
    "cloudsight-traces".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_min_remaining_time_ms() -> u64 {
    10_000
}

fn default_time_check_interval() -> usize {
    100
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_startup_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("CLOUDSIGHT"))
            .build()?
            .try_deserialize()
    }
}
