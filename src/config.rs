//! Configuration constants and environment variable parsing for the gateway.
//!
//! This module centralizes all server configuration to make tuning and
//! deployment easier. All values can be overridden via environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// ENVIRONMENT VARIABLE NAME CONSTANTS
// =============================================================================

/// Public WebSocket bind address (default: 127.0.0.1:8080)
pub const WS_ADDR: &str = "WS_ADDR";
/// Kafka broker addresses, comma separated (default: 127.0.0.1:9092)
pub const KAFKA_BROKERS: &str = "KAFKA_BROKERS";
/// Kafka consumer group ID (default: odin-gateway)
pub const KAFKA_CONSUMER_GROUP: &str = "KAFKA_CONSUMER_GROUP";
/// Total connection capacity across all shards (default: 10000)
pub const WS_MAX_CONNECTIONS: &str = "WS_MAX_CONNECTIONS";
/// Number of shards (default: 4)
pub const WS_WORKER_POOL_SIZE: &str = "WS_WORKER_POOL_SIZE";
/// Per-shard bus subscriber queue capacity (default: 1024)
pub const WS_WORKER_QUEUE_SIZE: &str = "WS_WORKER_QUEUE_SIZE";
/// Maximum tracked async tasks before new connections are rejected (default: 100000)
pub const WS_MAX_GOROUTINES: &str = "WS_MAX_GOROUTINES";
/// Kafka routing rate limit, records/sec (default: 50000)
pub const WS_MAX_KAFKA_RATE: &str = "WS_MAX_KAFKA_RATE";
/// Shard broadcast rate limit, messages/sec (default: 100000)
pub const WS_MAX_BROADCAST_RATE: &str = "WS_MAX_BROADCAST_RATE";
/// CPU allocation hint in cores; 0 = discover from cgroup (default: 0)
pub const WS_CPU_LIMIT: &str = "WS_CPU_LIMIT";
/// Memory limit in bytes (default: 2 GiB)
pub const WS_MEMORY_LIMIT: &str = "WS_MEMORY_LIMIT";
/// CPU percentage above which new connections are rejected (default: 75)
pub const WS_CPU_REJECT_THRESHOLD: &str = "WS_CPU_REJECT_THRESHOLD";
/// CPU percentage above which Kafka consumption pauses (default: 80, >= reject)
pub const WS_CPU_PAUSE_THRESHOLD: &str = "WS_CPU_PAUSE_THRESHOLD";
/// Resource sampling interval in seconds (default: 5)
pub const METRICS_INTERVAL: &str = "METRICS_INTERVAL";
/// Log level: debug|info|warn|error (default: info)
pub const LOG_LEVEL: &str = "LOG_LEVEL";
/// Log format: json|pretty (default: pretty)
pub const LOG_FORMAT: &str = "LOG_FORMAT";
/// Enable connection-rate admission control (default: false)
pub const WS_CONN_RATE_LIMIT_ENABLED: &str = "WS_CONN_RATE_LIMIT_ENABLED";
/// Per-IP sustained connection rate, connections/sec (default: 5)
pub const WS_CONN_RATE_PER_IP: &str = "WS_CONN_RATE_PER_IP";
/// Per-IP connection burst (default: 10)
pub const WS_CONN_BURST_PER_IP: &str = "WS_CONN_BURST_PER_IP";
/// Global sustained connection rate, connections/sec (default: 500)
pub const WS_CONN_RATE_GLOBAL: &str = "WS_CONN_RATE_GLOBAL";
/// Global connection burst (default: 1000)
pub const WS_CONN_BURST_GLOBAL: &str = "WS_CONN_BURST_GLOBAL";
/// Trusted proxy IPs for x-forwarded-for parsing, comma separated
pub const WS_TRUSTED_PROXY_IPS: &str = "WS_TRUSTED_PROXY_IPS";
/// Per-client outbound queue capacity (default: 512)
pub const WS_CLIENT_QUEUE_SIZE: &str = "WS_CLIENT_QUEUE_SIZE";
/// Internal host shards bind their listeners on (default: 127.0.0.1)
pub const WS_SHARD_HOST: &str = "WS_SHARD_HOST";

// =============================================================================
// DEFAULT CONSTANTS
// =============================================================================

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_KAFKA_BROKERS: &str = "127.0.0.1:9092";
pub const DEFAULT_CONSUMER_GROUP: &str = "odin-gateway";
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_SHARD_COUNT: usize = 4;
pub const DEFAULT_SHARD_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_MAX_TASKS: usize = 100_000;
pub const DEFAULT_MAX_KAFKA_RATE: f64 = 50_000.0;
pub const DEFAULT_MAX_BROADCAST_RATE: f64 = 100_000.0;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_CPU_REJECT_THRESHOLD: f64 = 75.0;
pub const DEFAULT_CPU_PAUSE_THRESHOLD: f64 = 80.0;
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CLIENT_QUEUE_SIZE: usize = 512;

/// How long the read pump waits for any inbound frame before giving up.
pub const PONG_WAIT: Duration = Duration::from_secs(30);
/// Ping cadence; 90% of the pong wait so a healthy client always answers in time.
pub const PING_PERIOD: Duration = Duration::from_secs(27);
/// Per-frame write deadline.
pub const WRITE_WAIT: Duration = Duration::from_secs(5);
/// Slot-aware proxy dial handshake timeout.
pub const PROXY_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Graceful shutdown drain window.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Per-client message rate limit: bucket capacity.
pub const CLIENT_RATE_BURST: u64 = 100;
/// Per-client message rate limit: refill tokens per second.
pub const CLIENT_RATE_PER_SEC: f64 = 10.0;
/// Replay buffer size per client.
pub const REPLAY_BUFFER_SIZE: usize = 100;
/// Consecutive failed enqueues before a slow client is disconnected.
pub const SLOW_CLIENT_MAX_FAILURES: u32 = 3;
/// Bus drain batch size per fan-out iteration.
pub const BUS_BATCH_SIZE: usize = 100;
/// Central bus publish channel capacity.
pub const BUS_PUBLISH_CAPACITY: usize = 4096;

/// The Kafka topics this gateway consumes.
pub const KAFKA_TOPICS: [&str; 8] = [
    "odin.trades",
    "odin.liquidity",
    "odin.metadata",
    "odin.social",
    "odin.community",
    "odin.creation",
    "odin.analytics",
    "odin.balances",
];

// =============================================================================
// ENVIRONMENT VARIABLE PARSING
// =============================================================================

/// Helper to parse env vars with warning on parse failure.
///
/// When an env var is set but cannot be parsed, logs a warning and uses the
/// default. This prevents silent fallback that could confuse operators.
pub fn parse_env_var_with_warning<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    match std::env::var(var_name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(var = var_name, value = %value, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(var_name: &str, default: bool) -> bool {
    match std::env::var(var_name) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Connection-rate admission settings (per-IP and global).
#[derive(Debug, Clone)]
pub struct ConnRateConfig {
    pub enabled: bool,
    pub per_ip_rate: f64,
    pub per_ip_burst: u64,
    pub global_rate: f64,
    pub global_burst: u64,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_addr: SocketAddr,
    pub shard_host: String,
    pub kafka_brokers: String,
    pub kafka_consumer_group: String,
    /// Empty brokers string disables the consumer pool entirely.
    pub kafka_enabled: bool,
    pub max_connections: usize,
    pub shard_count: usize,
    pub shard_queue_size: usize,
    pub client_queue_size: usize,
    pub max_tasks: usize,
    pub max_kafka_rate: f64,
    pub max_broadcast_rate: f64,
    pub cpu_limit_cores: f64,
    pub memory_limit_bytes: u64,
    pub cpu_reject_threshold: f64,
    pub cpu_pause_threshold: f64,
    pub metrics_interval: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
    pub conn_rate: ConnRateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_addr: DEFAULT_WS_ADDR.parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 8080))
            }),
            shard_host: "127.0.0.1".to_string(),
            kafka_brokers: DEFAULT_KAFKA_BROKERS.to_string(),
            kafka_consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            kafka_enabled: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shard_count: DEFAULT_SHARD_COUNT,
            shard_queue_size: DEFAULT_SHARD_QUEUE_SIZE,
            client_queue_size: DEFAULT_CLIENT_QUEUE_SIZE,
            max_tasks: DEFAULT_MAX_TASKS,
            max_kafka_rate: DEFAULT_MAX_KAFKA_RATE,
            max_broadcast_rate: DEFAULT_MAX_BROADCAST_RATE,
            cpu_limit_cores: 0.0,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            cpu_reject_threshold: DEFAULT_CPU_REJECT_THRESHOLD,
            cpu_pause_threshold: DEFAULT_CPU_PAUSE_THRESHOLD,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            conn_rate: ConnRateConfig {
                enabled: false,
                per_ip_rate: 5.0,
                per_ip_burst: 10,
                global_rate: 500.0,
                global_burst: 1000,
            },
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Unparseable optional values fall back to defaults with a warning; an
    /// unparseable bind address is a hard error because the operator clearly
    /// intended something specific.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ws_addr_raw =
            std::env::var(WS_ADDR).unwrap_or_else(|_| DEFAULT_WS_ADDR.to_string());
        let ws_addr: SocketAddr = ws_addr_raw.parse().map_err(|_| ConfigError::Invalid {
            var: WS_ADDR,
            value: ws_addr_raw.clone(),
        })?;

        let kafka_brokers = std::env::var(KAFKA_BROKERS)
            .unwrap_or_else(|_| DEFAULT_KAFKA_BROKERS.to_string());
        let kafka_enabled = !kafka_brokers.trim().is_empty();

        let max_connections =
            parse_env_var_with_warning(WS_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS).max(1);
        let shard_count =
            parse_env_var_with_warning(WS_WORKER_POOL_SIZE, DEFAULT_SHARD_COUNT).max(1);

        let cpu_reject_threshold = parse_env_var_with_warning(
            WS_CPU_REJECT_THRESHOLD,
            DEFAULT_CPU_REJECT_THRESHOLD,
        );
        // The pause threshold gates the Kafka consumer, which must outlast
        // admission rejection; clamp it so pause >= reject always holds.
        let mut cpu_pause_threshold = parse_env_var_with_warning(
            WS_CPU_PAUSE_THRESHOLD,
            DEFAULT_CPU_PAUSE_THRESHOLD,
        );
        if cpu_pause_threshold < cpu_reject_threshold {
            tracing::warn!(
                pause = cpu_pause_threshold,
                reject = cpu_reject_threshold,
                "pause threshold below reject threshold, clamping to reject"
            );
            cpu_pause_threshold = cpu_reject_threshold;
        }

        let metrics_interval_secs: u64 = parse_env_var_with_warning(
            METRICS_INTERVAL,
            DEFAULT_METRICS_INTERVAL_SECS,
        )
        .max(1);

        Ok(Self {
            ws_addr,
            shard_host: std::env::var(WS_SHARD_HOST)
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            kafka_brokers,
            kafka_consumer_group: std::env::var(KAFKA_CONSUMER_GROUP)
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            kafka_enabled,
            max_connections,
            shard_count,
            shard_queue_size: parse_env_var_with_warning(
                WS_WORKER_QUEUE_SIZE,
                DEFAULT_SHARD_QUEUE_SIZE,
            )
            .max(1),
            client_queue_size: parse_env_var_with_warning(
                WS_CLIENT_QUEUE_SIZE,
                DEFAULT_CLIENT_QUEUE_SIZE,
            )
            .max(1),
            max_tasks: parse_env_var_with_warning(WS_MAX_GOROUTINES, DEFAULT_MAX_TASKS).max(1),
            max_kafka_rate: parse_env_var_with_warning(WS_MAX_KAFKA_RATE, DEFAULT_MAX_KAFKA_RATE),
            max_broadcast_rate: parse_env_var_with_warning(
                WS_MAX_BROADCAST_RATE,
                DEFAULT_MAX_BROADCAST_RATE,
            ),
            cpu_limit_cores: parse_env_var_with_warning(WS_CPU_LIMIT, 0.0f64),
            memory_limit_bytes: parse_env_var_with_warning(
                WS_MEMORY_LIMIT,
                DEFAULT_MEMORY_LIMIT_BYTES,
            ),
            cpu_reject_threshold,
            cpu_pause_threshold,
            metrics_interval: Duration::from_secs(metrics_interval_secs),
            log_level: std::env::var(LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            log_format: LogFormat::parse(
                &std::env::var(LOG_FORMAT).unwrap_or_default(),
            ),
            conn_rate: ConnRateConfig {
                enabled: env_bool(WS_CONN_RATE_LIMIT_ENABLED, false),
                per_ip_rate: parse_env_var_with_warning(WS_CONN_RATE_PER_IP, 5.0f64),
                per_ip_burst: parse_env_var_with_warning(WS_CONN_BURST_PER_IP, 10u64),
                global_rate: parse_env_var_with_warning(WS_CONN_RATE_GLOBAL, 500.0f64),
                global_burst: parse_env_var_with_warning(WS_CONN_BURST_GLOBAL, 1000u64),
            },
        })
    }

    /// Per-shard connection capacity: max spread evenly, never below one.
    pub fn per_shard_capacity(&self) -> usize {
        (self.max_connections.div_ceil(self.shard_count)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parse_accepts_json_and_defaults_to_pretty() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("garbage"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }

    #[test]
    fn per_shard_capacity_rounds_up_and_never_drops_to_zero() {
        let mut config = Config::default();
        config.max_connections = 10;
        config.shard_count = 3;
        assert_eq!(config.per_shard_capacity(), 4);

        config.max_connections = 2;
        config.shard_count = 3;
        assert_eq!(config.per_shard_capacity(), 1);

        config.max_connections = 9;
        config.shard_count = 3;
        assert_eq!(config.per_shard_capacity(), 3);
    }

    #[test]
    fn ping_period_is_within_pong_wait() {
        assert!(PING_PERIOD < PONG_WAIT);
    }
}
