use crate::model::message::Stage;
use crate::model::scale::ScaleRule;
use errors::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// API server configuration
#[derive(Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    /// Port number for the control-plane server
    pub port: u16,
    /// Optional API key for authentication
    pub api_key: Option<String>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "***REDACTED***"))
            .finish()
    }
}

/// Redis connection settings for the stream-backed broker
#[derive(Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis server hostname
    pub redis_host: String,
    /// Redis server port
    pub redis_port: u16,
    /// Redis database index
    pub redis_db: u16,
    /// Optional Redis username
    pub redis_username: Option<String>,
    /// Optional Redis password
    pub redis_password: Option<String>,
    /// Connection pool size
    pub pool_size: Option<usize>,
    /// Enable TLS for connection
    pub tls: Option<bool>,
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field("redis_db", &self.redis_db)
            .field("redis_username", &self.redis_username)
            .field(
                "redis_password",
                &self.redis_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("pool_size", &self.pool_size)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Queue broker configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    /// Backend kind: "memory" or "redis"
    pub backend: String,
    /// Key prefix isolating this deployment's queues
    pub namespace: String,
    /// Seconds an unacked lease stays invisible before redelivery
    pub visibility_timeout_secs: u64,
    /// Redis connection, required when backend = "redis"
    pub redis: Option<RedisConfig>,
}

/// Per-stage worker and scaling configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StageConfig {
    /// Deliveries allowed before a message is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Route this stage's external calls through the rate guard
    #[serde(default)]
    pub guarded: bool,
    /// Stage service endpoint invoked per message
    pub endpoint: Option<String>,
    /// Replica floor the stage settles to when drained (may be 0)
    pub min_replicas: usize,
    /// Replica ceiling
    pub max_replicas: usize,
    /// Backlog one replica is expected to absorb
    pub queue_length_threshold: u64,
    /// Minimum depth that wakes the stage from zero replicas
    pub activation_threshold: u64,
    /// Minimum seconds between a scale action and a later scale-down
    pub cooldown_secs: u64,
}

impl StageConfig {
    pub fn scale_rule(&self) -> ScaleRule {
        ScaleRule {
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            queue_length_threshold: self.queue_length_threshold,
            activation_threshold: self.activation_threshold,
            cooldown_seconds: self.cooldown_secs,
        }
    }
}

/// Configuration for every pipeline stage, keyed by stage name in TOML
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StagesConfig {
    pub collect: StageConfig,
    pub process: StageConfig,
    pub markdown: StageConfig,
    pub publish: StageConfig,
}

impl StagesConfig {
    pub fn get(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Collect => &self.collect,
            Stage::Process => &self.process,
            Stage::Markdown => &self.markdown,
            Stage::Publish => &self.publish,
        }
    }
}

/// Rate limiter / backpressure guard configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LimiterConfig {
    /// Hard cap on concurrent in-flight calls to the enrichment API
    pub max_concurrency: usize,
    /// Floor the additive-decrease response never drops below
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    /// Published rate of the external API
    pub requests_per_minute: u32,
    /// First backoff delay after a throttle signal
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive successes before one unit of concurrency is restored
    #[serde(default = "default_increase_after")]
    pub increase_after_successes: u32,
}

/// Autoscale controller configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    /// Seconds between depth polls
    pub poll_interval_secs: u64,
    /// Seconds an in-flight handler gets on shutdown before its lease is
    /// released for prompt redelivery
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Pipeline health monitor configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    /// Seconds between health samples
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Depth must shrink within this window while replicas are live,
    /// otherwise the stage is flagged stuck
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,
    /// Throttle events per minute beyond which health degrades
    #[serde(default = "default_throttle_alarm")]
    pub throttle_alarm_per_minute: u64,
    /// How long a scheduled run is expected to keep the pipeline busy
    #[serde(default = "default_run_minutes")]
    pub expected_run_minutes: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            stuck_after_secs: default_stuck_after(),
            throttle_alarm_per_minute: default_throttle_alarm(),
            expected_run_minutes: default_run_minutes(),
        }
    }
}

/// Scheduler configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Seven-field cron expression (seconds first), evaluated in UTC
    pub cron: String,
}

/// Reprocessing coordinator configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReprocessConfig {
    /// Directory holding stored collections, one entry per item
    pub content_dir: String,
    /// Estimated enrichment cost per item
    pub unit_cost: f64,
    /// Estimated wall-clock seconds per item
    pub unit_seconds: u64,
}

/// Logger configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggerConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional directory for daily-rolling file output
    pub dir: Option<String>,
    /// Whether to enable console output
    #[serde(default = "default_true")]
    pub console: bool,
    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json: bool,
}

/// Main configuration. Loaded once at process start; shared by Arc afterwards.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Deployment instance name
    pub name: String,
    /// Queue broker configuration
    pub broker: BrokerConfig,
    /// Per-stage configuration
    pub stages: StagesConfig,
    /// Rate guard configuration
    pub limiter: LimiterConfig,
    /// Autoscale controller configuration
    pub controller: ControllerConfig,
    /// Health monitor configuration
    pub monitor: Option<MonitorConfig>,
    /// Cron scheduler configuration
    pub scheduler: Option<SchedulerConfig>,
    /// Reprocessing configuration
    pub reprocess: ReprocessConfig,
    /// Control-plane server configuration
    pub api: Option<ApiConfig>,
    /// Logger configuration
    pub logger: Option<LoggerConfig>,
}

impl Config {
    /// Loads configuration from a TOML file and validates it. A bad scale
    /// rule or broker setting refuses startup rather than running with
    /// undefined scaling behavior.
    pub fn load(path: &str) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(Box::new(e)))?;
        let config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseFailed(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            self.stages.get(stage).scale_rule().validate(stage)?;
            if self.stages.get(stage).max_attempts == 0 {
                return Err(Error::config_invalid(format!(
                    "stages.{stage}.max_attempts must be >= 1"
                )));
            }
        }

        match self.broker.backend.as_str() {
            "memory" => {}
            "redis" => {
                if self.broker.redis.is_none() {
                    return Err(Error::config_invalid(
                        "broker.redis section is required for the redis backend",
                    ));
                }
            }
            other => {
                return Err(Error::config_invalid(format!(
                    "unknown broker backend: {other}"
                )));
            }
        }

        if self.broker.visibility_timeout_secs == 0 {
            return Err(Error::config_invalid(
                "broker.visibility_timeout_secs must be >= 1",
            ));
        }
        if self.controller.poll_interval_secs == 0 {
            return Err(Error::config_invalid(
                "controller.poll_interval_secs must be >= 1",
            ));
        }
        if self.limiter.max_concurrency == 0 {
            return Err(Error::config_invalid("limiter.max_concurrency must be >= 1"));
        }
        if self.limiter.min_concurrency == 0
            || self.limiter.min_concurrency > self.limiter.max_concurrency
        {
            return Err(Error::config_invalid(
                "limiter.min_concurrency must be in 1..=max_concurrency",
            ));
        }
        if self.limiter.requests_per_minute == 0 {
            return Err(Error::config_invalid(
                "limiter.requests_per_minute must be >= 1",
            ));
        }

        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_concurrency() -> usize {
    1
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_increase_after() -> u32 {
    10
}

fn default_grace_secs() -> u64 {
    10
}

fn default_monitor_interval() -> u64 {
    15
}

fn default_stuck_after() -> u64 {
    300
}

fn default_throttle_alarm() -> u64 {
    30
}

fn default_run_minutes() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            name = "conveyor"

            [broker]
            backend = "memory"
            namespace = "conveyor"
            visibility_timeout_secs = 60

            [stages.collect]
            min_replicas = 0
            max_replicas = 3
            queue_length_threshold = 4
            activation_threshold = 1
            cooldown_secs = 120

            [stages.process]
            guarded = true
            endpoint = "http://localhost:9100/process"
            min_replicas = 0
            max_replicas = 4
            queue_length_threshold = 8
            activation_threshold = 1
            cooldown_secs = 120

            [stages.markdown]
            min_replicas = 0
            max_replicas = 2
            queue_length_threshold = 16
            activation_threshold = 1
            cooldown_secs = 60

            [stages.publish]
            min_replicas = 1
            max_replicas = 1
            queue_length_threshold = 32
            activation_threshold = 1
            cooldown_secs = 60

            [limiter]
            max_concurrency = 4
            requests_per_minute = 60

            [controller]
            poll_interval_secs = 5

            [reprocess]
            content_dir = "./data/collections"
            unit_cost = 0.0004
            unit_seconds = 2

            [api]
            port = 8080
            api_key = "secret"
        "#
    }

    #[test]
    fn test_config_deserialization() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.name, "conveyor");
        assert_eq!(config.broker.backend, "memory");
        assert_eq!(config.stages.process.max_attempts, 3);
        assert!(config.stages.process.guarded);
        assert_eq!(config.limiter.min_concurrency, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_key_redacted_in_debug() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        let rendered = format!("{:?}", config.api.unwrap());
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_bad_scale_rule_is_fatal() {
        let mut config: Config = toml::from_str(sample_toml()).unwrap();
        config.stages.collect.activation_threshold = 0;
        assert!(config.validate().is_err());

        config.stages.collect.activation_threshold = 1;
        config.stages.collect.min_replicas = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_backend_requires_section() {
        let mut config: Config = toml::from_str(sample_toml()).unwrap();
        config.broker.backend = "redis".to_string();
        assert!(config.validate().is_err());
    }
}
