//! Configuration management for session-steward
//!
//! This module handles loading, parsing, and validating configuration
//! from YAML files and environment variables. Durations are expressed in
//! milliseconds and exposed as [`Duration`] through accessor methods.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Connection stabilizer configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Compliance guard configuration
    #[serde(default)]
    pub compliance: ComplianceConfig,

    /// Message delivery configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Sync scheduler configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Sync monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Persistence sink configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix SESSION_STEWARD_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(v) = env_parse("SESSION_STEWARD_MINUTE_LIMIT")? {
            config.compliance.minute_limit = v;
        }
        if let Some(v) = env_parse("SESSION_STEWARD_HOUR_LIMIT")? {
            config.compliance.hour_limit = v;
        }
        if let Some(v) = env_parse("SESSION_STEWARD_DAY_LIMIT")? {
            config.compliance.day_limit = v;
        }
        if let Some(v) = env_parse("SESSION_STEWARD_MAX_RECONNECT_ATTEMPTS")? {
            config.connection.reconnect.max_attempts = v;
        }
        if let Some(v) = env_parse("SESSION_STEWARD_MIN_SYNC_INTERVAL_MS")? {
            config.sync.min_sync_interval_ms = v;
        }
        if let Some(v) = env_parse("SESSION_STEWARD_MAX_CONCURRENT_SYNCS")? {
            config.sync.max_concurrent_syncs = v;
        }
        if let Ok(url) = std::env::var("SESSION_STEWARD_WEBHOOK_URL") {
            config.monitor.webhook_url = Some(url);
        }
        if let Ok(backend) = std::env::var("SESSION_STEWARD_PERSISTENCE_BACKEND") {
            config.persistence.backend = backend;
        }
        if let Ok(path) = std::env::var("SESSION_STEWARD_PERSISTENCE_PATH") {
            config.persistence.path = path;
        }
        if let Ok(enabled) = std::env::var("SESSION_STEWARD_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("SESSION_STEWARD_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("SESSION_STEWARD_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reconnect = &self.connection.reconnect;
        if reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "connection.reconnect.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(ConfigError::InvalidValue(
                "connection.reconnect.max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }

        let c = &self.compliance;
        if c.minute_limit == 0 || c.hour_limit == 0 || c.day_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "compliance limits must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&c.warning_ratio) {
            return Err(ConfigError::InvalidValue(
                "compliance.warning_ratio must be within 0.0..=1.0".to_string(),
            ));
        }

        for (name, policy) in self.delivery.policies.iter() {
            if policy.max_retries == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "delivery.policies.{}.max_retries must be greater than zero",
                    name
                )));
            }
            if policy.backoff_multiplier < 1.0 {
                return Err(ConfigError::InvalidValue(format!(
                    "delivery.policies.{}.backoff_multiplier must be >= 1.0",
                    name
                )));
            }
        }

        if self.sync.max_concurrent_syncs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.max_concurrent_syncs must be greater than zero".to_string(),
            ));
        }
        if self.sync.max_failed_syncs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.max_failed_syncs must be greater than zero".to_string(),
            ));
        }
        for (name, timeout_ms) in [
            ("connection", self.connection.persistence_timeout_ms),
            ("delivery", self.delivery.persistence_timeout_ms),
            ("sync", self.sync.persistence_timeout_ms),
        ] {
            if timeout_ms == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "{}.persistence_timeout_ms must be greater than zero",
                    name
                )));
            }
        }
        if self.monitor.activity_log_size == 0 {
            return Err(ConfigError::InvalidValue(
                "monitor.activity_log_size must be greater than zero".to_string(),
            ));
        }

        match self.persistence.backend.as_str() {
            "memory" | "sqlite" | "none" => Ok(()),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown persistence backend: {}",
                other
            ))),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("Invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Reconnection backoff strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectionStrategy {
    /// Reconnect attempts before the session is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt
    #[serde(default = "default_reconnect_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for any reconnect delay
    #[serde(default = "default_reconnect_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to apply ±25% jitter
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_reconnect_base_delay(),
            max_delay_ms: default_reconnect_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectionStrategy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay() -> u64 {
    1_000
}

fn default_reconnect_max_delay() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Connection stabilizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Reconnection strategy
    #[serde(default)]
    pub reconnect: ReconnectionStrategy,

    /// Interval between health ticks
    #[serde(default = "default_connection_health_interval")]
    pub health_check_interval_ms: u64,

    /// Interval between latency probes while connected
    #[serde(default = "default_latency_probe_interval")]
    pub latency_probe_interval_ms: u64,

    /// Errors per minute considered unhealthy
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate_per_min: f64,

    /// Latency considered unhealthy
    #[serde(default = "default_max_latency")]
    pub max_latency_ms: u64,

    /// Timeout for a single persistence write
    #[serde(default = "default_persistence_timeout")]
    pub persistence_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectionStrategy::default(),
            health_check_interval_ms: default_connection_health_interval(),
            latency_probe_interval_ms: default_latency_probe_interval(),
            max_error_rate_per_min: default_max_error_rate(),
            max_latency_ms: default_max_latency(),
            persistence_timeout_ms: default_persistence_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn latency_probe_interval(&self) -> Duration {
        Duration::from_millis(self.latency_probe_interval_ms)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }
}

fn default_connection_health_interval() -> u64 {
    30_000
}

fn default_latency_probe_interval() -> u64 {
    30_000
}

fn default_max_error_rate() -> f64 {
    10.0
}

fn default_max_latency() -> u64 {
    5_000
}

/// Compliance guard configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceConfig {
    /// Sends allowed per rolling minute
    #[serde(default = "default_minute_limit")]
    pub minute_limit: usize,

    /// Sends allowed per rolling hour
    #[serde(default = "default_hour_limit")]
    pub hour_limit: usize,

    /// Sends allowed per rolling day
    #[serde(default = "default_day_limit")]
    pub day_limit: usize,

    /// Fraction of a limit at which the rate rule warns
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,

    /// Minimum connection uptime before sending is considered safe
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,

    /// Coefficient of variation below which send timing looks automated
    #[serde(default = "default_min_interval_cv")]
    pub min_interval_cv: f64,

    /// Interval samples required before the activity rule applies
    #[serde(default = "default_min_pattern_samples")]
    pub min_pattern_samples: usize,

    /// Send intervals retained for pattern analysis
    #[serde(default = "default_interval_sample_size")]
    pub interval_sample_size: usize,

    /// Interval between periodic compliance checks
    #[serde(default = "default_compliance_check_interval")]
    pub check_interval_ms: u64,

    /// Minimum gap between consecutive sends
    #[serde(default = "default_min_send_gap")]
    pub min_send_gap_ms: u64,

    /// Upper bound of random jitter added to the send gap
    #[serde(default = "default_send_jitter")]
    pub send_jitter_ms: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            minute_limit: default_minute_limit(),
            hour_limit: default_hour_limit(),
            day_limit: default_day_limit(),
            warning_ratio: default_warning_ratio(),
            min_uptime_ms: default_min_uptime(),
            min_interval_cv: default_min_interval_cv(),
            min_pattern_samples: default_min_pattern_samples(),
            interval_sample_size: default_interval_sample_size(),
            check_interval_ms: default_compliance_check_interval(),
            min_send_gap_ms: default_min_send_gap(),
            send_jitter_ms: default_send_jitter(),
        }
    }
}

impl ComplianceConfig {
    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

fn default_minute_limit() -> usize {
    20
}

fn default_hour_limit() -> usize {
    200
}

fn default_day_limit() -> usize {
    1_000
}

fn default_warning_ratio() -> f64 {
    0.8
}

fn default_min_uptime() -> u64 {
    300_000
}

fn default_min_interval_cv() -> f64 {
    0.1
}

fn default_min_pattern_samples() -> usize {
    10
}

fn default_interval_sample_size() -> usize {
    50
}

fn default_compliance_check_interval() -> u64 {
    60_000
}

fn default_min_send_gap() -> u64 {
    1_000
}

fn default_send_jitter() -> u64 {
    2_000
}

/// Retry policy for one message priority
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total send attempts before the message fails
    #[serde(default = "default_policy_max_retries")]
    pub max_retries: u32,

    /// Initial backoff
    #[serde(default = "default_policy_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum backoff
    #[serde(default = "default_policy_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_policy_max_retries(),
            base_delay_ms: default_policy_base_delay(),
            max_delay_ms: default_policy_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Policy with explicit values
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }

    /// Disable or enable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

fn default_policy_max_retries() -> u32 {
    3
}

fn default_policy_base_delay() -> u64 {
    5_000
}

fn default_policy_max_delay() -> u64 {
    120_000
}

/// Retry policies keyed by message priority
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorityPolicies {
    #[serde(default = "default_critical_policy")]
    pub critical: RetryPolicy,

    #[serde(default = "default_high_policy")]
    pub high: RetryPolicy,

    #[serde(default = "default_normal_policy")]
    pub normal: RetryPolicy,

    #[serde(default = "default_low_policy")]
    pub low: RetryPolicy,
}

impl Default for PriorityPolicies {
    fn default() -> Self {
        Self {
            critical: default_critical_policy(),
            high: default_high_policy(),
            normal: default_normal_policy(),
            low: default_low_policy(),
        }
    }
}

impl PriorityPolicies {
    /// Iterate over `(name, policy)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &RetryPolicy)> {
        [
            ("critical", &self.critical),
            ("high", &self.high),
            ("normal", &self.normal),
            ("low", &self.low),
        ]
        .into_iter()
    }

    /// Policy applied to messages of `priority`
    pub fn for_priority(&self, priority: crate::models::MessagePriority) -> &RetryPolicy {
        use crate::models::MessagePriority;
        match priority {
            MessagePriority::Critical => &self.critical,
            MessagePriority::High => &self.high,
            MessagePriority::Normal => &self.normal,
            MessagePriority::Low => &self.low,
        }
    }
}

fn default_critical_policy() -> RetryPolicy {
    RetryPolicy::new(5, 1_000, 30_000)
}

fn default_high_policy() -> RetryPolicy {
    RetryPolicy::new(4, 2_000, 60_000)
}

fn default_normal_policy() -> RetryPolicy {
    RetryPolicy::new(3, 5_000, 120_000)
}

fn default_low_policy() -> RetryPolicy {
    RetryPolicy::new(2, 10_000, 300_000)
}

/// Message delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Interval between processing ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Time after which a sent message is assumed delivered
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_ms: u64,

    /// Timeout for a single transport send
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Timeout for a single persistence write
    #[serde(default = "default_persistence_timeout")]
    pub persistence_timeout_ms: u64,

    /// Terminal messages retained in history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Maximum content size in bytes
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,

    /// Retry policies per priority
    #[serde(default)]
    pub policies: PriorityPolicies,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            confirmation_timeout_ms: default_confirmation_timeout(),
            send_timeout_ms: default_send_timeout(),
            persistence_timeout_ms: default_persistence_timeout(),
            history_limit: default_history_limit(),
            max_content_bytes: default_max_content_bytes(),
            policies: PriorityPolicies::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }
}

fn default_tick_interval() -> u64 {
    5_000
}

fn default_confirmation_timeout() -> u64 {
    60_000
}

fn default_send_timeout() -> u64 {
    30_000
}

fn default_persistence_timeout() -> u64 {
    5_000
}

fn default_history_limit() -> usize {
    500
}

fn default_max_content_bytes() -> usize {
    65_536
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Delay before the first sync after a connection opens
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Interval of the periodic incremental sync
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_ms: u64,

    /// Consecutive failures before retries stop
    #[serde(default = "default_sync_max_retries")]
    pub max_retries: u32,

    /// Base delay of the retry backoff
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Cap of the retry backoff
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Minimum interval between two sync runs
    #[serde(default = "default_min_sync_interval")]
    pub min_sync_interval_ms: u64,

    /// Maximum number of sync jobs running at once
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,

    /// Interval between scheduler health checks
    #[serde(default = "default_sync_health_interval")]
    pub health_check_interval_ms: u64,

    /// Recent failures that mark the scheduler critical
    #[serde(default = "default_max_failed_syncs")]
    pub max_failed_syncs: usize,

    /// Window over which recent failures are counted
    #[serde(default = "default_failure_window")]
    pub failure_window_ms: u64,

    /// Stabilization delay before the recovery sync
    #[serde(default = "default_recovery_delay")]
    pub recovery_delay_ms: u64,

    /// Timeout for a single worker invocation
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// Timeout for a single sync log write
    #[serde(default = "default_persistence_timeout")]
    pub persistence_timeout_ms: u64,

    /// Smoothing factor of the average duration
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            periodic_interval_ms: default_periodic_interval(),
            max_retries: default_sync_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            min_sync_interval_ms: default_min_sync_interval(),
            max_concurrent_syncs: default_max_concurrent_syncs(),
            health_check_interval_ms: default_sync_health_interval(),
            max_failed_syncs: default_max_failed_syncs(),
            failure_window_ms: default_failure_window(),
            recovery_delay_ms: default_recovery_delay(),
            sync_timeout_ms: default_sync_timeout(),
            persistence_timeout_ms: default_persistence_timeout(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

impl SyncConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_millis(self.min_sync_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    /// Retry backoff as a policy (multiplier 2, no jitter)
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

fn default_initial_delay() -> u64 {
    10_000
}

fn default_periodic_interval() -> u64 {
    900_000
}

fn default_sync_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    30_000
}

fn default_retry_max_delay() -> u64 {
    600_000
}

fn default_min_sync_interval() -> u64 {
    60_000
}

fn default_max_concurrent_syncs() -> usize {
    1
}

fn default_sync_health_interval() -> u64 {
    60_000
}

fn default_max_failed_syncs() -> usize {
    5
}

fn default_failure_window() -> u64 {
    1_800_000
}

fn default_recovery_delay() -> u64 {
    30_000
}

fn default_sync_timeout() -> u64 {
    300_000
}

fn default_ema_alpha() -> f64 {
    0.2
}

/// Sync monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Entries kept in the rolling activity log
    #[serde(default = "default_activity_log_size")]
    pub activity_log_size: usize,

    /// Consecutive failures that raise an alert
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Failure ratio over the activity log that raises an alert
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Completed runs required before the error-rate rule applies
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Average response time that raises an alert
    #[serde(default = "default_slow_response_threshold")]
    pub slow_response_threshold_ms: u64,

    /// Success rate below which health is degraded
    #[serde(default = "default_degraded_success_rate")]
    pub degraded_success_rate: f64,

    /// Success rate below which health is critical
    #[serde(default = "default_critical_success_rate")]
    pub critical_success_rate: f64,

    /// Age after which alerts are removed
    #[serde(default = "default_alert_retention")]
    pub alert_retention_ms: u64,

    /// Interval of the alert cleanup sweep
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Timeout for a single notification channel
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_ms: u64,

    /// Optional webhook receiving alerts
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Smoothing factor of the average response time
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            activity_log_size: default_activity_log_size(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            min_samples: default_min_samples(),
            slow_response_threshold_ms: default_slow_response_threshold(),
            degraded_success_rate: default_degraded_success_rate(),
            critical_success_rate: default_critical_success_rate(),
            alert_retention_ms: default_alert_retention(),
            cleanup_interval_ms: default_cleanup_interval(),
            notify_timeout_ms: default_notify_timeout(),
            webhook_url: None,
            ema_alpha: default_ema_alpha(),
        }
    }
}

impl MonitorConfig {
    pub fn slow_response_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_response_threshold_ms)
    }

    pub fn alert_retention(&self) -> Duration {
        Duration::from_millis(self.alert_retention_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

fn default_activity_log_size() -> usize {
    100
}

fn default_consecutive_failure_threshold() -> u32 {
    3
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    5
}

fn default_slow_response_threshold() -> u64 {
    120_000
}

fn default_degraded_success_rate() -> f64 {
    0.9
}

fn default_critical_success_rate() -> f64 {
    0.5
}

fn default_alert_retention() -> u64 {
    86_400_000
}

fn default_cleanup_interval() -> u64 {
    3_600_000
}

fn default_notify_timeout() -> u64 {
    10_000
}

/// Persistence sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    /// Sink backend: memory, sqlite or none
    #[serde(default = "default_persistence_backend")]
    pub backend: String,

    /// Path to the SQLite database file
    #[serde(default = "default_persistence_path")]
    pub path: String,

    /// Records kept per table by the memory sink
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_persistence_backend(),
            path: default_persistence_path(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

fn default_persistence_backend() -> String {
    "memory".to_string()
}

fn default_persistence_path() -> String {
    "session-steward.db".to_string()
}

fn default_memory_capacity() -> usize {
    1_000
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "session-steward".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
