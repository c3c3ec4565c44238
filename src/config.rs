//! Configuration management for the jobmill engine.
//!
//! [`EngineConfig`] gathers every tunable of the engine into one TOML document.
//! Durations are written as human-readable strings (`"250ms"`, `"30s"`,
//! `"5m"`, `"1h"`, `"1d"`); a bare number is read as seconds.
//!
//! ```toml
//! [job]
//! enabled = true
//! concurrency = 5
//! retry_delay = "1s"
//! max_retries = 3
//! timeout = "30s"
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout = "1m"
//! ```

use crate::{
    circuit_breaker::CircuitBreakerConfig, events::EventConfig, retry::JitterType, JobmillError,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serde adapter writing `std::time::Duration` as a human-readable string.
pub(crate) mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        if duration.subsec_nanos() != 0 {
            format!("{}ms", duration.as_millis())
        } else if secs == 0 {
            "0s".to_string()
        } else if secs % 86_400 == 0 {
            format!("{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }
}

/// Parse a duration string like `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"` or `"90"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Invalid duration format: {}", s))?;
    let (num_str, suffix) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", s))?;

    let duration = match suffix {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num.saturating_mul(60)),
        "h" => Duration::from_secs(num.saturating_mul(3600)),
        "d" => Duration::from_secs(num.saturating_mul(86_400)),
        _ => return Err(format!("Invalid duration suffix: {}", suffix)),
    };
    Ok(duration)
}

/// Complete configuration of a jobmill engine.
///
/// # Examples
///
/// ```rust
/// use jobmill::config::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::new()
///     .with_concurrency(8)
///     .with_max_retries(5)
///     .with_job_timeout(Duration::from_secs(120));
///
/// assert_eq!(config.job.concurrency, 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub job: JobConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub monitoring: MonitoringConfig,
    pub health: HealthConfig,
    pub events: EventConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.job.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.job.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.job.retry_delay = retry_delay;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.job.poll_interval = poll_interval;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.job.enabled = enabled;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `JOBMILL_*` environment variables.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(enabled) = std::env::var("JOBMILL_ENABLED") {
            config.job.enabled = enabled.parse().unwrap_or(config.job.enabled);
        }
        if let Ok(concurrency) = std::env::var("JOBMILL_CONCURRENCY") {
            config.job.concurrency = concurrency.parse().unwrap_or(config.job.concurrency);
        }
        if let Ok(max_retries) = std::env::var("JOBMILL_MAX_RETRIES") {
            config.job.max_retries = max_retries.parse().unwrap_or(config.job.max_retries);
        }
        if let Ok(retry_delay) = std::env::var("JOBMILL_RETRY_DELAY") {
            if let Ok(duration) = parse_duration(&retry_delay) {
                config.job.retry_delay = duration;
            }
        }
        if let Ok(timeout) = std::env::var("JOBMILL_TIMEOUT") {
            if let Ok(duration) = parse_duration(&timeout) {
                config.job.timeout = duration;
            }
        }
        if let Ok(history) = std::env::var("JOBMILL_MAX_JOB_HISTORY") {
            config.job.max_job_history = history.parse().unwrap_or(config.job.max_job_history);
        }
        if let Ok(level) = std::env::var("JOBMILL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = std::env::var("JOBMILL_LOG_JSON") {
            config.logging.json_format = json.parse().unwrap_or(config.logging.json_format);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.job.concurrency == 0 {
            return Err(JobmillError::Config(
                "job.concurrency must be at least 1".to_string(),
            ));
        }
        if self.job.timeout.is_zero() {
            return Err(JobmillError::Config(
                "job.timeout must be greater than zero".to_string(),
            ));
        }
        if self.job.retry_delay > self.job.max_retry_delay {
            return Err(JobmillError::Config(format!(
                "job.retry_delay ({}) exceeds job.max_retry_delay ({})",
                duration_format::format_duration(self.job.retry_delay),
                duration_format::format_duration(self.job.max_retry_delay)
            )));
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(JobmillError::Config(
                "health.min_success_rate must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(JobmillError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a configuration for development use
    pub fn development() -> Self {
        Self {
            job: JobConfig {
                concurrency: 2,
                retry_delay: Duration::from_millis(500),
                timeout: Duration::from_secs(10),
                ..Default::default()
            },
            events: EventConfig {
                max_buffer_size: 1000,
                log_events: true,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for production use
    pub fn production() -> Self {
        Self {
            job: JobConfig {
                concurrency: 16,
                max_retries: 5,
                timeout: Duration::from_secs(60),
                max_job_history: 10_000,
                retry_jitter: Some(JitterType::Multiplicative(0.1)),
                ..Default::default()
            },
            events: EventConfig {
                max_buffer_size: 50_000,
                log_events: false,
            },
            health: HealthConfig {
                max_queue_size: 50_000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Job execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// When false the manager refuses to start its run loop
    pub enabled: bool,

    /// Maximum number of executions in flight at once
    pub concurrency: usize,

    /// Base delay for exponential retry backoff
    #[serde(with = "duration_format")]
    pub retry_delay: Duration,

    /// Upper bound for retry backoff
    #[serde(with = "duration_format")]
    pub max_retry_delay: Duration,

    /// Optional randomisation of retry delays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_jitter: Option<JitterType>,

    /// Retry budget for jobs that don't set their own
    pub max_retries: u32,

    /// Execution timeout for jobs that don't set their own
    #[serde(with = "duration_format")]
    pub timeout: Duration,

    /// How often finished-job history is trimmed
    #[serde(with = "duration_format")]
    pub cleanup_interval: Duration,

    /// Completed and failed results kept per history
    pub max_job_history: usize,

    /// Sleep between polls of an empty or paused queue
    #[serde(with = "duration_format")]
    pub poll_interval: Duration,

    /// Sleep after an unexpected run-loop error
    #[serde(with = "duration_format")]
    pub loop_error_backoff: Duration,

    /// How long `stop()` waits for in-flight work to drain
    #[serde(with = "duration_format")]
    pub shutdown_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 5,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            retry_jitter: None,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            max_job_history: 1000,
            poll_interval: Duration::from_millis(100),
            loop_error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Thresholds used by monitoring and alerting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Period of the background metrics collection
    #[serde(with = "duration_format")]
    pub collection_interval: Duration,

    /// Number of recent execution times kept for averages and percentiles
    pub execution_window: usize,

    /// Number of recent events kept in the history ring
    pub event_history: usize,

    /// Failure rate (0.0 to 1.0) above which an alert fires
    pub failure_rate_threshold: f64,

    /// Minimum completed executions before the failure rate is judged
    pub min_samples: u64,

    /// Pending queue size above which an alert fires
    pub queue_size_threshold: usize,

    /// Single-execution time above which an alert fires
    #[serde(with = "duration_format")]
    pub execution_time_threshold: Duration,

    /// Average execution time which, with jobs still running, suggests stuck work
    #[serde(with = "duration_format")]
    pub stuck_job_threshold: Duration,

    /// Queued-to-running ratio that counts as a backup
    pub queue_backup_factor: u64,

    /// Minimum time between two alerts of the same type
    #[serde(with = "duration_format")]
    pub alert_cooldown: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(60),
            execution_window: 1000,
            event_history: 10_000,
            failure_rate_threshold: 0.1,
            min_samples: 10,
            queue_size_threshold: 1000,
            execution_time_threshold: Duration::from_secs(30),
            stuck_job_threshold: Duration::from_secs(300),
            queue_backup_factor: 10,
            alert_cooldown: Duration::from_secs(300),
        }
    }
}

/// Limits checked by the manager's health check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Pending executions above which the engine reports unhealthy
    pub max_queue_size: usize,

    /// Success rate below which the engine reports unhealthy
    pub min_success_rate: f64,

    /// In-flight executions above `concurrency * factor` are reported
    pub max_processing_factor: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            min_success_rate: 0.9,
            max_processing_factor: 2,
        }
    }
}

/// Logging and tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_setters() {
        let config = EngineConfig::new()
            .with_concurrency(8)
            .with_max_retries(1)
            .with_retry_delay(Duration::from_millis(20))
            .with_job_timeout(Duration::from_secs(600))
            .with_enabled(false);

        assert_eq!(config.job.concurrency, 8);
        assert_eq!(config.job.max_retries, 1);
        assert_eq!(config.job.retry_delay, Duration::from_millis(20));
        assert_eq!(config.job.timeout, Duration::from_secs(600));
        assert!(!config.job.enabled);
    }

    #[test]
    fn test_presets() {
        let development = EngineConfig::development();
        assert_eq!(development.job.concurrency, 2);
        assert_eq!(development.logging.level, "debug");
        assert!(development.events.log_events);
        assert!(development.validate().is_ok());

        let production = EngineConfig::production();
        assert_eq!(production.job.concurrency, 16);
        assert!(production.logging.json_format);
        assert!(production.job.retry_jitter.is_some());
        assert!(production.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration(" 90 ").unwrap(), Duration::from_secs(90));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_format_duration() {
        use duration_format::format_duration;

        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(172_800)), "2d");
    }

    #[test]
    fn test_durations_in_toml_are_human_readable() {
        let mut config = EngineConfig::new();
        config.job.poll_interval = Duration::from_millis(50);
        config.job.timeout = Duration::from_secs(300);

        let toml_content = toml::to_string_pretty(&config).unwrap();
        assert!(toml_content.contains("poll_interval = \"50ms\""));
        assert!(toml_content.contains("timeout = \"5m\""));
        assert!(toml_content.contains("cleanup_interval = \"1h\""));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [job]
            concurrency = 3
            timeout = "45s"
            "#,
        )
        .unwrap();

        assert_eq!(config.job.concurrency, 3);
        assert_eq!(config.job.timeout, Duration::from_secs(45));
        assert_eq!(config.job.max_retries, 3);
        assert_eq!(config.monitoring, MonitoringConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::new().with_concurrency(0).validate().is_err());
        assert!(
            EngineConfig::new()
                .with_job_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            EngineConfig::new()
                .with_retry_delay(Duration::from_secs(3600))
                .validate()
                .is_err()
        );

        let mut config = EngineConfig::new();
        config.health.min_success_rate = 1.5;
        assert!(matches!(config.validate(), Err(JobmillError::Config(_))));
    }
}
