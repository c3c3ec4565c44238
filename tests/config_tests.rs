use jobmill::circuit_breaker::CircuitBreakerConfig;
use jobmill::config::EngineConfig;
use jobmill::error::JobErrorKind;
use jobmill::retry::JitterType;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_config_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobmill.toml");

    let config = EngineConfig::production()
        .with_concurrency(12)
        .with_job_timeout(Duration::from_millis(1500))
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
            expected_error_kinds: vec![JobErrorKind::Timeout],
            ..Default::default()
        });
    config.save_to_file(&path).unwrap();

    let loaded = EngineConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.job.retry_jitter, Some(JitterType::Multiplicative(0.1)));

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("timeout = \"1500ms\""));
    assert!(text.contains("concurrency = 12"));
}

#[test]
fn test_partial_file_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.toml");
    std::fs::write(
        &path,
        r#"
[job]
concurrency = 3
retry_delay = "2s"

[monitoring]
failure_rate_threshold = 0.25
"#,
    )
    .unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    assert_eq!(config.job.concurrency, 3);
    assert_eq!(config.job.retry_delay, Duration::from_secs(2));
    assert_eq!(config.job.max_retries, 3);
    assert_eq!(config.monitoring.failure_rate_threshold, 0.25);
    assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = tempdir().unwrap();

    let zero_concurrency = dir.path().join("zero.toml");
    std::fs::write(&zero_concurrency, "[job]\nconcurrency = 0\n").unwrap();
    assert!(EngineConfig::from_file(&zero_concurrency).is_err());

    let bad_duration = dir.path().join("duration.toml");
    std::fs::write(&bad_duration, "[job]\ntimeout = \"soon\"\n").unwrap();
    assert!(EngineConfig::from_file(&bad_duration).is_err());

    assert!(EngineConfig::from_file(dir.path().join("missing.toml")).is_err());
}
