#![cfg(test)]

use super::config::*;
use super::source::SourceKind;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.poll.interval_ms, 5_000);
    assert_eq!(config.poll.low_priority_interval_ms, 300_000);
    assert_eq!(
        config.sources.ranking,
        vec![SourceKind::Obd, SourceKind::Cloud, SourceKind::Mock]
    );
    assert_eq!(config.low_priority_period_cycles(), 60);
}

#[test]
fn test_config_validation() {
    let mut config = Config::default();
    assert!(config.validate().is_ok());

    config.poll.interval_ms = 0;
    assert!(config.validate().is_err());

    config = Config::default();
    config.sources.ranking = vec![SourceKind::Mock, SourceKind::Mock];
    assert!(config.validate().is_err());

    config = Config::default();
    config.sources.cloud.enabled = true;
    assert!(config.validate().is_err());
    config.sources.cloud.base_url = "https://api.example.com".to_string();
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_serialization() {
    let config = Config::default();
    let yaml = serde_yaml::to_string(&config).unwrap();
    let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(config.poll.interval_ms, deserialized.poll.interval_ms);
    assert_eq!(config.sources.ranking, deserialized.sources.ranking);
}

#[test]
fn test_partial_yaml_uses_defaults() {
    let cfg: Config = serde_yaml::from_str("poll:\n  interval_ms: 1000\n").unwrap();
    assert_eq!(cfg.poll.interval_ms, 1000);
    assert_eq!(cfg.poll.request_timeout_ms, 2_000);
    assert_eq!(cfg.low_priority_period_cycles(), 300);
}

#[test]
fn test_apply_settings_overrides() {
    let mut cfg = Config::default();
    let settings = MapSettings::new()
        .with("poll.interval_ms", 2000)
        .with("sources.ranking", "mock, obd")
        .with("sources.mock.enabled", "false")
        .with("session.idle_samples_to_end", 5);
    cfg.apply_settings(&settings).unwrap();

    assert_eq!(cfg.poll.interval_ms, 2000);
    assert_eq!(cfg.sources.ranking, vec![SourceKind::Mock, SourceKind::Obd]);
    assert!(!cfg.sources.mock.enabled);
    assert_eq!(cfg.session.idle_samples_to_end, 5);
}

#[test]
fn test_apply_settings_rejects_unknown_source() {
    let mut cfg = Config::default();
    let settings = MapSettings::new().with("sources.ranking", "obd,satellite");
    let err = cfg.apply_settings(&settings).unwrap_err();
    assert!(err.to_string().contains("sources.ranking"));
}
