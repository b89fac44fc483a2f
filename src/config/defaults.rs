use super::*;

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            low_priority_interval_ms: 300_000,
            request_timeout_ms: 2_000,
            max_consecutive_failures: 5,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            ranking: vec![SourceKind::Obd, SourceKind::Cloud, SourceKind::Mock],
            obd: ObdConfig::default(),
            cloud: CloudConfig::default(),
            mock: MockConfig::default(),
        }
    }
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            init_commands: ["ATZ", "ATE0", "ATS0", "ATH1"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            reconnect_interval_ms: 30_000,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            vehicle_id: String::new(),
            access_token: String::new(),
            refresh_interval_ms: 60_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            seed: 42,
            start_soc: 35.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            charge_rise_threshold_ah: 0.05,
            idle_samples_to_end: 3,
            full_soc_percent: 100.0,
            counter_reset_tolerance_ah: 1.0,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: "/data/evtelemetry_sessions.json".to_string(),
            max_sessions: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/evtelemetry.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            sources: SourcesConfig::default(),
            session: SessionConfig::default(),
            archive: ArchiveConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
