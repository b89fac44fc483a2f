use anyhow::Result;
use evtelemetry::config::{Config, EnvSettings};
use evtelemetry::logging::{get_logger, init_logging};
use evtelemetry::obd::PidTable;
use evtelemetry::persistence::SessionArchive;
use evtelemetry::session::SessionTracker;
use evtelemetry::sink::LogSink;
use evtelemetry::source::{DataSourceManager, DataSourceProvider, MockProvider, SourceKind};
use evtelemetry::TelemetryDriver;
use std::sync::Arc;
use tracing::{error, info};

fn build_providers(config: &Config) -> Result<Vec<Arc<dyn DataSourceProvider>>> {
    let logger = get_logger("main");
    let mut providers: Vec<Arc<dyn DataSourceProvider>> = Vec::new();

    for kind in &config.sources.ranking {
        match kind {
            SourceKind::Obd => {
                let table = match &config.sources.obd.pid_file {
                    Some(path) => PidTable::load(path)?,
                    None => PidTable::default_ev(),
                };
                // The adapter link is supplied by an embedding host
                logger.info(&format!(
                    "OBD source with {} PIDs requires a host adapter transport; not started",
                    table.len()
                ));
            }
            SourceKind::Cloud if config.sources.cloud.enabled => {
                #[cfg(feature = "cloud")]
                {
                    let client =
                        evtelemetry::source::HttpVehicleInfoClient::new(&config.sources.cloud)?;
                    providers.push(Arc::new(evtelemetry::source::CloudProvider::new(
                        Arc::new(client),
                        std::time::Duration::from_millis(config.sources.cloud.refresh_interval_ms),
                    )));
                }
                #[cfg(not(feature = "cloud"))]
                logger.warn("Cloud source enabled but built without the `cloud` feature");
            }
            SourceKind::Mock if config.sources.mock.enabled => {
                providers.push(Arc::new(MockProvider::new(&config.sources.mock)));
            }
            _ => {}
        }
    }
    Ok(providers)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config.apply_settings(&EnvSettings::default())?;
    config.validate()?;
    init_logging(&config.logging)?;

    info!("evtelemetry {} starting up", env!("APP_VERSION"));

    let archive = Arc::new(SessionArchive::from_config(&config.archive));
    if let Err(e) = archive.load() {
        error!("Session archive unreadable, starting empty: {}", e);
    }

    let manager = Arc::new(DataSourceManager::with_ranking(
        build_providers(&config)?,
        &config.sources.ranking,
    ));
    let connected = manager.connect_all().await;
    info!("{} data source(s) connected", connected);

    let tracker = SessionTracker::new(config.session.clone())
        .with_previous_end_odometer(archive.last_end_odometer());
    let mut driver = TelemetryDriver::new(manager, tracker)
        .with_sink(Arc::new(LogSink::new()))
        .with_sink(archive);

    let shutdown = driver.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    match driver.run().await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Driver failed with error: {}", e);
            Err(anyhow::anyhow!("Driver error: {}", e))
        }
    }
}
