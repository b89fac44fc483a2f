//! OBD-II adapter data source
//!
//! While active, a poll task runs one scheduler cycle per tick and publishes
//! the assembled snapshot. Low-priority readings are carried over into the
//! cycles that do not query them. After `max_consecutive_failures` fully
//! failed cycles the adapter counts as lost: connectivity drops to `false`
//! and, when configured, a reconnect task retries opening the link.

use super::{DataSourceProvider, ProviderChannels, SourceKind, TaskSlot};
use crate::config::Config;
use crate::error::{Result, TelemetryError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::obd::{PidTable, Priority};
use crate::scheduler::PollScheduler;
use crate::telemetry::{DecodedSample, TelemetrySnapshot};
use crate::transport::{AdapterLink, AdapterTransport};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{MissedTickBehavior, interval, sleep};

/// Timing of the OBD provider
#[derive(Debug, Clone)]
pub struct ObdSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub low_priority_period: u64,
    pub init_commands: Vec<String>,
    pub max_consecutive_failures: u32,
    /// `None` disables automatic reconnection
    pub reconnect_interval: Option<Duration>,
}

impl ObdSettings {
    pub fn from_config(config: &Config) -> Self {
        let reconnect = config.sources.obd.reconnect_interval_ms;
        Self {
            poll_interval: Duration::from_millis(config.poll.interval_ms),
            request_timeout: Duration::from_millis(config.poll.request_timeout_ms),
            low_priority_period: config.low_priority_period_cycles(),
            init_commands: config.sources.obd.init_commands.clone(),
            max_consecutive_failures: config.poll.max_consecutive_failures.max(1),
            reconnect_interval: (reconnect > 0).then(|| Duration::from_millis(reconnect)),
        }
    }
}

struct ObdInner {
    link: Mutex<AdapterLink>,
    scheduler: Mutex<PollScheduler>,
    low_priority: HashSet<String>,
    settings: ObdSettings,
    channels: ProviderChannels,
    poll_task: TaskSlot,
    reconnect_task: TaskSlot,
    logger: StructuredLogger,
}

/// Data source backed by an OBD-II adapter
pub struct ObdProvider {
    inner: Arc<ObdInner>,
}

impl ObdProvider {
    pub fn new(transport: Box<dyn AdapterTransport>, table: PidTable, config: &Config) -> Self {
        Self::with_settings(transport, table, ObdSettings::from_config(config))
    }

    pub fn with_settings(
        transport: Box<dyn AdapterTransport>,
        table: PidTable,
        settings: ObdSettings,
    ) -> Self {
        let low_priority = table
            .iter()
            .filter(|p| p.priority() == Priority::Low)
            .map(|p| p.name().to_string())
            .collect();
        let inner = ObdInner {
            link: Mutex::new(AdapterLink::new(transport, settings.request_timeout)),
            scheduler: Mutex::new(PollScheduler::new(table, settings.low_priority_period)),
            low_priority,
            settings,
            channels: ProviderChannels::new(),
            poll_task: TaskSlot::default(),
            reconnect_task: TaskSlot::default(),
            logger: get_logger_with_context(LogContext::new("source").with_source("obd")),
        };
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl ObdInner {
    async fn open_link(&self) -> Result<()> {
        self.link
            .lock()
            .await
            .open(&self.settings.init_commands)
            .await?;
        self.scheduler.lock().await.reset();
        self.channels.set_connected(true);
        Ok(())
    }

    async fn link_lost(self: &Arc<Self>) {
        self.logger.error(&format!(
            "Adapter lost after {} failed cycles",
            self.settings.max_consecutive_failures
        ));
        if let Err(e) = self.link.lock().await.close().await {
            self.logger.debug(&format!("Close after loss failed: {}", e));
        }
        self.channels.set_connected(false);

        if let Some(every) = self.settings.reconnect_interval {
            let inner = Arc::clone(self);
            self.reconnect_task
                .replace(tokio::spawn(async move { inner.reconnect_loop(every).await }));
        }
    }

    async fn reconnect_loop(self: Arc<Self>, every: Duration) {
        loop {
            sleep(every).await;
            match self.open_link().await {
                Ok(()) => {
                    self.logger.info("Adapter reconnected");
                    return;
                }
                Err(e) => self.logger.debug(&format!("Reconnect failed: {}", e)),
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        let mut retained: BTreeMap<String, DecodedSample> = BTreeMap::new();

        loop {
            ticker.tick().await;
            let report = {
                let mut link = self.link.lock().await;
                let mut scheduler = self.scheduler.lock().await;
                scheduler.run_cycle(&mut link).await
            };

            if report.all_failed() {
                failures += 1;
                self.logger.warn(&format!(
                    "Poll cycle {} failed completely ({}/{})",
                    report.cycle, failures, self.settings.max_consecutive_failures
                ));
                if failures >= self.settings.max_consecutive_failures {
                    self.link_lost().await;
                    return;
                }
                continue;
            }
            failures = 0;

            let mut samples = report.samples;
            for sample in &samples {
                if self.low_priority.contains(&sample.name) && !sample.is_unknown() {
                    retained.insert(sample.name.clone(), sample.clone());
                }
            }
            for (name, sample) in &retained {
                if !samples.iter().any(|s| &s.name == name) {
                    samples.push(sample.clone());
                }
            }

            let snapshot = TelemetrySnapshot::from_samples(Utc::now(), &samples);
            if snapshot.is_empty() {
                self.logger
                    .debug(&format!("Cycle {} produced no known values", report.cycle));
                continue;
            }
            self.channels.publish(snapshot);
        }
    }
}

#[async_trait]
impl DataSourceProvider for ObdProvider {
    fn kind(&self) -> SourceKind {
        SourceKind::Obd
    }

    async fn connect(&self) -> Result<()> {
        self.inner.reconnect_task.cancel();
        match self.inner.open_link().await {
            Ok(()) => {
                self.inner.logger.info("Connected");
                Ok(())
            }
            Err(e) => {
                self.inner.channels.set_connected(false);
                self.inner.logger.warn(&format!("Connect failed: {}", e));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.poll_task.cancel();
        self.inner.reconnect_task.cancel();
        let result = self.inner.link.lock().await.close().await;
        self.inner.channels.set_connected(false);
        self.inner.logger.info("Disconnected");
        result
    }

    fn is_connected(&self) -> bool {
        self.inner.channels.is_connected()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.channels.connectivity()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>> {
        self.inner.channels.subscribe()
    }

    async fn activate(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(TelemetryError::source("OBD adapter not connected"));
        }
        if self.inner.poll_task.is_running() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .poll_task
            .replace(tokio::spawn(async move { inner.poll_loop().await }));
        self.inner.logger.info("Polling started");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if self.inner.poll_task.is_running() {
            self.inner.logger.info("Polling stopped");
        }
        self.inner.poll_task.cancel();
        Ok(())
    }
}

impl Drop for ObdProvider {
    fn drop(&mut self) {
        self.inner.poll_task.cancel();
        self.inner.reconnect_task.cancel();
    }
}
