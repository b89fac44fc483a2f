//! Cloud vehicle-info API data source
//!
//! The provider polls a [`VehicleInfoClient`] on a refresh timer and turns
//! each status into a snapshot. The HTTP client is available with the
//! `cloud` feature; tests and hosts may inject their own client.

use super::{DataSourceProvider, ProviderChannels, SourceKind, TaskSlot};
use crate::error::{Result, TelemetryError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::telemetry::{CHARGING_TYPE_KEY, TelemetrySnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{MissedTickBehavior, interval, sleep};

/// Vehicle status as reported by the vehicle-info API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatus {
    pub vin: Option<String>,
    /// State of charge (%)
    pub soc: Option<f64>,
    /// State of health (%)
    pub soh: Option<f64>,
    pub capacity_kwh: Option<f64>,
    pub range_km: Option<f64>,
    pub odometer_km: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub battery_temperature: Option<f64>,
    pub is_charging: Option<bool>,
    /// Charging power delivered into the battery (kW)
    pub charging_power_kw: Option<f64>,
    pub charging_type: Option<String>,
    /// Time the vehicle last reported to the API
    pub timestamp: Option<DateTime<Utc>>,
}

impl VehicleStatus {
    /// Normalized snapshot; `received_at` is used when the API gives no time
    pub fn to_snapshot(&self, received_at: DateTime<Utc>) -> TelemetrySnapshot {
        let mut snap = TelemetrySnapshot {
            state_of_charge: self.soc,
            state_of_health: self.soh,
            capacity_kwh: self.capacity_kwh,
            range_km: self.range_km,
            odometer_km: self.odometer_km,
            speed_kmh: self.speed_kmh,
            temperature: self.battery_temperature,
            is_charging: self.is_charging,
            // Snapshot power is positive when discharging
            power_kw: self.charging_power_kw.map(|p| -p),
            ..TelemetrySnapshot::new(self.timestamp.unwrap_or(received_at))
        };
        if let Some(vin) = &self.vin {
            snap.extensions
                .insert("vin".to_string(), serde_json::json!(vin));
        }
        if let Some(kind) = &self.charging_type {
            snap.extensions
                .insert(CHARGING_TYPE_KEY.to_string(), serde_json::json!(kind));
        }
        snap
    }
}

/// Vehicle-info API client
#[async_trait]
pub trait VehicleInfoClient: Send + Sync {
    async fn fetch_status(&self) -> Result<VehicleStatus>;
}

/// HTTP client for `GET <base_url>/vehicles/<id>/status`
#[cfg(feature = "cloud")]
pub struct HttpVehicleInfoClient {
    http: reqwest::Client,
    base_url: String,
    vehicle_id: String,
    access_token: String,
}

#[cfg(feature = "cloud")]
impl HttpVehicleInfoClient {
    pub fn new(config: &crate::config::CloudConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vehicle_id: config.vehicle_id.clone(),
            access_token: config.access_token.clone(),
        })
    }

    pub fn status_url(&self) -> String {
        format!("{}/vehicles/{}/status", self.base_url, self.vehicle_id)
    }
}

#[cfg(feature = "cloud")]
#[async_trait]
impl VehicleInfoClient for HttpVehicleInfoClient {
    async fn fetch_status(&self) -> Result<VehicleStatus> {
        use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};

        let mut request = self
            .http
            .get(self.status_url())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, concat!("evtelemetry/", env!("CARGO_PKG_VERSION")));
        if !self.access_token.trim().is_empty() {
            request = request.header(
                AUTHORIZATION,
                format!("Bearer {}", self.access_token.trim()),
            );
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(TelemetryError::api(format!(
                "Vehicle API returned {}",
                resp.status()
            )));
        }
        Ok(resp.json::<VehicleStatus>().await?)
    }
}

/// Failed refreshes in a row before the API counts as unreachable
pub const MAX_REFRESH_FAILURES: u32 = 3;

struct CloudInner {
    client: Arc<dyn VehicleInfoClient>,
    refresh_interval: Duration,
    channels: ProviderChannels,
    refresh_task: TaskSlot,
    reconnect_task: TaskSlot,
    logger: StructuredLogger,
}

/// Data source backed by a vehicle-info API
pub struct CloudProvider {
    inner: Arc<CloudInner>,
}

impl CloudProvider {
    pub fn new(client: Arc<dyn VehicleInfoClient>, refresh_interval: Duration) -> Self {
        Self {
            inner: Arc::new(CloudInner {
                client,
                refresh_interval,
                channels: ProviderChannels::new(),
                refresh_task: TaskSlot::default(),
                reconnect_task: TaskSlot::default(),
                logger: get_logger_with_context(LogContext::new("source").with_source("cloud")),
            }),
        }
    }
}

impl CloudInner {
    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            ticker.tick().await;
            match self.client.fetch_status().await {
                Ok(status) => {
                    failures = 0;
                    self.channels.set_connected(true);
                    self.channels.publish(status.to_snapshot(Utc::now()));
                }
                Err(e) => {
                    failures += 1;
                    self.logger.warn(&format!(
                        "Vehicle status refresh failed ({}/{}): {}",
                        failures, MAX_REFRESH_FAILURES, e
                    ));
                    if failures >= MAX_REFRESH_FAILURES {
                        self.logger.error("Vehicle API unreachable");
                        self.channels.set_connected(false);
                        let inner = Arc::clone(&self);
                        self.reconnect_task
                            .replace(tokio::spawn(async move { inner.reconnect_loop().await }));
                        return;
                    }
                }
            }
        }
    }

    /// Probe the API on the refresh interval until it answers again
    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            sleep(self.refresh_interval).await;
            match self.client.fetch_status().await {
                Ok(_) => {
                    self.logger.info("Vehicle API reachable again");
                    self.channels.set_connected(true);
                    return;
                }
                Err(e) => self.logger.debug(&format!("Reconnect failed: {}", e)),
            }
        }
    }
}

#[async_trait]
impl DataSourceProvider for CloudProvider {
    fn kind(&self) -> SourceKind {
        SourceKind::Cloud
    }

    async fn connect(&self) -> Result<()> {
        self.inner.reconnect_task.cancel();
        match self.inner.client.fetch_status().await {
            Ok(status) => {
                self.inner.logger.info(&format!(
                    "Connected (vin={})",
                    status.vin.as_deref().unwrap_or("unknown")
                ));
                self.inner.channels.set_connected(true);
                Ok(())
            }
            Err(e) => {
                self.inner.logger.warn(&format!("Connect failed: {}", e));
                self.inner.channels.set_connected(false);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.refresh_task.cancel();
        self.inner.reconnect_task.cancel();
        self.inner.channels.set_connected(false);
        Ok(())
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
            return Err(TelemetryError::source("Vehicle API not connected"));
        }
        if !self.inner.refresh_task.is_running() {
            let inner = Arc::clone(&self.inner);
            self.inner
                .refresh_task
                .replace(tokio::spawn(async move { inner.refresh_loop().await }));
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.inner.refresh_task.cancel();
        Ok(())
    }
}

impl Drop for CloudProvider {
    fn drop(&mut self) {
        self.inner.refresh_task.cancel();
        self.inner.reconnect_task.cancel();
    }
}
