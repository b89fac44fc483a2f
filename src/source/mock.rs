//! Synthetic telemetry feed
//!
//! Cycles a simulated vehicle through driving, charging and parked phases.
//! Each tick advances the simulation by a fixed step so that a demo run
//! shows complete charging sessions within minutes. Noise comes from a
//! seeded [`StdRng`], so a given seed always yields the same series.

use super::{DataSourceProvider, ProviderChannels, SourceKind, TaskSlot};
use crate::config::MockConfig;
use crate::error::{Result, TelemetryError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::telemetry::{CHARGING_TYPE_KEY, TelemetrySnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{MissedTickBehavior, interval};

const CAPACITY_KWH: f64 = 64.0;
const CHARGE_POWER_KW: f64 = 11.0;
const CHARGE_TARGET_SOC: f64 = 80.0;
const CHARGE_START_SOC: f64 = 30.0;
const PARKED_TICKS: u32 = 10;
const DEFAULT_STEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPhase {
    Driving,
    Charging,
    Parked,
}

/// Deterministic vehicle simulation
#[derive(Debug, Clone)]
pub struct MockFeed {
    rng: StdRng,
    step_hours: f64,
    phase: MockPhase,
    phase_ticks: u32,
    soc: f64,
    cumulative_charge_ah: f64,
    cumulative_discharge_ah: f64,
    odometer_km: f64,
}

impl MockFeed {
    pub fn new(seed: u64, start_soc: f64) -> Self {
        let soc = start_soc.clamp(0.0, 100.0);
        Self {
            rng: StdRng::seed_from_u64(seed),
            step_hours: DEFAULT_STEP.as_secs_f64() / 3600.0,
            phase: if soc <= CHARGE_START_SOC {
                MockPhase::Charging
            } else {
                MockPhase::Driving
            },
            phase_ticks: 0,
            soc,
            cumulative_charge_ah: 1000.0,
            cumulative_discharge_ah: 1100.0,
            odometer_km: 12_000.0,
        }
    }

    /// Simulated time covered by one tick
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step_hours = step.as_secs_f64() / 3600.0;
        self
    }

    pub fn phase(&self) -> MockPhase {
        self.phase
    }

    fn pack_voltage(&self) -> f64 {
        340.0 + self.soc * 0.8
    }

    fn enter(&mut self, phase: MockPhase) {
        self.phase = phase;
        self.phase_ticks = 0;
    }

    /// Advance one tick and report the resulting state
    pub fn next(&mut self, timestamp: DateTime<Utc>) -> TelemetrySnapshot {
        let voltage = self.pack_voltage() + self.rng.gen_range(-0.5..0.5);
        let temperature = 24.0 + self.rng.gen_range(-1.0..1.0);
        let mut speed = 0.0;

        // kW, positive when discharging
        let power = match self.phase {
            MockPhase::Driving => {
                speed = 55.0 + self.rng.gen_range(-10.0..10.0);
                self.odometer_km += speed * self.step_hours;
                12.0 + self.rng.gen_range(-3.0..3.0)
            }
            MockPhase::Charging => -(CHARGE_POWER_KW + self.rng.gen_range(-0.2..0.2)),
            MockPhase::Parked => 0.0,
        };

        let current = power * 1000.0 / voltage;
        let amp_hours = current.abs() * self.step_hours;
        if power > 0.0 {
            self.cumulative_discharge_ah += amp_hours;
        } else if power < 0.0 {
            self.cumulative_charge_ah += amp_hours;
        }
        self.soc = (self.soc - power * self.step_hours / CAPACITY_KWH * 100.0).clamp(0.0, 100.0);
        let charging = self.phase == MockPhase::Charging;

        self.phase_ticks += 1;
        match self.phase {
            MockPhase::Driving if self.soc <= CHARGE_START_SOC => self.enter(MockPhase::Charging),
            MockPhase::Charging if self.soc >= CHARGE_TARGET_SOC => self.enter(MockPhase::Parked),
            MockPhase::Parked if self.phase_ticks >= PARKED_TICKS => self.enter(MockPhase::Driving),
            _ => {}
        }

        let mut snap = TelemetrySnapshot {
            state_of_charge: Some((self.soc * 10.0).round() / 10.0),
            state_of_health: Some(96.5),
            capacity_kwh: Some(CAPACITY_KWH),
            voltage: Some(voltage),
            current: Some(current),
            temperature: Some(temperature),
            range_km: Some(self.soc / 100.0 * CAPACITY_KWH / 0.16),
            speed_kmh: Some(speed),
            odometer_km: Some(self.odometer_km),
            power_kw: Some(power),
            cumulative_charge_ah: Some(self.cumulative_charge_ah),
            cumulative_discharge_ah: Some(self.cumulative_discharge_ah),
            is_charging: Some(charging),
            ..TelemetrySnapshot::new(timestamp)
        };
        if charging {
            snap.extensions
                .insert(CHARGING_TYPE_KEY.to_string(), serde_json::json!("AC"));
        }
        snap
    }
}

struct MockInner {
    enabled: bool,
    interval: Duration,
    feed: Mutex<MockFeed>,
    channels: ProviderChannels,
    emit_task: TaskSlot,
    logger: StructuredLogger,
}

/// Data source emitting [`MockFeed`] snapshots
pub struct MockProvider {
    inner: Arc<MockInner>,
}

impl MockProvider {
    pub fn new(config: &MockConfig) -> Self {
        Self::with_feed(
            MockFeed::new(config.seed, config.start_soc),
            Duration::from_millis(config.interval_ms.max(1)),
            config.enabled,
        )
    }

    pub fn with_feed(feed: MockFeed, interval: Duration, enabled: bool) -> Self {
        Self {
            inner: Arc::new(MockInner {
                enabled,
                interval,
                feed: Mutex::new(feed),
                channels: ProviderChannels::new(),
                emit_task: TaskSlot::default(),
                logger: get_logger_with_context(LogContext::new("source").with_source("mock")),
            }),
        }
    }
}

impl MockInner {
    async fn emit_loop(self: Arc<Self>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = self.feed.lock().await.next(Utc::now());
            self.channels.publish(snapshot);
        }
    }
}

#[async_trait]
impl DataSourceProvider for MockProvider {
    fn kind(&self) -> SourceKind {
        SourceKind::Mock
    }

    async fn connect(&self) -> Result<()> {
        if !self.inner.enabled {
            return Err(TelemetryError::source("Mock source disabled"));
        }
        self.inner.channels.set_connected(true);
        self.inner.logger.info("Connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.emit_task.cancel();
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
            return Err(TelemetryError::source("Mock source not connected"));
        }
        if !self.inner.emit_task.is_running() {
            let inner = Arc::clone(&self.inner);
            self.inner
                .emit_task
                .replace(tokio::spawn(async move { inner.emit_loop().await }));
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.inner.emit_task.cancel();
        Ok(())
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.inner.emit_task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_series() {
        let now = Utc::now();
        let mut a = MockFeed::new(7, 60.0);
        let mut b = MockFeed::new(7, 60.0);
        for _ in 0..20 {
            assert_eq!(a.next(now), b.next(now));
        }
    }

    #[test]
    fn drives_down_then_charges_to_target() {
        let now = Utc::now();
        let mut feed = MockFeed::new(1, 35.0);
        let mut saw_charging = false;
        let mut last_charge = 0.0;
        for _ in 0..2000 {
            let snap = feed.next(now);
            let soc = snap.state_of_charge.unwrap();
            assert!((0.0..=100.0).contains(&soc));
            let charge = snap.cumulative_charge_ah.unwrap();
            assert!(charge >= last_charge);
            last_charge = charge;
            if snap.is_charging == Some(true) {
                saw_charging = true;
                assert!(snap.power_kw.unwrap() < 0.0);
                assert_eq!(snap.charging_type(), Some("AC"));
            }
            if saw_charging && feed.phase() == MockPhase::Parked {
                assert!(soc >= CHARGE_TARGET_SOC - 0.1);
                return;
            }
        }
        panic!("feed never completed a charge");
    }

    #[tokio::test]
    async fn disabled_provider_refuses_connect() {
        let provider = MockProvider::with_feed(MockFeed::new(0, 50.0), Duration::from_secs(1), false);
        assert!(provider.connect().await.is_err());
        assert!(!provider.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn emits_while_active() {
        let provider = MockProvider::with_feed(MockFeed::new(0, 50.0), Duration::from_secs(1), true);
        provider.connect().await.unwrap();
        let mut rx = provider.subscribe();
        provider.activate().await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.odometer_km >= first.odometer_km);
        provider.deactivate().await.unwrap();
    }
}
