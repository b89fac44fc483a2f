//! Charging session tracking
//!
//! [`SessionTracker`] watches the unified telemetry stream and drives a
//! two-state machine (`Idle`, `Charging`). A session starts on an explicit
//! charging signal or, without one, on a rising cumulative-charge counter. It
//! ends when the signal drops, when the counter stops rising for a number of
//! samples, or when the battery is full. Completed sessions are handed out as
//! events; the tracker keeps no history beyond the previous session's end
//! odometer.

use crate::config::SessionConfig;
use crate::logging::{StructuredLogger, get_logger};
use crate::telemetry::TelemetrySnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Charging session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSession {
    /// Unique session ID
    pub id: String,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Cumulative charge counter at start (Ah)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_cumulative_charge_ah: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_cumulative_charge_ah: Option<f64>,

    /// State of charge at start (%)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_soc: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_soc: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_odometer_km: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_odometer_km: Option<f64>,

    /// End odometer of the session before this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_end_odometer_km: Option<f64>,

    #[serde(rename = "active")]
    pub is_active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charging_type: Option<String>,

    /// Highest charging power magnitude seen (kW)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_power_kw: Option<f64>,

    /// Mean of the known pack voltages during the session (V)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_voltage: Option<f64>,
}

impl ChargingSession {
    /// New active session starting at `start_time`
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start_time,
            end_time: None,
            start_cumulative_charge_ah: None,
            end_cumulative_charge_ah: None,
            start_soc: None,
            end_soc: None,
            start_odometer_km: None,
            end_odometer_km: None,
            previous_end_odometer_km: None,
            is_active: true,
            charging_type: None,
            peak_power_kw: None,
            average_voltage: None,
        }
    }

    /// Charge moved into the battery (Ah)
    pub fn energy_ah(&self) -> Option<f64> {
        Some(self.end_cumulative_charge_ah? - self.start_cumulative_charge_ah?)
    }

    /// Energy moved into the battery (kWh), only with a known average voltage
    pub fn energy_kwh(&self) -> Option<f64> {
        Some(self.energy_ah()? * self.average_voltage? / 1000.0)
    }

    pub fn soc_gained(&self) -> Option<f64> {
        Some(self.end_soc? - self.start_soc?)
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        Some((self.end_time? - self.start_time).num_seconds())
    }

    /// Mean charging rate over the session (kW)
    pub fn average_rate_kw(&self) -> Option<f64> {
        let seconds = self.duration_seconds()?;
        if seconds <= 0 {
            return None;
        }
        Some(self.energy_kwh()? * 3600.0 / seconds as f64)
    }

    /// Distance driven since the previous session ended (km)
    pub fn distance_km(&self) -> Option<f64> {
        Some(self.start_odometer_km? - self.previous_end_odometer_km?)
    }

    /// Consumption over the distance since the previous session (kWh/100 km)
    pub fn consumption_kwh_per_100km(&self) -> Option<f64> {
        let distance = self.distance_km()?;
        if distance <= 0.0 {
            return None;
        }
        Some(self.energy_kwh()? / distance * 100.0)
    }

    /// Wire form: stored fields plus the derived metrics that are known
    pub fn to_wire(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            let derived = [
                ("energyAh", self.energy_ah()),
                ("energyKwh", self.energy_kwh()),
                ("socGained", self.soc_gained()),
                ("durationSeconds", self.duration_seconds().map(|s| s as f64)),
                ("averageRateKw", self.average_rate_kw()),
                ("distanceSinceLastChargeKm", self.distance_km()),
                ("consumptionKwhPer100Km", self.consumption_kwh_per_100km()),
            ];
            for (key, v) in derived {
                if let Some(v) = v {
                    map.insert(key.to_string(), serde_json::json!(v));
                }
            }
        }
        value
    }
}

/// One telemetry point recorded while a session is active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSample {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_kw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
}

impl ChargingSample {
    pub fn from_snapshot(snap: &TelemetrySnapshot) -> Self {
        Self {
            timestamp: snap.timestamp,
            soc: snap.state_of_charge,
            power_kw: snap.power_kw,
            temperature: snap.temperature,
            voltage: snap.voltage,
            current: snap.current,
        }
    }
}

/// Tracker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Charging,
}

/// Session lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started(ChargingSession),
    Sample {
        session_id: String,
        sample: ChargingSample,
    },
    Completed(ChargingSession),
    /// The cumulative-charge counter jumped; later readings were re-based
    CounterDiscontinuity { previous_ah: f64, current_ah: f64 },
}

/// Charging session state machine
pub struct SessionTracker {
    config: SessionConfig,
    active: Option<ChargingSession>,
    last_raw_counter: Option<f64>,
    counter_offset_ah: f64,
    rebaseline: bool,
    idle_samples: u32,
    voltage_samples: u32,
    previous_end_odometer: Option<f64>,
    logger: StructuredLogger,
}

impl SessionTracker {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            active: None,
            last_raw_counter: None,
            counter_offset_ah: 0.0,
            rebaseline: false,
            idle_samples: 0,
            voltage_samples: 0,
            previous_end_odometer: None,
            logger: get_logger("session"),
        }
    }

    /// Seed the end odometer of the last archived session
    pub fn with_previous_end_odometer(mut self, odometer_km: Option<f64>) -> Self {
        self.previous_end_odometer = odometer_km;
        self
    }

    pub fn state(&self) -> TrackerState {
        if self.active.is_some() {
            TrackerState::Charging
        } else {
            TrackerState::Idle
        }
    }

    pub fn active_session(&self) -> Option<&ChargingSession> {
        self.active.as_ref()
    }

    pub fn previous_end_odometer(&self) -> Option<f64> {
        self.previous_end_odometer
    }

    /// Offset added to raw counter readings to bridge resets (Ah)
    pub fn counter_offset_ah(&self) -> f64 {
        self.counter_offset_ah
    }

    /// The data source changed; the next counter reading starts a new baseline
    pub fn note_source_switch(&mut self) {
        if self.last_raw_counter.is_some() {
            self.rebaseline = true;
        }
    }

    /// Feed one snapshot and collect the resulting events
    pub fn observe(&mut self, snap: &TelemetrySnapshot) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let (previous, current) = self.track_counter(snap.cumulative_charge_ah, &mut events);
        let rising = matches!(
            (previous, current),
            (Some(p), Some(c)) if c - p >= self.config.charge_rise_threshold_ah
        );
        let full = snap
            .state_of_charge
            .is_some_and(|soc| soc >= self.config.full_soc_percent);

        if self.active.is_none() {
            let charging = match snap.is_charging {
                Some(signal) => signal,
                None => rising,
            };
            if !charging || full {
                return events;
            }
            let start_counter = if snap.is_charging.is_some() {
                current
            } else {
                previous
            };
            let session = self.begin(snap, start_counter);
            events.push(SessionEvent::Started(session));
        }

        let Some(session) = self.active.as_mut() else {
            return events;
        };
        Self::update(session, &mut self.voltage_samples, snap, current);
        events.push(SessionEvent::Sample {
            session_id: session.id.clone(),
            sample: ChargingSample::from_snapshot(snap),
        });

        let ended = match snap.is_charging {
            Some(signal) => !signal,
            None => {
                if rising {
                    self.idle_samples = 0;
                } else {
                    self.idle_samples += 1;
                }
                self.idle_samples >= self.config.idle_samples_to_end
            }
        };
        if (ended || full)
            && let Some(done) = self.finish(snap.timestamp)
        {
            events.push(SessionEvent::Completed(done));
        }
        events
    }

    /// Returns (previous, current) counter values on the re-based scale
    ///
    /// Outside a source switch only drops beyond the tolerance count as
    /// resets; a rise of any size is charge taken in between readings.
    fn track_counter(
        &mut self,
        raw: Option<f64>,
        events: &mut Vec<SessionEvent>,
    ) -> (Option<f64>, Option<f64>) {
        let Some(raw) = raw else {
            return (None, None);
        };
        let Some(last) = self.last_raw_counter else {
            self.last_raw_counter = Some(raw);
            return (None, Some(raw + self.counter_offset_ah));
        };

        let jump = last - raw;
        if self.rebaseline || jump > self.config.counter_reset_tolerance_ah {
            if jump.abs() > self.config.counter_reset_tolerance_ah {
                self.logger.warn(&format!(
                    "Cumulative charge counter jumped from {:.3} to {:.3} Ah",
                    last, raw
                ));
                events.push(SessionEvent::CounterDiscontinuity {
                    previous_ah: last,
                    current_ah: raw,
                });
            }
            self.counter_offset_ah += jump;
            self.rebaseline = false;
            self.last_raw_counter = Some(raw);
            let adjusted = raw + self.counter_offset_ah;
            return (Some(adjusted), Some(adjusted));
        }

        if raw < last {
            // Small dips are noise; hold the last reading
            let held = last + self.counter_offset_ah;
            return (Some(held), Some(held));
        }

        self.last_raw_counter = Some(raw);
        (
            Some(last + self.counter_offset_ah),
            Some(raw + self.counter_offset_ah),
        )
    }

    fn begin(&mut self, snap: &TelemetrySnapshot, start_counter: Option<f64>) -> ChargingSession {
        let mut session = ChargingSession::new(snap.timestamp);
        session.start_cumulative_charge_ah = start_counter;
        session.start_soc = snap.state_of_charge;
        session.start_odometer_km = snap.odometer_km;
        session.previous_end_odometer_km = self.previous_end_odometer;
        session.charging_type = snap.charging_type().map(str::to_string);
        self.idle_samples = 0;
        self.voltage_samples = 0;
        self.logger.info(&format!(
            "Charging session {} started (soc={:?}, counter={:?})",
            session.id, session.start_soc, session.start_cumulative_charge_ah
        ));
        self.active = Some(session.clone());
        session
    }

    fn update(
        session: &mut ChargingSession,
        voltage_samples: &mut u32,
        snap: &TelemetrySnapshot,
        counter: Option<f64>,
    ) {
        if session.start_cumulative_charge_ah.is_none() {
            session.start_cumulative_charge_ah = counter;
        }
        if session.start_soc.is_none() {
            session.start_soc = snap.state_of_charge;
        }
        if session.start_odometer_km.is_none() {
            session.start_odometer_km = snap.odometer_km;
        }
        if let Some(c) = counter {
            session.end_cumulative_charge_ah = Some(c);
        }
        if let Some(soc) = snap.state_of_charge {
            session.end_soc = Some(soc);
        }
        if let Some(odo) = snap.odometer_km {
            session.end_odometer_km = Some(odo);
        }
        if let Some(v) = snap.voltage {
            let n = f64::from(*voltage_samples);
            let mean = session.average_voltage.unwrap_or(0.0);
            session.average_voltage = Some((mean * n + v) / (n + 1.0));
            *voltage_samples += 1;
        }
        if let Some(p) = snap.power_kw {
            let p = p.abs();
            if session.peak_power_kw.is_none_or(|peak| p > peak) {
                session.peak_power_kw = Some(p);
            }
        }
        if session.charging_type.is_none() {
            session.charging_type = snap.charging_type().map(str::to_string);
        }
    }

    fn finish(&mut self, at: DateTime<Utc>) -> Option<ChargingSession> {
        let mut session = self.active.take()?;
        session.end_time = Some(at.max(session.start_time));
        session.is_active = false;
        self.idle_samples = 0;
        if let Some(odo) = session.end_odometer_km.or(session.start_odometer_km) {
            self.previous_end_odometer = Some(odo);
        }
        self.logger.info(&format!(
            "Charging session {} completed: {:?} Ah, {:?} kWh",
            session.id,
            session.energy_ah(),
            session.energy_kwh()
        ));
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()
    }

    #[test]
    fn derived_metrics() {
        let mut s = ChargingSession::new(t0());
        s.start_cumulative_charge_ah = Some(100.0);
        s.end_cumulative_charge_ah = Some(150.0);
        s.average_voltage = Some(350.0);
        s.start_odometer_km = Some(500.0);
        s.previous_end_odometer_km = Some(480.0);
        s.end_time = Some(t0() + Duration::hours(1));

        assert_eq!(s.energy_ah(), Some(50.0));
        assert_eq!(s.energy_kwh(), Some(17.5));
        assert_eq!(s.distance_km(), Some(20.0));
        assert_eq!(s.consumption_kwh_per_100km(), Some(87.5));
        assert_eq!(s.average_rate_kw(), Some(17.5));
        assert_eq!(s.duration_seconds(), Some(3600));
    }

    #[test]
    fn missing_inputs_leave_derived_fields_undefined() {
        let mut s = ChargingSession::new(t0());
        s.start_cumulative_charge_ah = Some(100.0);
        s.end_cumulative_charge_ah = Some(150.0);
        s.start_odometer_km = Some(500.0);
        assert_eq!(s.energy_kwh(), None);
        assert_eq!(s.distance_km(), None);
        assert_eq!(s.consumption_kwh_per_100km(), None);

        s.average_voltage = Some(350.0);
        s.previous_end_odometer_km = Some(500.0);
        assert_eq!(s.distance_km(), Some(0.0));
        assert_eq!(s.consumption_kwh_per_100km(), None);
    }

    #[test]
    fn wire_form_carries_derived_fields_and_roundtrips() {
        let mut s = ChargingSession::new(t0());
        s.start_cumulative_charge_ah = Some(100.0);
        s.end_cumulative_charge_ah = Some(150.0);
        s.average_voltage = Some(350.0);
        s.end_time = Some(t0() + Duration::minutes(30));
        s.is_active = false;
        s.charging_type = Some("AC".to_string());

        let wire = s.to_wire();
        assert_eq!(wire["energyKwh"], 17.5);
        assert_eq!(wire["active"], false);
        assert_eq!(wire["startTime"], "2024-05-01T20:00:00Z");
        assert!(wire.get("consumptionKwhPer100Km").is_none());

        let back: ChargingSession = serde_json::from_value(wire).unwrap();
        assert_eq!(back, s);
    }
}
