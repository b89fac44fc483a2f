//! Telemetry value types
//!
//! A [`DecodedSample`] is one PID reading where NaN means "unknown". A
//! [`TelemetrySnapshot`] is the normalized, immutable vehicle state handed
//! from providers to the manager, the tracker and the sinks. Unknown
//! quantities are `None` and are never coerced to zero.

use crate::obd::PidType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One decoded PID reading
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub name: String,
    pub pid_type: PidType,
    /// Physical value, NaN when the response could not be decoded
    pub value: f64,
    /// Per-cell values for array PIDs
    pub cells: Option<Vec<f64>>,
}

impl DecodedSample {
    pub fn new(name: &str, pid_type: PidType, value: f64) -> Self {
        Self {
            name: name.to_string(),
            pid_type,
            value,
            cells: None,
        }
    }

    pub fn unknown(name: &str, pid_type: PidType) -> Self {
        Self::new(name, pid_type, f64::NAN)
    }

    pub fn with_cells(mut self, cells: Vec<f64>) -> Self {
        self.cells = Some(cells);
        self
    }

    pub fn is_unknown(&self) -> bool {
        !self.value.is_finite()
    }

    /// The value, or `None` when unknown
    pub fn known(&self) -> Option<f64> {
        self.value.is_finite().then_some(self.value)
    }
}

/// Normalized vehicle state at one instant
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,

    /// State of charge (%)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_of_charge: Option<f64>,

    /// State of health (%)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_of_health: Option<f64>,

    /// Usable capacity (kWh)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_kwh: Option<f64>,

    /// Pack voltage (V)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,

    /// Pack current (A), positive when discharging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,

    /// Battery temperature (°C)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Remaining range (km)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_km: Option<f64>,

    /// Vehicle speed (km/h)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,

    /// Odometer (km)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odometer_km: Option<f64>,

    /// Battery power (kW)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_kw: Option<f64>,

    /// Cumulative charge counter (Ah)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_charge_ah: Option<f64>,

    /// Cumulative discharge counter (Ah)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_discharge_ah: Option<f64>,

    /// Explicit charging signal reported by the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_charging: Option<bool>,

    /// Source-specific fields, flattened into the wire object
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Extension key carrying the charging connector/type tag
pub const CHARGING_TYPE_KEY: &str = "chargingType";

impl TelemetrySnapshot {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_extension<V: Into<serde_json::Value>>(mut self, key: &str, value: V) -> Self {
        self.extensions.insert(key.to_string(), value.into());
        self
    }

    /// Assemble a snapshot from decoded samples; unknown samples leave fields empty
    pub fn from_samples(timestamp: DateTime<Utc>, samples: &[DecodedSample]) -> Self {
        let mut snap = Self::new(timestamp);
        for sample in samples {
            if let Some(cells) = &sample.cells
                && !cells.is_empty()
            {
                snap.extensions
                    .insert(cells_key(&sample.name), serde_json::json!(cells));
            }
            let Some(value) = sample.known() else {
                continue;
            };
            match sample.pid_type {
                PidType::Speed => snap.speed_kmh = Some(value),
                PidType::StateOfCharge => snap.state_of_charge = Some(value),
                PidType::BatteryVoltage => snap.voltage = Some(value),
                PidType::Odometer => snap.odometer_km = Some(value),
                PidType::CumulativeCharge => snap.cumulative_charge_ah = Some(value),
                PidType::CumulativeDischarge => snap.cumulative_discharge_ah = Some(value),
                PidType::CellVoltages | PidType::CellTemperatures | PidType::Custom => {
                    snap.set_by_name(&sample.name, value)
                }
            }
        }
        if snap.power_kw.is_none()
            && let (Some(v), Some(i)) = (snap.voltage, snap.current)
        {
            snap.power_kw = Some(v * i / 1000.0);
        }
        snap
    }

    /// Route a named custom value to its field, or to the extension map
    fn set_by_name(&mut self, name: &str, value: f64) {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        let slot = match key.as_str() {
            "current" | "batterycurrent" => &mut self.current,
            "temperature" | "batterytemperature" => &mut self.temperature,
            "soh" | "stateofhealth" => &mut self.state_of_health,
            "capacity" | "capacitykwh" => &mut self.capacity_kwh,
            "range" | "rangekm" => &mut self.range_km,
            "power" | "powerkw" => &mut self.power_kw,
            _ => {
                self.extensions
                    .insert(name.to_string(), serde_json::json!(value));
                return;
            }
        };
        *slot = Some(value);
    }

    pub fn charging_type(&self) -> Option<&str> {
        self.extensions.get(CHARGING_TYPE_KEY)?.as_str()
    }

    /// Whether no physical quantity is known
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Fields spread individually for storage, timestamp excluded
    pub fn entries(&self) -> Vec<(String, serde_json::Value)> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter(|(k, _)| k != "timestamp")
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn cells_key(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn samples_map_to_fields() {
        let samples = vec![
            DecodedSample::new("SOC", PidType::StateOfCharge, 55.0),
            DecodedSample::new("BatteryVoltage", PidType::BatteryVoltage, 400.0),
            DecodedSample::new("BatteryCurrent", PidType::Custom, -50.0),
            DecodedSample::unknown("Speed", PidType::Speed),
            DecodedSample::new("InletTemp", PidType::Custom, 21.0),
        ];
        let snap = TelemetrySnapshot::from_samples(ts(), &samples);
        assert_eq!(snap.state_of_charge, Some(55.0));
        assert_eq!(snap.voltage, Some(400.0));
        assert_eq!(snap.current, Some(-50.0));
        assert_eq!(snap.power_kw, Some(-20.0));
        assert_eq!(snap.speed_kmh, None);
        assert_eq!(snap.extensions.get("InletTemp"), Some(&serde_json::json!(21.0)));
    }

    #[test]
    fn unknown_never_becomes_zero() {
        let samples = vec![DecodedSample::unknown("SOC", PidType::StateOfCharge)];
        let snap = TelemetrySnapshot::from_samples(ts(), &samples);
        assert_eq!(snap.state_of_charge, None);
        assert!(snap.is_empty());
    }

    #[test]
    fn cells_go_to_extensions() {
        let samples = vec![
            DecodedSample::new("CellVoltages", PidType::CellVoltages, 3.7)
                .with_cells(vec![3.7, 3.72]),
        ];
        let snap = TelemetrySnapshot::from_samples(ts(), &samples);
        assert_eq!(
            snap.extensions.get("cellVoltages"),
            Some(&serde_json::json!([3.7, 3.72]))
        );
        assert_eq!(snap.extensions.get("CellVoltages"), Some(&serde_json::json!(3.7)));
    }

    #[test]
    fn wire_form_is_flat_with_iso_timestamp() {
        let snap = TelemetrySnapshot {
            state_of_charge: Some(80.0),
            is_charging: Some(true),
            ..TelemetrySnapshot::new(ts())
        }
        .with_extension(CHARGING_TYPE_KEY, "DC");

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(json["stateOfCharge"], 80.0);
        assert_eq!(json["chargingType"], "DC");
        assert!(json.get("voltage").is_none());

        let back: TelemetrySnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.charging_type(), Some("DC"));
    }

    #[test]
    fn entries_spread_fields() {
        let snap = TelemetrySnapshot {
            speed_kmh: Some(12.0),
            ..TelemetrySnapshot::new(ts())
        }
        .with_extension("vin", "KNA123");
        let entries = snap.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|(k, _)| k == "speedKmh"));
        assert!(entries.iter().any(|(k, _)| k == "vin"));
    }
}
