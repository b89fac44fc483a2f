//! PID descriptors and the PID table
//!
//! A descriptor names one queryable quantity, the request sent to the adapter
//! and how the response is turned into a number. The persisted form is a JSON
//! array of `{name, pid, description, type, formula?, header?, priority}`.

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Built-in decoding rule selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PidType {
    Speed,
    StateOfCharge,
    BatteryVoltage,
    Odometer,
    CumulativeCharge,
    CumulativeDischarge,
    CellVoltages,
    CellTemperatures,
    Custom,
}

impl PidType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::StateOfCharge => "stateOfCharge",
            Self::BatteryVoltage => "batteryVoltage",
            Self::Odometer => "odometer",
            Self::CumulativeCharge => "cumulativeCharge",
            Self::CumulativeDischarge => "cumulativeDischarge",
            Self::CellVoltages => "cellVoltages",
            Self::CellTemperatures => "cellTemperatures",
            Self::Custom => "custom",
        }
    }

    /// Parse a persisted type label; unknown labels fall back to `Speed`
    pub fn from_label(s: &str) -> Self {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "speed" => Self::Speed,
            "stateofcharge" | "soc" => Self::StateOfCharge,
            "batteryvoltage" => Self::BatteryVoltage,
            "odometer" => Self::Odometer,
            "cumulativecharge" => Self::CumulativeCharge,
            "cumulativedischarge" => Self::CumulativeDischarge,
            "cellvoltages" => Self::CellVoltages,
            "celltemperatures" => Self::CellTemperatures,
            "custom" => Self::Custom,
            _ => Self::Speed,
        }
    }

    /// Whether the response carries one value per battery cell
    pub fn is_array(&self) -> bool {
        matches!(self, Self::CellVoltages | Self::CellTemperatures)
    }
}

impl From<String> for PidType {
    fn from(s: String) -> Self {
        Self::from_label(&s)
    }
}

impl From<PidType> for String {
    fn from(t: PidType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for PidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polling tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    /// Queried every cycle
    #[default]
    High,
    /// Queried once per low-priority period
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

impl From<String> for Priority {
    fn from(s: String) -> Self {
        if s.trim().eq_ignore_ascii_case("low") {
            Self::Low
        } else {
            Self::High
        }
    }
}

impl From<Priority> for String {
    fn from(p: Priority) -> Self {
        p.as_str().to_string()
    }
}

/// One queryable quantity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidDescriptor {
    name: String,
    pid: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default = "default_pid_type")]
    pid_type: PidType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    header: Option<String>,
    #[serde(default)]
    priority: Priority,
}

fn default_pid_type() -> PidType {
    PidType::Speed
}

impl PidDescriptor {
    pub fn new(name: &str, pid: &str, pid_type: PidType) -> Self {
        Self {
            name: name.to_string(),
            pid: pid.trim().to_uppercase(),
            description: String::new(),
            pid_type,
            formula: None,
            header: None,
            priority: Priority::High,
        }
    }

    pub fn with_formula(mut self, formula: &str) -> Self {
        let formula = formula.trim();
        self.formula = (!formula.is_empty()).then(|| formula.to_string());
        self
    }

    pub fn with_header(mut self, header: &str) -> Self {
        let header = header.trim().to_uppercase();
        self.header = (!header.is_empty()).then_some(header);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request text sent to the adapter
    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pid_type(&self) -> PidType {
        self.pid_type
    }

    pub fn formula(&self) -> Option<&str> {
        self.formula.as_deref()
    }

    /// ECU header the adapter must address before sending the request
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// Ordered, read-only set of PID descriptors with unique names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PidTable {
    pids: Vec<PidDescriptor>,
}

impl PidTable {
    pub fn new(pids: Vec<PidDescriptor>) -> Result<Self> {
        for (i, pid) in pids.iter().enumerate() {
            if pid.name.is_empty() {
                return Err(TelemetryError::validation(
                    "pid.name".to_string(),
                    format!("PID #{} has an empty name", i),
                ));
            }
            if pid.pid.is_empty() {
                return Err(TelemetryError::validation(
                    "pid.pid".to_string(),
                    format!("PID {} has an empty request", pid.name),
                ));
            }
            if pids[..i].iter().any(|p| p.name == pid.name) {
                return Err(TelemetryError::validation(
                    "pid.name".to_string(),
                    format!("Duplicate PID name {}", pid.name),
                ));
            }
        }
        Ok(Self { pids })
    }

    /// Parse the persisted JSON array form
    pub fn from_json(json: &str) -> Result<Self> {
        let pids: Vec<PidDescriptor> = serde_json::from_str(json)?;
        Self::new(pids)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.pids)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Default table for a typical CAN-based EV behind an ELM327-style adapter
    pub fn default_ev() -> Self {
        let pids = vec![
            PidDescriptor::new("SOC", "015B", PidType::StateOfCharge)
                .with_description("Hybrid/EV battery pack remaining charge"),
            PidDescriptor::new("Speed", "010D", PidType::Speed).with_description("Vehicle speed"),
            PidDescriptor::new("BatteryVoltage", "220101", PidType::BatteryVoltage)
                .with_header("7E4")
                .with_formula("[B13:B14]/10")
                .with_description("HV battery pack voltage"),
            PidDescriptor::new("BatteryCurrent", "220101", PidType::Custom)
                .with_header("7E4")
                .with_formula("([B11:B12]-65536*(B11>>7))/10")
                .with_description("HV battery pack current, positive when discharging"),
            PidDescriptor::new("CumulativeCharge", "220105", PidType::CumulativeCharge)
                .with_header("7E4")
                .with_description("Cumulative charge counter (Ah)"),
            PidDescriptor::new("CumulativeDischarge", "220106", PidType::CumulativeDischarge)
                .with_header("7E4")
                .with_description("Cumulative discharge counter (Ah)"),
            PidDescriptor::new("Odometer", "01A6", PidType::Odometer)
                .with_priority(Priority::Low)
                .with_description("Odometer"),
            PidDescriptor::new("CellVoltages", "220102", PidType::CellVoltages)
                .with_header("7E4")
                .with_priority(Priority::Low)
                .with_description("Per-cell voltages"),
            PidDescriptor::new("CellTemperatures", "220103", PidType::CellTemperatures)
                .with_header("7E4")
                .with_priority(Priority::Low)
                .with_description("Per-module temperatures"),
            PidDescriptor::new("SOH", "220107", PidType::Custom)
                .with_header("7E4")
                .with_formula("[B27:B28]/10")
                .with_priority(Priority::Low)
                .with_description("Battery state of health"),
        ];
        Self { pids }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PidDescriptor> {
        self.pids.iter()
    }

    pub fn get(&self, name: &str) -> Option<&PidDescriptor> {
        self.pids.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

impl<'a> IntoIterator for &'a PidTable {
    type Item = &'a PidDescriptor;
    type IntoIter = std::slice::Iter<'a, PidDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.pids.iter()
    }
}
