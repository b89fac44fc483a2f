//! Typed settings lookup
//!
//! The host application may keep settings in several backends. The core only
//! needs "get bool/int/float/string by key"; [`LayeredSettings`] applies the
//! one merge policy: the first provider that answers a key wins.

use std::collections::HashMap;

/// Typed read access to settings by dotted key (e.g. `poll.interval_ms`)
pub trait SettingsProvider: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_float(&self, key: &str) -> Option<f64>;
    fn get_string(&self, key: &str) -> Option<String>;
}

/// In-memory settings backed by YAML values
#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: HashMap<String, serde_yaml::Value>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<V: Into<serde_yaml::Value>>(mut self, key: &str, value: V) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn insert<V: Into<serde_yaml::Value>>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_string(), value.into());
    }
}

impl SettingsProvider for MapSettings {
    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            serde_yaml::Value::Bool(b) => Some(*b),
            serde_yaml::Value::String(s) => parse_bool(s),
            _ => None,
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            serde_yaml::Value::Number(n) => n.as_i64(),
            serde_yaml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            serde_yaml::Value::Number(n) => n.as_f64(),
            serde_yaml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Settings read from environment variables
///
/// Key `poll.interval_ms` maps to `EVTELEMETRY_POLL__INTERVAL_MS`.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    prefix: String,
}

impl EnvSettings {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn var_name(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.replace('.', "__")).to_uppercase()
    }

    fn raw(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self::new("EVTELEMETRY")
    }
}

impl SettingsProvider for EnvSettings {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.raw(key).as_deref().and_then(parse_bool)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.raw(key)?.trim().parse().ok()
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        self.raw(key)?.trim().parse().ok()
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.raw(key)
    }
}

/// Ordered chain of providers; the first one that answers wins
#[derive(Default)]
pub struct LayeredSettings {
    layers: Vec<Box<dyn SettingsProvider>>,
}

impl LayeredSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider with lower precedence than those already added
    pub fn push(mut self, provider: Box<dyn SettingsProvider>) -> Self {
        self.layers.push(provider);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl SettingsProvider for LayeredSettings {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.layers.iter().find_map(|l| l.get_bool(key))
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.layers.iter().find_map(|l| l.get_int(key))
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        self.layers.iter().find_map(|l| l.get_float(key))
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|l| l.get_string(key))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
