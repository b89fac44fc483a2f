//! # evtelemetry - EV battery telemetry and charging sessions
//!
//! Decodes OBD-II responses from an ELM327-style adapter into physical
//! battery quantities, arbitrates between telemetry sources and tracks
//! charging sessions with energy and consumption figures.
//!
//! ## Architecture
//!
//! - `obd`: PID tables, formula evaluation, response decoding and
//!   multi-frame reassembly
//! - `transport`: adapter link capability and request timeouts
//! - `scheduler`: high/low priority poll cycles
//! - `telemetry`: decoded samples and normalized snapshots
//! - `source`: OBD, cloud and mock providers plus the source manager
//! - `session`: charging session state machine and derived metrics
//! - `sink`, `persistence`: outward sinks and the JSON session archive
//! - `driver`: the run loop wiring everything together
//! - `config`, `logging`, `error`: ambient configuration, tracing and errors

pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod obd;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod config_tests;

// Re-export commonly used types
pub use config::Config;
pub use driver::TelemetryDriver;
pub use error::{Result, TelemetryError};
pub use telemetry::{DecodedSample, TelemetrySnapshot};
