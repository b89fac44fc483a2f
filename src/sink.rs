//! Outward sinks for telemetry and completed sessions

use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::session::{ChargingSample, ChargingSession};
use crate::telemetry::TelemetrySnapshot;
use async_trait::async_trait;

/// Receiver of published snapshots and session records
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Publish one snapshot of the unified stream
    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<()>;

    /// Archive a completed charging session
    async fn archive(&self, session: &ChargingSession) -> Result<()>;

    /// Record a sample of the active session
    async fn record_sample(&self, _session_id: &str, _sample: &ChargingSample) -> Result<()> {
        Ok(())
    }
}

/// Sink writing every record to the log
pub struct LogSink {
    logger: StructuredLogger,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            logger: get_logger("sink"),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for LogSink {
    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let fields = snapshot
            .entries()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        self.logger.info(&format!("Telemetry {}", fields));
        Ok(())
    }

    async fn archive(&self, session: &ChargingSession) -> Result<()> {
        self.logger.info(&format!(
            "Session {} completed: {}",
            session.id,
            session.to_wire()
        ));
        Ok(())
    }

    async fn record_sample(&self, session_id: &str, sample: &ChargingSample) -> Result<()> {
        self.logger.debug(&format!(
            "Session {} sample soc={:?} power={:?}",
            session_id, sample.soc, sample.power_kw
        ));
        Ok(())
    }
}
