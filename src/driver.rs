//! Telemetry driver
//!
//! Wires the data source manager, the session tracker and the sinks. The
//! run loop republishes every snapshot of the unified stream, feeds it to
//! the tracker and routes the resulting session events: samples are
//! recorded and completed sessions archived.

use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::session::{SessionEvent, SessionTracker};
use crate::sink::TelemetrySink;
use crate::source::DataSourceManager;
use crate::telemetry::TelemetrySnapshot;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

pub struct TelemetryDriver {
    manager: Arc<DataSourceManager>,
    tracker: SessionTracker,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    logger: StructuredLogger,
}

impl TelemetryDriver {
    pub fn new(manager: Arc<DataSourceManager>, tracker: SessionTracker) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        Self {
            manager,
            tracker,
            sinks: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            logger: get_logger("driver"),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Sender that stops [`TelemetryDriver::run`]
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn manager(&self) -> &Arc<DataSourceManager> {
        &self.manager
    }

    /// Publish one snapshot and route the tracker's events
    pub async fn handle_snapshot(&mut self, snapshot: &TelemetrySnapshot) {
        for sink in &self.sinks {
            if let Err(e) = sink.publish(snapshot).await {
                self.logger.warn(&format!("Publish failed: {}", e));
            }
        }

        for event in self.tracker.observe(snapshot) {
            match event {
                SessionEvent::Started(session) => {
                    self.logger
                        .info(&format!("Session {} started", session.id));
                }
                SessionEvent::Sample { session_id, sample } => {
                    for sink in &self.sinks {
                        if let Err(e) = sink.record_sample(&session_id, &sample).await {
                            self.logger.warn(&format!("Recording sample failed: {}", e));
                        }
                    }
                }
                SessionEvent::Completed(session) => {
                    for sink in &self.sinks {
                        if let Err(e) = sink.archive(&session).await {
                            self.logger.error(&format!(
                                "Archiving session {} failed: {}",
                                session.id, e
                            ));
                        }
                    }
                }
                SessionEvent::CounterDiscontinuity {
                    previous_ah,
                    current_ah,
                } => {
                    self.logger.warn(&format!(
                        "Counter discontinuity {:.3} -> {:.3} Ah re-based",
                        previous_ah, current_ah
                    ));
                }
            }
        }
    }

    /// Run until a shutdown signal arrives or the stream closes
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Starting telemetry driver");
        let mut stream = self.manager.subscribe();
        let mut active = self.manager.active_source();
        self.manager.initialize().await;

        loop {
            // A source switch must reach the tracker before the new source's data
            tokio::select! {
                biased;

                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let source = *active.borrow_and_update();
                    match source {
                        Some(kind) => self.logger.info(&format!("Telemetry now from {}", kind)),
                        None => self.logger.warn("No telemetry source available"),
                    }
                    self.tracker.note_source_switch();
                }
                received = stream.recv() => match received {
                    Ok(snapshot) => self.handle_snapshot(&snapshot).await,
                    Err(RecvError::Lagged(skipped)) => {
                        self.logger.warn(&format!("Driver lagged, {} snapshots dropped", skipped));
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.manager.shutdown().await;
        self.logger.info("Driver shutdown complete");
        Ok(())
    }
}
