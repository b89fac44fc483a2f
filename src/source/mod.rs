//! Telemetry data sources
//!
//! A provider connects to one origin of vehicle telemetry (OBD-II adapter,
//! cloud vehicle-info API, synthetic feed), reports its connectivity and
//! pushes [`TelemetrySnapshot`]s while active. The [`DataSourceManager`]
//! arbitrates between providers and republishes the active one's stream.

pub mod cloud;
pub mod manager;
pub mod mock;
pub mod obd;

use crate::error::Result;
use crate::telemetry::TelemetrySnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub use cloud::{CloudProvider, VehicleInfoClient, VehicleStatus};
#[cfg(feature = "cloud")]
pub use cloud::HttpVehicleInfoClient;
pub use manager::DataSourceManager;
pub use mock::{MockFeed, MockProvider};
pub use obd::ObdProvider;

/// Capacity of every snapshot broadcast channel
pub const STREAM_CAPACITY: usize = 64;

/// Kind of data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// OBD-II adapter
    Obd,
    /// Cloud vehicle-info API
    Cloud,
    /// Synthetic feed
    Mock,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Obd => "obd",
            SourceKind::Cloud => "cloud",
            SourceKind::Mock => "mock",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "obd" | "obd2" | "adapter" => Ok(SourceKind::Obd),
            "cloud" | "api" => Ok(SourceKind::Cloud),
            "mock" | "demo" => Ok(SourceKind::Mock),
            other => Err(format!("Unknown data source '{}'", other)),
        }
    }
}

/// One origin of vehicle telemetry
#[async_trait]
pub trait DataSourceProvider: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Establish the link; success flips connectivity to `true`
    async fn connect(&self) -> Result<()>;

    /// Stop producing and release the link
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Connectivity flag updates
    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Snapshot stream, fed only while the provider is active
    fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>>;

    /// Start polling/pushing snapshots
    async fn activate(&self) -> Result<()>;

    /// Stop polling/pushing and cancel owned timers
    async fn deactivate(&self) -> Result<()>;
}

/// Connectivity flag and snapshot stream shared by a provider and its tasks
#[derive(Clone)]
pub(crate) struct ProviderChannels {
    connected: Arc<watch::Sender<bool>>,
    stream: broadcast::Sender<Arc<TelemetrySnapshot>>,
}

impl ProviderChannels {
    pub(crate) fn new() -> Self {
        let (connected, _) = watch::channel(false);
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            connected: Arc::new(connected),
            stream,
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub(crate) fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>> {
        self.stream.subscribe()
    }

    /// Push a snapshot; having no subscriber is not an error
    pub(crate) fn publish(&self, snapshot: TelemetrySnapshot) {
        let _ = self.stream.send(Arc::new(snapshot));
    }
}

/// Slot for one cancellable background task
#[derive(Default)]
pub(crate) struct TaskSlot {
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.handle.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Store a new task, aborting any previous one
    pub(crate) fn replace(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.lock().replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
