//! Data source arbitration
//!
//! Providers are held in rank order. Selection picks the highest-ranked
//! connected provider, tears down the previous forwarding task and the
//! previous provider's timers, then subscribes to the new provider before
//! activating it. Exactly one upstream subscription exists at a time.
//! Any connectivity change of any provider re-runs selection, which covers
//! both failover and fail-back.

use super::{DataSourceProvider, STREAM_CAPACITY, SourceKind};
use crate::logging::{StructuredLogger, get_logger};
use crate::telemetry::TelemetrySnapshot;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

type SharedSnapshot = Arc<TelemetrySnapshot>;

#[derive(Default)]
struct ManagerState {
    /// Index into the ranked provider list
    active: Option<usize>,
    forward: Option<JoinHandle<()>>,
    monitors: Vec<JoinHandle<()>>,
}

struct ManagerInner {
    providers: Vec<Arc<dyn DataSourceProvider>>,
    state: Mutex<ManagerState>,
    stream: broadcast::Sender<SharedSnapshot>,
    latest: Arc<watch::Sender<Option<SharedSnapshot>>>,
    active: watch::Sender<Option<SourceKind>>,
    logger: StructuredLogger,
}

/// Republishes the stream of the best connected provider
pub struct DataSourceManager {
    inner: Arc<ManagerInner>,
}

impl DataSourceManager {
    /// Providers are ranked in the given order, best first
    pub fn new(providers: Vec<Arc<dyn DataSourceProvider>>) -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        let (latest, _) = watch::channel(None);
        let (active, _) = watch::channel(None);
        Self {
            inner: Arc::new(ManagerInner {
                providers,
                state: Mutex::new(ManagerState::default()),
                stream,
                latest: Arc::new(latest),
                active,
                logger: get_logger("manager"),
            }),
        }
    }

    /// Order providers by `ranking`; kinds missing from it go last
    pub fn with_ranking(
        mut providers: Vec<Arc<dyn DataSourceProvider>>,
        ranking: &[SourceKind],
    ) -> Self {
        providers.sort_by_key(|p| {
            ranking
                .iter()
                .position(|k| *k == p.kind())
                .unwrap_or(ranking.len())
        });
        Self::new(providers)
    }

    /// Provider kinds in rank order
    pub fn ranking(&self) -> Vec<SourceKind> {
        self.inner.providers.iter().map(|p| p.kind()).collect()
    }

    /// Try to connect every provider; returns how many are connected
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for provider in &self.inner.providers {
            match provider.connect().await {
                Ok(()) => connected += 1,
                Err(e) => self
                    .inner
                    .logger
                    .warn(&format!("Source {} not available: {}", provider.kind(), e)),
            }
        }
        connected
    }

    /// Select the active provider; the first call also starts watching
    /// every provider's connectivity. Safe to call repeatedly.
    pub async fn initialize(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.monitors.is_empty() {
                for provider in &self.inner.providers {
                    let weak = Arc::downgrade(&self.inner);
                    let rx = provider.connectivity();
                    state.monitors.push(tokio::spawn(monitor(weak, rx)));
                }
            }
        }
        self.inner.select().await;
    }

    /// The outward snapshot stream
    pub fn subscribe(&self) -> broadcast::Receiver<SharedSnapshot> {
        self.inner.stream.subscribe()
    }

    /// Most recent snapshot of the active source, `None` when no source is connected
    pub fn latest(&self) -> Option<SharedSnapshot> {
        self.inner.latest.borrow().clone()
    }

    /// Active-source change events
    pub fn active_source(&self) -> watch::Receiver<Option<SourceKind>> {
        self.inner.active.subscribe()
    }

    pub fn current_source(&self) -> Option<SourceKind> {
        *self.inner.active.borrow()
    }

    /// Stop all tasks and disconnect every provider
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            for handle in state.monitors.drain(..) {
                handle.abort();
            }
            if let Some(handle) = state.forward.take() {
                handle.abort();
            }
            state.active = None;
        }
        for provider in &self.inner.providers {
            if let Err(e) = provider.disconnect().await {
                self.inner
                    .logger
                    .debug(&format!("Disconnect of {} failed: {}", provider.kind(), e));
            }
        }
        self.inner.active.send_replace(None);
        self.inner.latest.send_replace(None);
        self.inner.logger.info("Data sources shut down");
    }
}

impl ManagerInner {
    async fn select(&self) {
        let mut state = self.state.lock().await;
        let best = self.providers.iter().position(|p| p.is_connected());
        let forward_alive = state.forward.as_ref().is_some_and(|h| !h.is_finished());
        if best == state.active && (best.is_none() || forward_alive) {
            return;
        }

        if let Some(handle) = state.forward.take() {
            handle.abort();
        }
        if let Some(previous) = state.active.take()
            && Some(previous) != best
        {
            let provider = &self.providers[previous];
            if let Err(e) = provider.deactivate().await {
                self.logger
                    .warn(&format!("Deactivating {} failed: {}", provider.kind(), e));
            }
        }

        for (index, provider) in self.providers.iter().enumerate() {
            if !provider.is_connected() {
                continue;
            }
            let rx = provider.subscribe();
            if let Err(e) = provider.activate().await {
                self.logger
                    .warn(&format!("Activating {} failed: {}", provider.kind(), e));
                continue;
            }
            state.forward = Some(tokio::spawn(forward(
                rx,
                self.stream.clone(),
                Arc::clone(&self.latest),
                self.logger.clone(),
            )));
            state.active = Some(index);
            let kind = provider.kind();
            self.active.send_if_modified(|current| {
                let changed = *current != Some(kind);
                *current = Some(kind);
                changed
            });
            self.logger.info(&format!("Active data source: {}", kind));
            return;
        }

        self.logger.warn("No connected data source");
        self.latest.send_replace(None);
        self.active.send_if_modified(|current| current.take().is_some());
    }
}

async fn forward(
    mut rx: broadcast::Receiver<SharedSnapshot>,
    stream: broadcast::Sender<SharedSnapshot>,
    latest: Arc<watch::Sender<Option<SharedSnapshot>>>,
    logger: StructuredLogger,
) {
    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                latest.send_replace(Some(Arc::clone(&snapshot)));
                let _ = stream.send(snapshot);
            }
            Err(RecvError::Lagged(skipped)) => {
                logger.warn(&format!("Forwarding lagged, {} snapshots dropped", skipped));
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn monitor(manager: Weak<ManagerInner>, mut connectivity: watch::Receiver<bool>) {
    while connectivity.changed().await.is_ok() {
        let Some(inner) = manager.upgrade() else {
            break;
        };
        inner.select().await;
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for handle in state.monitors.drain(..) {
            handle.abort();
        }
        if let Some(handle) = state.forward.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TelemetryError};
    use crate::source::ProviderChannels;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        kind: SourceKind,
        channels: ProviderChannels,
        subscribes: AtomicUsize,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        refuse_activate: bool,
    }

    impl StubProvider {
        fn new(kind: SourceKind, connected: bool) -> Arc<Self> {
            Arc::new(Self::build(kind, connected, false))
        }

        fn refusing(kind: SourceKind) -> Arc<Self> {
            Arc::new(Self::build(kind, true, true))
        }

        fn build(kind: SourceKind, connected: bool, refuse_activate: bool) -> Self {
            let channels = ProviderChannels::new();
            channels.set_connected(connected);
            Self {
                kind,
                channels,
                subscribes: AtomicUsize::new(0),
                activations: AtomicUsize::new(0),
                deactivations: AtomicUsize::new(0),
                refuse_activate,
            }
        }

        fn emit(&self, soc: f64) {
            let mut snap = TelemetrySnapshot::new(Utc::now());
            snap.state_of_charge = Some(soc);
            self.channels.publish(snap);
        }
    }

    #[async_trait]
    impl DataSourceProvider for StubProvider {
        fn kind(&self) -> SourceKind {
            self.kind
        }
        async fn connect(&self) -> Result<()> {
            self.channels.set_connected(true);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            self.channels.set_connected(false);
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.channels.is_connected()
        }
        fn connectivity(&self) -> watch::Receiver<bool> {
            self.channels.connectivity()
        }
        fn subscribe(&self) -> broadcast::Receiver<SharedSnapshot> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.channels.subscribe()
        }
        async fn activate(&self) -> Result<()> {
            if self.refuse_activate {
                return Err(TelemetryError::source("refused"));
            }
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn deactivate(&self) -> Result<()> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(providers: &[Arc<StubProvider>]) -> DataSourceManager {
        DataSourceManager::new(
            providers
                .iter()
                .map(|p| Arc::clone(p) as Arc<dyn DataSourceProvider>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let obd = StubProvider::new(SourceKind::Obd, true);
        let cloud = StubProvider::new(SourceKind::Cloud, true);
        let m = manager(&[obd.clone(), cloud.clone()]);
        m.initialize().await;
        m.initialize().await;
        m.initialize().await;
        assert_eq!(m.current_source(), Some(SourceKind::Obd));
        assert_eq!(obd.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(obd.activations.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.subscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forwards_active_stream_and_tracks_latest() {
        let obd = StubProvider::new(SourceKind::Obd, true);
        let cloud = StubProvider::new(SourceKind::Cloud, true);
        let m = manager(&[obd.clone(), cloud.clone()]);
        m.initialize().await;
        let mut rx = m.subscribe();

        cloud.emit(10.0);
        obd.emit(55.0);
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.state_of_charge, Some(55.0));
        assert_eq!(m.latest().unwrap().state_of_charge, Some(55.0));
    }

    #[tokio::test]
    async fn fails_over_and_back() {
        let obd = StubProvider::new(SourceKind::Obd, true);
        let cloud = StubProvider::new(SourceKind::Cloud, true);
        let m = manager(&[obd.clone(), cloud.clone()]);
        m.initialize().await;
        let mut active = m.active_source();
        active.borrow_and_update();

        obd.channels.set_connected(false);
        active.changed().await.unwrap();
        assert_eq!(*active.borrow_and_update(), Some(SourceKind::Cloud));
        assert_eq!(obd.deactivations.load(Ordering::SeqCst), 1);

        let mut rx = m.subscribe();
        cloud.emit(42.0);
        assert_eq!(rx.recv().await.unwrap().state_of_charge, Some(42.0));

        obd.channels.set_connected(true);
        active.changed().await.unwrap();
        assert_eq!(*active.borrow(), Some(SourceKind::Obd));
        assert_eq!(obd.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(cloud.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_connected_source_clears_state() {
        let obd = StubProvider::new(SourceKind::Obd, true);
        let m = manager(&[obd.clone()]);
        m.initialize().await;
        let mut rx = m.subscribe();
        obd.emit(70.0);
        rx.recv().await.unwrap();
        assert!(m.latest().is_some());

        let mut active = m.active_source();
        active.borrow_and_update();
        obd.channels.set_connected(false);
        active.changed().await.unwrap();
        assert_eq!(*active.borrow(), None);
        assert!(m.latest().is_none());
    }

    #[tokio::test]
    async fn skips_provider_that_fails_to_activate() {
        let obd = StubProvider::refusing(SourceKind::Obd);
        let mock = StubProvider::new(SourceKind::Mock, true);
        let m = manager(&[obd, mock.clone()]);
        m.initialize().await;
        assert_eq!(m.current_source(), Some(SourceKind::Mock));
        assert_eq!(mock.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ranking_orders_providers() {
        let obd = StubProvider::new(SourceKind::Obd, true);
        let mock = StubProvider::new(SourceKind::Mock, true);
        let m = DataSourceManager::with_ranking(
            vec![
                obd as Arc<dyn DataSourceProvider>,
                mock as Arc<dyn DataSourceProvider>,
            ],
            &[SourceKind::Mock, SourceKind::Cloud],
        );
        assert_eq!(m.ranking(), vec![SourceKind::Mock, SourceKind::Obd]);
        m.initialize().await;
        assert_eq!(m.current_source(), Some(SourceKind::Mock));
        m.shutdown().await;
        assert_eq!(m.current_source(), None);
    }
}
