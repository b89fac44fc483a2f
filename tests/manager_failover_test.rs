use async_trait::async_trait;
use evtelemetry::error::{Result, TelemetryError};
use evtelemetry::source::{
    CloudProvider, DataSourceManager, DataSourceProvider, MockFeed, MockProvider, SourceKind,
    VehicleInfoClient, VehicleStatus,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct SwitchableClient {
    online: AtomicBool,
}

#[async_trait]
impl VehicleInfoClient for SwitchableClient {
    async fn fetch_status(&self) -> Result<VehicleStatus> {
        if self.online.load(Ordering::SeqCst) {
            Ok(VehicleStatus {
                soc: Some(77.0),
                ..Default::default()
            })
        } else {
            Err(TelemetryError::network("offline"))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn cloud_loss_fails_over_to_mock_and_back() {
    let client = Arc::new(SwitchableClient {
        online: AtomicBool::new(true),
    });
    let cloud = Arc::new(CloudProvider::new(client.clone(), Duration::from_secs(10)));
    let mock = Arc::new(MockProvider::with_feed(
        MockFeed::new(9, 60.0),
        Duration::from_secs(1),
        true,
    ));
    let manager = DataSourceManager::with_ranking(
        vec![
            mock as Arc<dyn DataSourceProvider>,
            cloud as Arc<dyn DataSourceProvider>,
        ],
        &[SourceKind::Obd, SourceKind::Cloud, SourceKind::Mock],
    );
    assert_eq!(manager.connect_all().await, 2);

    let mut stream = manager.subscribe();
    let mut active = manager.active_source();
    manager.initialize().await;
    assert_eq!(manager.current_source(), Some(SourceKind::Cloud));
    assert_eq!(stream.recv().await.unwrap().state_of_charge, Some(77.0));
    active.borrow_and_update();

    client.online.store(false, Ordering::SeqCst);
    active.changed().await.unwrap();
    assert_eq!(*active.borrow(), Some(SourceKind::Mock));

    // Drain anything forwarded before the switch, then expect mock data
    loop {
        let snap = stream.recv().await.unwrap();
        if snap.state_of_charge != Some(77.0) {
            assert!(snap.cumulative_charge_ah.is_some());
            break;
        }
    }
    assert!(manager.latest().is_some());

    // The API recovers and the higher-ranked cloud source takes over again
    client.online.store(true, Ordering::SeqCst);
    while *active.borrow_and_update() != Some(SourceKind::Cloud) {
        active.changed().await.unwrap();
    }
    loop {
        if stream.recv().await.unwrap().state_of_charge == Some(77.0) {
            break;
        }
    }

    manager.shutdown().await;
    assert_eq!(manager.current_source(), None);
}
