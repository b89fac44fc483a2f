use chrono::{TimeZone, Utc};
use evtelemetry::config::SessionConfig;
use evtelemetry::persistence::SessionArchive;
use evtelemetry::session::{ChargingSession, SessionEvent, SessionTracker};
use evtelemetry::sink::TelemetrySink;
use evtelemetry::telemetry::TelemetrySnapshot;

#[tokio::test]
async fn distance_survives_restart_through_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");

    let mut first = ChargingSession::new(Utc.with_ymd_and_hms(2024, 8, 1, 8, 0, 0).unwrap());
    first.end_time = Some(Utc.with_ymd_and_hms(2024, 8, 1, 9, 0, 0).unwrap());
    first.is_active = false;
    first.end_odometer_km = Some(20_000.0);
    SessionArchive::new(&path, 10).archive(&first).await.unwrap();

    // Restart: a fresh archive instance seeds a fresh tracker
    let archive = SessionArchive::new(&path, 10);
    assert_eq!(archive.load().unwrap(), 1);
    let mut tracker = SessionTracker::new(SessionConfig::default())
        .with_previous_end_odometer(archive.last_end_odometer());

    let mut s = TelemetrySnapshot::new(Utc.with_ymd_and_hms(2024, 8, 2, 8, 0, 0).unwrap());
    s.is_charging = Some(true);
    s.odometer_km = Some(20_250.0);
    s.cumulative_charge_ah = Some(500.0);
    s.voltage = Some(350.0);
    let events = tracker.observe(&s);
    let started = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::Started(s) => Some(s),
            _ => None,
        })
        .unwrap();
    assert_eq!(started.previous_end_odometer_km, Some(20_000.0));
    assert_eq!(started.distance_km(), Some(250.0));
}
