//! Session archive
//!
//! Completed charging sessions are kept in a JSON file, oldest first and
//! bounded by `max_sessions`. Each record is stored in its wire form, so the
//! derived metrics are readable without this crate. The archive also yields
//! the end odometer of the most recent session, which lets the tracker
//! compute the distance driven between charges across restarts.

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::session::ChargingSession;
use crate::sink::TelemetrySink;
use crate::telemetry::TelemetrySnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// On-disk layout of the archive file
#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveFile {
    #[serde(default)]
    sessions: Vec<serde_json::Value>,
}

/// JSON-file archive of completed sessions
pub struct SessionArchive {
    path: PathBuf,
    max_sessions: usize,
    sessions: Mutex<Vec<ChargingSession>>,
    logger: StructuredLogger,
}

impl SessionArchive {
    pub fn new<P: AsRef<Path>>(path: P, max_sessions: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_sessions: max_sessions.max(1),
            sessions: Mutex::new(Vec::new()),
            logger: get_logger("archive"),
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(&config.path, config.max_sessions)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChargingSession>> {
        match self.sessions.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Load sessions from disk; a missing file is an empty archive.
    /// Records that no longer parse are skipped. Returns the number loaded.
    pub fn load(&self) -> Result<usize> {
        if !self.path.exists() {
            self.logger
                .info("No session archive found, starting empty");
            return Ok(0);
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let file: ArchiveFile = serde_json::from_str(&contents)?;
        let mut loaded = Vec::with_capacity(file.sessions.len());
        for record in file.sessions {
            match serde_json::from_value::<ChargingSession>(record) {
                Ok(session) => loaded.push(session),
                Err(e) => self
                    .logger
                    .warn(&format!("Skipping unreadable session record: {}", e)),
            }
        }
        let excess = loaded.len().saturating_sub(self.max_sessions);
        loaded.drain(..excess);

        let count = loaded.len();
        *self.lock() = loaded;
        self.logger
            .info(&format!("Loaded {} archived sessions", count));
        Ok(count)
    }

    fn save(&self, sessions: &[ChargingSession]) -> Result<()> {
        let file = ArchiveFile {
            sessions: sessions.iter().map(ChargingSession::to_wire).collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        self.logger.debug("Saved session archive");
        Ok(())
    }

    /// Append a completed session, dropping the oldest beyond the bound
    pub fn append(&self, session: ChargingSession) -> Result<()> {
        let mut sessions = self.lock();
        sessions.push(session);
        let excess = sessions.len().saturating_sub(self.max_sessions);
        sessions.drain(..excess);
        self.save(&sessions)
    }

    /// Archived sessions, oldest first
    pub fn sessions(&self) -> Vec<ChargingSession> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// End odometer of the most recent session that recorded one
    pub fn last_end_odometer(&self) -> Option<f64> {
        self.lock().iter().rev().find_map(|s| s.end_odometer_km)
    }
}

#[async_trait]
impl TelemetrySink for SessionArchive {
    async fn publish(&self, _snapshot: &TelemetrySnapshot) -> Result<()> {
        Ok(())
    }

    async fn archive(&self, session: &ChargingSession) -> Result<()> {
        self.append(session.clone())?;
        self.logger.info(&format!("Archived session {}", session.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn session(n: i64, end_odometer: Option<f64>) -> ChargingSession {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(n);
        let mut s = ChargingSession::new(start);
        s.id = format!("s{}", n);
        s.end_time = Some(start + Duration::minutes(30));
        s.is_active = false;
        s.end_odometer_km = end_odometer;
        s
    }

    #[test]
    fn missing_file_is_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SessionArchive::new(dir.path().join("none.json"), 10);
        assert_eq!(archive.load().unwrap(), 0);
        assert!(archive.is_empty());
        assert_eq!(archive.last_end_odometer(), None);
    }

    #[test]
    fn append_bounds_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.json");
        let archive = SessionArchive::new(&path, 2);
        archive.append(session(1, Some(100.0))).unwrap();
        archive.append(session(2, Some(150.0))).unwrap();
        archive.append(session(3, None)).unwrap();
        assert_eq!(archive.len(), 2);

        let reloaded = SessionArchive::new(&path, 2);
        assert_eq!(reloaded.load().unwrap(), 2);
        let ids: Vec<String> = reloaded.sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s2", "s3"]);
        assert_eq!(reloaded.last_end_odometer(), Some(150.0));
    }

    #[test]
    fn stored_records_carry_derived_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let archive = SessionArchive::new(&path, 5);
        archive.append(session(1, Some(10.0))).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["sessions"][0]["durationSeconds"].as_f64(), Some(1800.0));
        assert_eq!(raw["sessions"][0]["active"], false);
    }

    #[test]
    fn unreadable_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{"sessions":[{"bogus":true},{"id":"ok","startTime":"2024-03-01T00:00:00Z","active":false}]}"#,
        )
        .unwrap();
        let archive = SessionArchive::new(&path, 5);
        assert_eq!(archive.load().unwrap(), 1);
        assert_eq!(archive.sessions()[0].id, "ok");
    }

    #[tokio::test]
    async fn archive_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SessionArchive::new(dir.path().join("s.json"), 5);
        archive.archive(&session(4, Some(42.0))).await.unwrap();
        assert_eq!(archive.last_end_odometer(), Some(42.0));
    }
}
