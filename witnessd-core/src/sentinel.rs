//! Interface between the checkpoint core and any external activity
//! sentinel. The core only ever consumes these abstract events; the
//! platform-specific detectors that produce them live outside this crate.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("sentinel: no active tracking session")]
    NoActiveSession,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusEventType {
    Gained,
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusEvent {
    pub event_type: FocusEventType,
    pub timestamp: DateTime<Utc>,
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    Focus(FocusEvent),
    Change(ChangeEvent),
    Heartbeat(DateTime<Utc>),
}

/// Bounded fan-out channel for sentinel consumers. Overflow drops the
/// event and counts it; tracking is best-effort and must never block a
/// Store or WAL write.
pub struct EventBroadcaster {
    sender: SyncSender<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

pub fn event_channel(capacity: usize) -> (EventBroadcaster, Receiver<SessionEvent>) {
    let (sender, receiver) = mpsc::sync_channel(capacity);
    (
        EventBroadcaster {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        receiver,
    )
}

impl EventBroadcaster {
    pub fn publish(&self, event: SessionEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("sentinel queue full, {total} events dropped so far");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// State of the active tracking session, persisted under `tracking/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSession {
    pub session_id: String,
    pub document_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl TrackingSession {
    pub fn begin(document_path: impl Into<PathBuf>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            document_path: document_path.into(),
            started_at: Utc::now(),
        }
    }

    pub fn save(&self, tracking_dir: &Path) -> Result<(), SentinelError> {
        fs::create_dir_all(tracking_dir)?;
        let path = tracking_dir.join("current_session.json");
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(tracking_dir: &Path) -> Result<Self, SentinelError> {
        let path = tracking_dir.join("current_session.json");
        let data = fs::read(&path).map_err(|_| SentinelError::NoActiveSession)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn clear(tracking_dir: &Path) -> Result<(), SentinelError> {
        let path = tracking_dir.join("current_session.json");
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn write_pid_file(tracking_dir: &Path) -> Result<(), SentinelError> {
    fs::create_dir_all(tracking_dir)?;
    fs::write(
        tracking_dir.join("daemon.pid"),
        std::process::id().to_string(),
    )?;
    Ok(())
}

pub fn clear_pid_file(tracking_dir: &Path) -> Result<(), SentinelError> {
    match fs::remove_file(tracking_dir.join("daemon.pid")) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_flow_through_channel() {
        let (broadcaster, receiver) = event_channel(8);

        broadcaster.publish(SessionEvent::Heartbeat(Utc::now()));
        broadcaster.publish(SessionEvent::Focus(FocusEvent {
            event_type: FocusEventType::Gained,
            timestamp: Utc::now(),
            app_name: Some("editor".to_string()),
        }));

        assert!(matches!(
            receiver.recv().unwrap(),
            SessionEvent::Heartbeat(_)
        ));
        assert!(matches!(receiver.recv().unwrap(), SessionEvent::Focus(_)));
        assert_eq!(broadcaster.dropped(), 0);
    }

    #[test]
    fn test_overflow_drops_silently() {
        let (broadcaster, receiver) = event_channel(2);

        for _ in 0..5 {
            broadcaster.publish(SessionEvent::Heartbeat(Utc::now()));
        }

        // Two delivered, three dropped; publishing never blocked.
        assert_eq!(broadcaster.dropped(), 3);
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_receiver_counts_drops() {
        let (broadcaster, receiver) = event_channel(2);
        drop(receiver);
        broadcaster.publish(SessionEvent::Heartbeat(Utc::now()));
        assert_eq!(broadcaster.dropped(), 1);
    }

    #[test]
    fn test_tracking_session_roundtrip() {
        let dir = TempDir::new().expect("create temp dir");
        let session = TrackingSession::begin("/docs/essay.md");
        session.save(dir.path()).expect("save");

        let loaded = TrackingSession::load(dir.path()).expect("load");
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.document_path, session.document_path);

        TrackingSession::clear(dir.path()).expect("clear");
        let err = TrackingSession::load(dir.path()).unwrap_err();
        assert!(matches!(err, SentinelError::NoActiveSession));
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = TempDir::new().expect("create temp dir");
        write_pid_file(dir.path()).expect("write pid");

        let pid: u32 = fs::read_to_string(dir.path().join("daemon.pid"))
            .expect("read pid")
            .parse()
            .expect("parse pid");
        assert_eq!(pid, std::process::id());

        clear_pid_file(dir.path()).expect("clear");
        clear_pid_file(dir.path()).expect("clear idempotent");
    }
}
