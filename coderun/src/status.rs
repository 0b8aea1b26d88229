use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Running,
    /// Not accepting requests; waiting for in-flight runs.
    Draining,
    /// Rebuilding policy, registry and provisioner from config.
    Reloading,
    Stopped,
}

#[derive(Debug, Serialize)]
struct ServiceStatus<'a> {
    mode: ServiceMode,
    active_runs: usize,
    active_request_ids: Vec<&'a str>,
    policy_fingerprint: Option<&'a str>,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// Serialize as ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Thread-safe status tracker that persists state to a JSON file atomically.
///
/// Share via `Arc<StatusTracker>`; immutable fields live outside the mutex.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: ServiceMode,
    active_request_ids: BTreeSet<String>,
    policy_fingerprint: Option<String>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: ServiceMode::Running,
                active_request_ids: BTreeSet::new(),
                policy_fingerprint: None,
            }),
        }
    }

    pub async fn set_mode(&self, mode: ServiceMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    pub async fn set_policy(&self, fingerprint: &str) {
        let mut state = self.state.lock().await;
        state.policy_fingerprint = Some(fingerprint.to_string());
        self.write_status(&state).await;
    }

    pub async fn add_run(&self, request_id: &str) {
        let mut state = self.state.lock().await;
        state.active_request_ids.insert(request_id.to_string());
        self.write_status(&state).await;
    }

    pub async fn remove_run(&self, request_id: &str) {
        let mut state = self.state.lock().await;
        state.active_request_ids.remove(request_id);
        self.write_status(&state).await;
    }

    /// Write the initial status file.
    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    /// Atomic write: write to a temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let status = ServiceStatus {
            mode: state.mode,
            active_runs: state.active_request_ids.len(),
            active_request_ids: state.active_request_ids.iter().map(String::as_str).collect(),
            policy_fingerprint: state.policy_fingerprint.as_deref(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_status(path: &std::path::Path) -> serde_json::Value {
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn write_initial_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "running");
        assert_eq!(status["active_runs"], 0);
        assert!(status["policy_fingerprint"].is_null());
        assert!(!dir.path().join("status.tmp").exists());
    }

    #[tokio::test]
    async fn mode_and_policy_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.set_policy("abc123").await;
        tracker.set_mode(ServiceMode::Reloading).await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "reloading");
        assert_eq!(status["policy_fingerprint"], "abc123");
    }

    #[tokio::test]
    async fn add_and_remove_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.add_run("req-b").await;
        tracker.add_run("req-a").await;
        let status = read_status(&path);
        assert_eq!(status["active_runs"], 2);
        assert_eq!(status["active_request_ids"], serde_json::json!(["req-a", "req-b"]));

        tracker.remove_run("req-a").await;
        let status = read_status(&path);
        assert_eq!(status["active_request_ids"], serde_json::json!(["req-b"]));
    }

    #[tokio::test]
    async fn timestamps_are_iso8601() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let status = read_status(&path);
        let started = status["started_at"].as_str().unwrap();
        assert!(started.ends_with('Z'));
        assert_eq!(started.len(), 24);
    }
}
