//! Live status writer (§4.12, §6.3): a small, frequently-overwritten JSON
//! document external consumers poll to judge whether a session is still
//! active. Written atomically (temp file + rename) so a reader never sees
//! a half-written document; treated as stale once its mtime is more than
//! 10s old.
//!
//! Grounded on the teacher's `save_json_compressed` in `main.rs` for the
//! temp+rename pattern (generalized here to an uncompressed small file,
//! since §4.12 caps this document at 2KB and gzip framing would be
//! pure overhead at that size).

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveStatus {
    pub session_id: String,
    pub elapsed_secs: f64,
    pub last_update_epoch: f64,

    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub gps_fixes: u64,
    pub incidents_detected: u64,

    pub latest_gps_lat: Option<f64>,
    pub latest_gps_lon: Option<f64>,
    pub latest_gps_accuracy_m: Option<f32>,

    pub ekf_velocity_m_s: f64,
    pub ekf_heading_deg: f64,
    pub ekf_distance_m: f64,

    pub rss_mb: f64,
    pub accel_restarts: u32,
    pub gyro_restarts: u32,
    pub gps_restarts: u32,
}

impl LiveStatus {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            elapsed_secs: 0.0,
            last_update_epoch: current_timestamp(),
            accel_samples: 0,
            gyro_samples: 0,
            gps_fixes: 0,
            incidents_detected: 0,
            latest_gps_lat: None,
            latest_gps_lon: None,
            latest_gps_accuracy_m: None,
            ekf_velocity_m_s: 0.0,
            ekf_heading_deg: 0.0,
            ekf_distance_m: 0.0,
            rss_mb: 0.0,
            accel_restarts: 0,
            gyro_restarts: 0,
            gps_restarts: 0,
        }
    }

    /// Atomically overwrites `path` (§4.12: "Atomic rename onto a
    /// well-known path"). Writes to a sibling temp file first so a reader
    /// polling `path` never observes a partial document.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec(self)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live_status.json");
        let status = LiveStatus::new("session-1");
        status.save(&path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let loaded: LiveStatus = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded.session_id, "session-1");
    }

    #[test]
    fn stays_under_size_budget() {
        let mut status = LiveStatus::new("session-with-a-reasonably-long-identifier-12345");
        status.latest_gps_lat = Some(37.123456);
        status.latest_gps_lon = Some(-122.123456);
        status.latest_gps_accuracy_m = Some(4.2);
        let json = serde_json::to_vec(&status).unwrap();
        assert!(json.len() <= 2048, "live status exceeded 2KB: {} bytes", json.len());
    }
}
