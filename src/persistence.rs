//! Persistence layer (§4.11, §6.2): the SQLite auto-save sample cache, the
//! compressed session-summary JSON, and the multi-track GPX exporter.
//!
//! The SQLite schema and connection setup are grounded on
//! `examples/GReX-Telescope-GReX-T0/src/db.rs` (`Connection::open`,
//! `CREATE TABLE IF NOT EXISTS`, parameterized inserts) — the teacher
//! itself never touched a database, so this piece is adopted from the
//! pack's clearest `rusqlite` reference rather than the teacher. The
//! temp+rename atomic write and gzip framing follow the teacher's
//! `save_json_compressed`; the hand-rolled GPX XML writer follows
//! `examples/xhlsa-gojo/motion-tracker-android/rust/src/storage.rs`'s
//! `GpxTrack::to_gpx_xml`, which builds the same format without a `gpx`
//! crate dependency.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationResult;
use crate::error::MotionTrackerError;
use crate::incident::IncidentRecord;
use crate::types::{AccelSample, CovarianceSnapshot, EkfGpsDiagnostics, GpsSample, GyroSample, TrajectoryPoint};

/// Append-only SQLite cache of raw samples, flushed incrementally on each
/// auto-save so a crash loses at most one autosave interval of data (§4.11).
pub struct SampleCache {
    conn: Connection,
}

impl SampleCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MotionTrackerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gps_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy REAL NOT NULL,
                speed REAL NOT NULL,
                provider TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS accel_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                magnitude REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS gyro_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                magnitude REAL NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn append_gps(&mut self, samples: &[GpsSample]) -> Result<(), MotionTrackerError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO gps_samples (timestamp, latitude, longitude, accuracy, speed, provider)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for s in samples {
                stmt.execute(rusqlite::params![
                    s.t,
                    s.lat,
                    s.lon,
                    s.accuracy_m as f64,
                    s.speed_m_s as f64,
                    s.provider
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_accel(&mut self, samples: &[AccelSample]) -> Result<(), MotionTrackerError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO accel_samples (timestamp, magnitude) VALUES (?1, ?2)")?;
            for s in samples {
                stmt.execute(rusqlite::params![s.t, s.magnitude_m_s2 as f64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_gyro(&mut self, samples: &[GyroSample]) -> Result<(), MotionTrackerError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO gyro_samples (timestamp, magnitude) VALUES (?1, ?2)")?;
            for s in samples {
                stmt.execute(rusqlite::params![s.t, s.magnitude as f64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_all_gps(&self) -> Result<Vec<GpsSample>, MotionTrackerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT timestamp, latitude, longitude, accuracy, speed, provider FROM gps_samples ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let accuracy: f64 = row.get(3)?;
            let speed: f64 = row.get(4)?;
            Ok(GpsSample {
                t: row.get(0)?,
                lat: row.get(1)?,
                lon: row.get(2)?,
                accuracy_m: accuracy as f32,
                speed_m_s: speed as f32,
                provider: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn load_all_accel(&self) -> Result<Vec<AccelSample>, MotionTrackerError> {
        let mut stmt = self.conn.prepare("SELECT timestamp, magnitude FROM accel_samples ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let magnitude: f64 = row.get(1)?;
            Ok(AccelSample { t: row.get(0)?, magnitude_m_s2: magnitude as f32 })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn load_all_gyro(&self) -> Result<Vec<GyroSample>, MotionTrackerError> {
        let mut stmt = self.conn.prepare("SELECT timestamp, magnitude FROM gyro_samples ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let magnitude: f64 = row.get(1)?;
            Ok(GyroSample { t: row.get(0)?, wx: 0.0, wy: 0.0, wz: 0.0, magnitude: magnitude as f32 })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FilterFinalMetrics {
    pub velocity_m_s: f64,
    pub distance_m: f64,
    pub heading_deg: Option<f64>,
    pub gps_updates: u64,
    pub accel_updates: u64,
    pub gyro_updates: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FinalMetrics {
    pub ekf: FilterFinalMetrics,
    pub complementary: FilterFinalMetrics,
    pub es_ekf: FilterFinalMetrics,
    pub ekf_gps_diagnostics: Vec<EkfGpsDiagnostics>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TrajectoryMap {
    pub ekf: Vec<TrajectoryPoint>,
    pub es_ekf: Vec<TrajectoryPoint>,
    pub complementary: Vec<TrajectoryPoint>,
    pub es_ekf_dead_reckoning: Vec<TrajectoryPoint>,
}

/// The session record written to `comparison_<ts>.json[.gz]` (§6.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub test_duration_minutes: Option<f64>,
    pub actual_duration_seconds: f64,
    pub peak_memory_mb: f64,
    pub gps_available: bool,
    pub gps_fixes_collected: u64,
    pub gps_first_fix_latency_seconds: Option<f64>,
    pub gps_daemon_restart_count: u32,
    pub calibration: Option<CalibrationResult>,
    pub gps_samples: Vec<GpsSample>,
    pub accel_samples: Vec<AccelSample>,
    pub gyro_samples: Vec<GyroSample>,
    pub trajectories: TrajectoryMap,
    pub covariance_snapshots: Vec<CovarianceSnapshot>,
    pub incidents: Vec<IncidentRecord>,
    pub final_metrics: FinalMetrics,
}

impl SessionSummary {
    /// Writes both the plain and gzip-compressed JSON forms via
    /// write-to-temp + atomic rename (§4.11).
    pub fn write(&self, json_path: impl AsRef<Path>, gz_path: impl AsRef<Path>) -> Result<(), MotionTrackerError> {
        let json_path = json_path.as_ref();
        let gz_path = gz_path.as_ref();
        let bytes = serde_json::to_vec_pretty(self)?;

        write_atomic(json_path, &bytes)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes).map_err(|e| MotionTrackerError::PersistenceIo {
            path: gz_path.display().to_string(),
            source: e,
        })?;
        let compressed = encoder.finish().map_err(|e| MotionTrackerError::PersistenceIo {
            path: gz_path.display().to_string(),
            source: e,
        })?;
        write_atomic(gz_path, &compressed)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MotionTrackerError> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("out")
    ));
    fs::write(&tmp_path, bytes).map_err(|e| MotionTrackerError::PersistenceIo {
        path: tmp_path.display().to_string(),
        source: e,
    })?;
    fs::rename(&tmp_path, path).map_err(|e| MotionTrackerError::PersistenceIo {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(())
}

/// One named GPX `<trk>`, built from either GPS fixes or a filter's
/// trajectory points (§4.11, §6.2).
struct GpxTrack<'a> {
    name: &'a str,
    points: Vec<(f64, f64, f64, Option<f32>)>, // (timestamp, lat, lon, uncertainty_m)
}

fn iso8601(t: f64) -> String {
    let dt: DateTime<Utc> = DateTime::from(std::time::UNIX_EPOCH + std::time::Duration::from_secs_f64(t.max(0.0)));
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Hand-rolled GPX 1.1 multi-track document (§4.11's "one `<trk>` per
/// filter, plus raw GPS"). No `gpx` crate in the dependency stack — the
/// pack's own Android bridge module builds this format the same way.
fn write_gpx(tracks: &[GpxTrack], path: &Path) -> Result<(), MotionTrackerError> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<gpx version=\"1.1\" creator=\"motion_tracker_rs\" xmlns=\"http://www.topografix.com/GPX/1/1\">\n");

    for track in tracks {
        xml.push_str("  <trk>\n");
        let _ = writeln!(xml, "    <name>{}</name>", track.name);
        xml.push_str("    <trkseg>\n");
        for (t, lat, lon, uncertainty) in &track.points {
            let _ = writeln!(xml, "      <trkpt lat=\"{lat}\" lon=\"{lon}\">");
            let _ = writeln!(xml, "        <time>{}</time>", iso8601(*t));
            if let Some(u) = uncertainty {
                xml.push_str("        <extensions>\n");
                let _ = writeln!(xml, "          <uncertainty>{u}</uncertainty>");
                xml.push_str("        </extensions>\n");
            }
            xml.push_str("      </trkpt>\n");
        }
        xml.push_str("    </trkseg>\n");
        xml.push_str("  </trk>\n");
    }
    xml.push_str("</gpx>\n");

    write_atomic(path, xml.as_bytes())
}

pub fn export_gpx(
    path: impl AsRef<Path>,
    gps_samples: &[GpsSample],
    trajectories: &TrajectoryMap,
) -> Result<(), MotionTrackerError> {
    let raw: Vec<_> = gps_samples.iter().map(|s| (s.t, s.lat, s.lon, Some(s.accuracy_m))).collect();
    let ekf: Vec<_> = trajectories.ekf.iter().map(|p| (p.t, p.lat, p.lon, Some(p.uncertainty_m))).collect();
    let es_ekf: Vec<_> = trajectories.es_ekf.iter().map(|p| (p.t, p.lat, p.lon, Some(p.uncertainty_m))).collect();
    let complementary: Vec<_> = trajectories
        .complementary
        .iter()
        .map(|p| (p.t, p.lat, p.lon, Some(p.uncertainty_m)))
        .collect();
    let dead_reckoning: Vec<_> = trajectories
        .es_ekf_dead_reckoning
        .iter()
        .map(|p| (p.t, p.lat, p.lon, Some(p.uncertainty_m)))
        .collect();

    let tracks = [
        GpxTrack { name: "gps_raw", points: raw },
        GpxTrack { name: "ekf13d", points: ekf },
        GpxTrack { name: "es_ekf", points: es_ekf },
        GpxTrack { name: "complementary", points: complementary },
        GpxTrack { name: "es_ekf_dead_reckoning", points: dead_reckoning },
    ];
    write_gpx(&tracks, path.as_ref())
}

pub fn session_paths(base_dir: impl AsRef<Path>, session_id: &str, ts: &str) -> SessionPaths {
    let dir = base_dir.as_ref().join("sessions").join(session_id);
    SessionPaths {
        json: dir.join(format!("comparison_{ts}.json")),
        gz: dir.join(format!("comparison_{ts}.json.gz")),
        gpx: dir.join(format!("comparison_{ts}.gpx")),
        sqlite: dir.join("sensor_cache.sqlite"),
        buffer_chunks: dir.join("buffer_chunks").join(ts),
        incidents: dir.join("incidents"),
        dir,
    }
}

pub struct SessionPaths {
    pub dir: PathBuf,
    pub json: PathBuf,
    pub gz: PathBuf,
    pub gpx: PathBuf,
    pub sqlite: PathBuf,
    pub buffer_chunks: PathBuf,
    pub incidents: PathBuf,
}

impl SessionPaths {
    pub fn ensure_dirs(&self) -> Result<(), MotionTrackerError> {
        for dir in [&self.dir, &self.buffer_chunks, &self.incidents] {
            fs::create_dir_all(dir).map_err(|e| MotionTrackerError::PersistenceIo {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sample_cache_round_trips_gps_rows() {
        let dir = TempDir::new().unwrap();
        let mut cache = SampleCache::open(dir.path().join("cache.sqlite")).unwrap();
        let sample = GpsSample { t: 1.0, lat: 37.0, lon: -122.0, accuracy_m: 5.0, speed_m_s: 2.0, provider: "gps".into() };
        cache.append_gps(&[sample.clone()]).unwrap();
        let loaded = cache.load_all_gps().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].lat, 37.0);
    }

    #[test]
    fn sample_cache_accumulates_across_multiple_appends() {
        let dir = TempDir::new().unwrap();
        let mut cache = SampleCache::open(dir.path().join("cache.sqlite")).unwrap();
        cache.append_accel(&[AccelSample { t: 0.0, magnitude_m_s2: 0.1 }]).unwrap();
        cache.append_accel(&[AccelSample { t: 1.0, magnitude_m_s2: 0.2 }]).unwrap();
        let loaded = cache.load_all_accel().unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn session_summary_writes_both_plain_and_gzip_forms() {
        let dir = TempDir::new().unwrap();
        let summary = SessionSummary {
            session_id: "s1".into(),
            test_duration_minutes: None,
            actual_duration_seconds: 10.0,
            peak_memory_mb: 42.0,
            gps_available: true,
            gps_fixes_collected: 1,
            gps_first_fix_latency_seconds: Some(2.0),
            gps_daemon_restart_count: 0,
            calibration: None,
            gps_samples: vec![],
            accel_samples: vec![],
            gyro_samples: vec![],
            trajectories: TrajectoryMap::default(),
            covariance_snapshots: vec![],
            incidents: vec![],
            final_metrics: FinalMetrics::default(),
        };
        let json_path = dir.path().join("comparison_1.json");
        let gz_path = dir.path().join("comparison_1.json.gz");
        summary.write(&json_path, &gz_path).unwrap();
        assert!(json_path.exists());
        assert!(gz_path.exists());
    }

    #[test]
    fn gpx_export_contains_all_named_tracks() {
        let dir = TempDir::new().unwrap();
        let gpx_path = dir.path().join("out.gpx");
        let gps = vec![GpsSample { t: 0.0, lat: 37.0, lon: -122.0, accuracy_m: 5.0, speed_m_s: 1.0, provider: "gps".into() }];
        export_gpx(&gpx_path, &gps, &TrajectoryMap::default()).unwrap();
        let xml = fs::read_to_string(&gpx_path).unwrap();
        assert!(xml.contains("gps_raw"));
        assert!(xml.contains("es_ekf_dead_reckoning"));
    }
}
