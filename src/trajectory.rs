//! Bounded-memory trajectory and covariance history (§4.9): a fixed-
//! capacity ring per track that spills its filled prefix to a gzip-
//! compressed JSON chunk on disk rather than growing without bound, so a
//! multi-hour session can't exhaust memory holding every point.
//!
//! Grounded on the teacher's `save_json_compressed` (`main.rs`) for the
//! gzip+JSON chunk format, generalized from a one-shot final save into a
//! ring that spills repeatedly during a live session.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MotionTrackerError;
use crate::types::{CovarianceSnapshot, TrajectoryPoint};

const TRAJECTORY_CAPACITY: usize = 5000;
const COVARIANCE_CAPACITY: usize = 2000;

struct RingInner<T> {
    buffer: Vec<T>,
    chunk_paths: Vec<PathBuf>,
    chunk_seq: u64,
}

/// A fixed-capacity ring of `T` that spills to a gzip chunk file whenever
/// its in-memory buffer fills (§4.9). Interior-mutable so the orchestrator
/// can share one ring across the filter worker that appends to it and the
/// persistence task that exports it at shutdown.
pub struct Ring<T> {
    name: String,
    capacity: usize,
    chunk_dir: PathBuf,
    inner: Mutex<RingInner<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> Ring<T> {
    pub fn new(name: impl Into<String>, chunk_dir: impl AsRef<Path>, capacity: usize) -> Result<Self, MotionTrackerError> {
        let chunk_dir = chunk_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&chunk_dir).map_err(|e| MotionTrackerError::PersistenceIo {
            path: chunk_dir.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            name: name.into(),
            capacity,
            chunk_dir,
            inner: Mutex::new(RingInner {
                buffer: Vec::with_capacity(capacity),
                chunk_paths: Vec::new(),
                chunk_seq: 0,
            }),
        })
    }

    pub fn push(&self, point: T) -> Result<(), MotionTrackerError> {
        let mut inner = self.inner.lock().expect("trajectory ring mutex poisoned");
        inner.buffer.push(point);
        if inner.buffer.len() == self.capacity {
            self.spill(&mut inner)?;
        }
        Ok(())
    }

    fn spill(&self, inner: &mut RingInner<T>) -> Result<(), MotionTrackerError> {
        let chunk_path = self
            .chunk_dir
            .join(format!("{}_chunk_{:05}.json.gz", self.name, inner.chunk_seq));
        inner.chunk_seq += 1;

        let json = serde_json::to_vec(&inner.buffer)?;
        let file = File::create(&chunk_path).map_err(|e| MotionTrackerError::PersistenceIo {
            path: chunk_path.display().to_string(),
            source: e,
        })?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&json).map_err(|e| MotionTrackerError::PersistenceIo {
            path: chunk_path.display().to_string(),
            source: e,
        })?;
        encoder.finish().map_err(|e| MotionTrackerError::PersistenceIo {
            path: chunk_path.display().to_string(),
            source: e,
        })?;

        inner.chunk_paths.push(chunk_path);
        inner.buffer.clear();
        Ok(())
    }

    /// Concatenates every on-disk chunk with the current in-memory prefix,
    /// under the same lock used by `push` (§4.9's "read... under a lock").
    pub fn export_all(&self) -> Result<Vec<T>, MotionTrackerError> {
        let inner = self.inner.lock().expect("trajectory ring mutex poisoned");
        let mut out = Vec::new();
        for chunk_path in &inner.chunk_paths {
            let file = File::open(chunk_path).map_err(|e| MotionTrackerError::PersistenceIo {
                path: chunk_path.display().to_string(),
                source: e,
            })?;
            let mut decoder = GzDecoder::new(file);
            let mut bytes = Vec::new();
            decoder.read_to_end(&mut bytes).map_err(|e| MotionTrackerError::PersistenceIo {
                path: chunk_path.display().to_string(),
                source: e,
            })?;
            let points: Vec<T> = serde_json::from_slice(&bytes)?;
            out.extend(points);
        }
        out.extend(inner.buffer.iter().cloned());
        Ok(out)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("trajectory ring mutex poisoned");
        inner.chunk_paths.len() * self.capacity + inner.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().expect("trajectory ring mutex poisoned").chunk_paths.len()
    }
}

pub type TrajectoryRing = Ring<TrajectoryPoint>;
pub type CovarianceRing = Ring<CovarianceSnapshot>;

/// One trajectory ring per filter track, plus the primary EKF's covariance
/// ring (§3, §4.9). Track names: `ekf13d`, `es_ekf`, `complementary`, and
/// `es_ekf_dead_reckoning` (the ES-EKF's between-fix dead-reckoning path).
pub struct TrajectoryStore {
    pub ekf13d: TrajectoryRing,
    pub es_ekf: TrajectoryRing,
    pub complementary: TrajectoryRing,
    pub es_ekf_dead_reckoning: TrajectoryRing,
    pub covariance: CovarianceRing,
}

impl TrajectoryStore {
    pub fn new(chunk_dir: impl AsRef<Path>) -> Result<Self, MotionTrackerError> {
        let chunk_dir = chunk_dir.as_ref();
        Ok(Self {
            ekf13d: TrajectoryRing::new("ekf13d", chunk_dir, TRAJECTORY_CAPACITY)?,
            es_ekf: TrajectoryRing::new("es_ekf", chunk_dir, TRAJECTORY_CAPACITY)?,
            complementary: TrajectoryRing::new("complementary", chunk_dir, TRAJECTORY_CAPACITY)?,
            es_ekf_dead_reckoning: TrajectoryRing::new("es_ekf_dead_reckoning", chunk_dir, TRAJECTORY_CAPACITY)?,
            covariance: CovarianceRing::new("covariance_ekf13d", chunk_dir, COVARIANCE_CAPACITY)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn point(t: f64) -> TrajectoryPoint {
        TrajectoryPoint { t, lat: 37.0, lon: -122.0, velocity_m_s: 1.0, uncertainty_m: 5.0 }
    }

    #[test]
    fn spills_to_chunk_when_full() {
        let dir = TempDir::new().unwrap();
        let ring = TrajectoryRing::new("test", dir.path(), 3).unwrap();
        ring.push(point(0.0)).unwrap();
        ring.push(point(1.0)).unwrap();
        assert_eq!(ring.chunk_count(), 0);
        ring.push(point(2.0)).unwrap();
        assert_eq!(ring.chunk_count(), 1);
    }

    #[test]
    fn export_concatenates_chunks_and_in_memory_prefix() {
        let dir = TempDir::new().unwrap();
        let ring = TrajectoryRing::new("test", dir.path(), 2).unwrap();
        for i in 0..5 {
            ring.push(point(i as f64)).unwrap();
        }
        let exported = ring.export_all().unwrap();
        assert_eq!(exported.len(), 5);
        assert_eq!(exported[0].t, 0.0);
        assert_eq!(exported[4].t, 4.0);
    }

    #[test]
    fn len_accounts_for_spilled_and_buffered_points() {
        let dir = TempDir::new().unwrap();
        let ring = TrajectoryRing::new("test", dir.path(), 2).unwrap();
        for i in 0..5 {
            ring.push(point(i as f64)).unwrap();
        }
        assert_eq!(ring.len(), 5);
    }
}
