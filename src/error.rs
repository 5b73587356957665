//! Typed errors for library-internal fallible operations. The binary
//! boundary (`main.rs`) still deals in `anyhow::Result`, matching the
//! teacher's existing convention; these are the variants that get
//! converted at that boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MotionTrackerError {
    #[error("sensor source '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("no accel frame received within {secs}s of startup")]
    NoAccelAtStartup { secs: u64 },

    #[error("accelerometer source exhausted its restart budget ({action}); accel failure is fatal")]
    AccelSourceDead { action: String },

    #[error("calibration invalid: gravity magnitude {g:.3} outside [9.5, 10.1]")]
    CalibrationOutOfRange { g: f64 },

    #[error("persistence write failed for {path}: {source}")]
    PersistenceIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
