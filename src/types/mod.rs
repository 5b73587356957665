//! Shared data types: raw sensor-child output, the tagged `Sample` the
//! dispatcher broadcasts, and the value types filters and persistence
//! exchange.

pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Raw accelerometer frame as emitted by the sensor child (§6.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelData {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Raw gyroscope frame as emitted by the sensor child (§6.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GyroData {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Raw GPS fix as emitted by the location child (§6.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsData {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub bearing: f64,
    pub accuracy: f64,
}

/// Dispatcher-facing accel sample: gravity already subtracted, reduced to
/// the scalar motion magnitude the filters actually consume (§3, §4.5).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AccelSample {
    pub t: f64,
    pub magnitude_m_s2: f32,
}

/// Dispatcher-facing GPS sample (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsSample {
    pub t: f64,
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
    pub speed_m_s: f32,
    pub provider: String,
}

/// Dispatcher-facing gyro sample (§3). Only `magnitude` is retained when
/// full 3-axis history is not part of the storage budget.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GyroSample {
    pub t: f64,
    pub wx: f32,
    pub wy: f32,
    pub wz: f32,
    pub magnitude: f32,
}

/// Tagged variant replacing the dynamic-dict sensor frame the source uses
/// (§9 REDESIGN FLAG). One value flows through the raw queue and is fanned
/// out to every filter inlet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Sample {
    Accel(AccelSample),
    Gps(GpsSample),
    Gyro(GyroSample),
}

impl Sample {
    pub fn timestamp(&self) -> f64 {
        match self {
            Sample::Accel(s) => s.t,
            Sample::Gps(s) => s.t,
            Sample::Gyro(s) => s.t,
        }
    }
}

/// A point on a filter's trajectory ring (§3, §4.9).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub t: f64,
    pub lat: f64,
    pub lon: f64,
    pub velocity_m_s: f32,
    pub uncertainty_m: f32,
}

/// Leading six diagonals of the primary filter's covariance (§3, §4.9).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CovarianceSnapshot {
    pub t: f64,
    pub trace: f64,
    pub diag: [f64; 6],
}

/// Read-only snapshot returned by `Filter::get_state()` (§4.3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub struct FilterState {
    pub velocity: f64,
    pub distance: f64,
    pub accel_magnitude: f64,
    pub stationary: bool,
    pub last_gps_time: Option<f64>,
}

/// Per-GPS-update diagnostics emitted by the primary EKF (§4.6). These are
/// the inputs the external post-drive analyzer consumes; persisted
/// verbatim into the session summary's `final_metrics.ekf` block.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub struct EkfGpsDiagnostics {
    pub t: f64,
    pub innovation_m: f64,
    pub prediction_error_m: f64,
    pub nis: f64,
    pub rejected: bool,
    pub snapped: bool,
    pub zupt_active: bool,
    pub covariance_diag: [f64; 6],
    pub linear_accel_magnitude: f64,
    pub turn_rate: f64,
}
