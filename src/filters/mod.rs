//! Filter trait shared by all three motion estimators (§4.3). The
//! orchestrator holds each behind `Box<dyn Filter + Send>` so sensor
//! samples can be routed uniformly regardless of which filter is live.

pub mod complementary;
pub mod ekf_13d;
pub mod es_ekf;

use crate::types::FilterState;

/// Common surface for the complementary filter, the 13D EKF, and the 8D
/// ES-EKF. Each filter owns its own internal state and is updated from
/// one sensor modality at a time; callers are expected to call the
/// matching `update_*` method per `Sample` variant.
pub trait Filter {
    /// Feed a gravity-subtracted acceleration magnitude (m/s^2). Returns
    /// the filter's current (velocity, distance) estimate after the update.
    fn update_accel(&mut self, magnitude: f32) -> (f64, f64);

    /// Feed a GPS fix. Returns (velocity, distance) after the update.
    fn update_gps(&mut self, lat: f64, lon: f64, speed: f32, accuracy: f32) -> (f64, f64);

    /// Feed a gyroscope reading (rad/s per axis). Returns (velocity, distance)
    /// unchanged for filters that don't use gyro in their state (e.g. the
    /// complementary filter, which ignores this call).
    fn update_gyro(&mut self, wx: f32, wy: f32, wz: f32) -> (f64, f64);

    fn get_state(&self) -> FilterState;

    /// Last known position estimate: (lat, lon, uncertainty_m).
    fn get_position(&self) -> (f64, f64, f32);

    fn reset(&mut self);

    /// Advance the filter's own time-update by one fixed step, for filters
    /// that run a predict/update cycle decoupled from sensor arrival (the
    /// EKFs). The complementary filter has no predict step and uses the
    /// default no-op.
    fn predict(&mut self) {}
}
