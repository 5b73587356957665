//! Complementary filter fusing GPS (accurate, low-frequency) with
//! accelerometer (noisy, high-frequency) readings into a single
//! velocity/distance estimate (§4.4).
//!
//! Ported from `original_source/motion_tracker_v2/filters/complementary.py`
//! rather than the teacher's Rust `complementary.rs`, whose position-blending
//! design diverges from both the spec and the Python reference it was
//! supposedly based on. Helper functions (`latlon_to_meters`,
//! `haversine_distance`) are kept from the teacher's module, which already
//! carried the right math for those pieces.

use serde::{Deserialize, Serialize};

use super::Filter;
use crate::types::FilterState;

const GPS_WEIGHT: f64 = 0.7;
const ACCEL_WEIGHT: f64 = 0.3;
const STATIONARY_ACCEL_THRESHOLD: f64 = 0.20; // m/s^2, gravity-corrected
const GPS_STALE_SECS: f64 = 5.0;
const STATIONARY_SPEED_THRESHOLD: f64 = 0.1; // m/s

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplementaryFilterState {
    pub velocity: f64,
    pub distance: f64,
    pub accel_velocity: f64,
    pub accel_magnitude: f64,
    pub last_gps_time: Option<f64>,
    pub is_stationary: bool,
}

pub struct ComplementaryFilter {
    velocity: f64,
    distance: f64,

    last_gps_position: Option<(f64, f64)>,
    last_gps_time: Option<f64>,
    #[allow(dead_code)]
    last_gps_speed: Option<f32>,

    accel_velocity: f64,
    accel_magnitude: f64,
    last_accel_time: Option<f64>,

    is_stationary: bool,
}

impl ComplementaryFilter {
    pub fn new() -> Self {
        Self {
            velocity: 0.0,
            distance: 0.0,
            last_gps_position: None,
            last_gps_time: None,
            last_gps_speed: None,
            accel_velocity: 0.0,
            accel_magnitude: 0.0,
            last_accel_time: None,
            is_stationary: false,
        }
    }

    /// GPS update. `t` is the sample's own timestamp (seconds), `speed` is
    /// the provider-reported ground speed (m/s, may be 0 if unavailable),
    /// `accuracy` is the provider-reported horizontal accuracy in meters.
    fn update_gps_at(&mut self, t: f64, lat: f64, lon: f64, speed: f32, accuracy: f32) {
        if let (Some((last_lat, last_lon)), Some(last_t)) =
            (self.last_gps_position, self.last_gps_time)
        {
            let dt = t - last_t;
            if dt > 0.0 {
                let dist = haversine_distance(last_lat, last_lon, lat, lon);

                let mut gps_velocity = dist / dt;
                if speed > 0.0 {
                    gps_velocity = speed as f64;
                }

                let accuracy = accuracy as f64;
                let accuracy_floor = if accuracy > 0.0 {
                    accuracy
                } else {
                    2.5
                };
                self.distance += (dist - accuracy_floor).max(0.0);

                let movement_threshold = if accuracy > 0.0 {
                    (5.0_f64).max(accuracy * 1.5)
                } else {
                    5.0
                };

                let stationary = dist < movement_threshold && gps_velocity < STATIONARY_SPEED_THRESHOLD;
                self.is_stationary = stationary;

                if stationary {
                    self.velocity = 0.0;
                    self.accel_velocity = 0.0;
                } else {
                    self.velocity = if self.last_accel_time.is_some() {
                        GPS_WEIGHT * gps_velocity + ACCEL_WEIGHT * self.accel_velocity
                    } else {
                        gps_velocity
                    };
                    // Drift correction: fold the fused velocity back into the
                    // accel-integrated estimate so future accel-only dead
                    // reckoning starts from a GPS-grounded value.
                    self.accel_velocity = self.velocity;
                }
            }
        }

        self.last_gps_position = Some((lat, lon));
        self.last_gps_time = Some(t);
        self.last_gps_speed = Some(speed);
    }

    fn update_accel_at(&mut self, t: f64, magnitude: f64) {
        let Some(last_t) = self.last_accel_time else {
            self.last_accel_time = Some(t);
            self.accel_magnitude = magnitude;
            return;
        };

        let dt = t - last_t;
        if dt <= 0.0 {
            return;
        }

        self.accel_magnitude = magnitude;

        let integrated = if magnitude.abs() < STATIONARY_ACCEL_THRESHOLD {
            0.0
        } else {
            magnitude
        };

        self.accel_velocity += integrated * dt;
        self.accel_velocity = self.accel_velocity.max(0.0);

        // Distance is only ever advanced from GPS (haversine) to avoid
        // double-integration drift; accel-only dead reckoning feeds velocity.
        let gps_is_stale = match self.last_gps_time {
            None => true,
            Some(last_gps) => (t - last_gps) > GPS_STALE_SECS,
        };
        if gps_is_stale {
            self.velocity = self.accel_velocity;
        }

        self.last_accel_time = Some(t);
    }
}

impl Default for ComplementaryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ComplementaryFilter {
    fn update_accel(&mut self, magnitude: f32) -> (f64, f64) {
        self.update_accel_at(now_secs(), magnitude as f64);
        (self.velocity, self.distance)
    }

    fn update_gps(&mut self, lat: f64, lon: f64, speed: f32, accuracy: f32) -> (f64, f64) {
        self.update_gps_at(now_secs(), lat, lon, speed, accuracy);
        (self.velocity, self.distance)
    }

    fn update_gyro(&mut self, _wx: f32, _wy: f32, _wz: f32) -> (f64, f64) {
        (self.velocity, self.distance)
    }

    fn get_state(&self) -> FilterState {
        FilterState {
            velocity: self.velocity,
            distance: self.distance,
            accel_magnitude: self.accel_magnitude,
            stationary: self.is_stationary,
            last_gps_time: self.last_gps_time,
        }
    }

    fn get_position(&self) -> (f64, f64, f32) {
        match self.last_gps_position {
            None => (0.0, 0.0, 999.9),
            Some((lat, lon)) => (lat, lon, 5.0),
        }
    }

    fn reset(&mut self) {
        self.velocity = 0.0;
        self.accel_velocity = 0.0;
        self.distance = 0.0;
        self.last_accel_time = None;
        self.last_gps_time = None;
        self.last_gps_position = None;
        self.last_gps_speed = None;
    }
}

impl ComplementaryFilter {
    pub fn get_full_state(&self) -> ComplementaryFilterState {
        ComplementaryFilterState {
            velocity: self.velocity,
            distance: self.distance,
            accel_velocity: self.accel_velocity,
            accel_magnitude: self.accel_magnitude,
            last_gps_time: self.last_gps_time,
            is_stationary: self.is_stationary,
        }
    }
}

#[allow(dead_code)]
fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    const R: f64 = 6_371_000.0;
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let x = R * d_lon * origin_lat.to_radians().cos();
    let y = R * d_lat;
    (x, y)
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    R * c
}

fn now_secs() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_gps_fix_sets_origin_without_moving_distance() {
        let mut f = ComplementaryFilter::new();
        f.update_gps_at(100.0, 37.0, -122.0, 0.0, 5.0);
        assert_eq!(f.distance, 0.0);
        assert_eq!(f.get_position(), (37.0, -122.0, 5.0));
    }

    #[test]
    fn stationary_gps_jitter_zeroes_velocity() {
        let mut f = ComplementaryFilter::new();
        f.update_gps_at(100.0, 37.0, -122.0, 0.0, 5.0);
        // ~1m jump, within the 5m movement threshold -> stationary.
        f.update_gps_at(101.0, 37.000005, -122.0, 0.0, 5.0);
        assert_eq!(f.velocity, 0.0);
        assert!(f.is_stationary);
    }

    #[test]
    fn accel_integration_ignored_below_stationary_threshold() {
        let mut f = ComplementaryFilter::new();
        f.update_accel_at(0.0, 0.1);
        f.update_accel_at(1.0, 0.1); // below 0.20 threshold, treated as 0
        assert_eq!(f.accel_velocity, 0.0);
    }

    #[test]
    fn accel_only_dead_reckoning_when_gps_stale() {
        let mut f = ComplementaryFilter::new();
        f.update_accel_at(0.0, 1.0);
        f.update_accel_at(1.0, 1.0); // integrates: accel_velocity = 1.0
        let (v, _) = (f.velocity, f.distance);
        assert_eq!(v, 1.0);
    }

    #[test]
    fn distance_never_advances_from_accel_alone() {
        let mut f = ComplementaryFilter::new();
        f.update_accel_at(0.0, 2.0);
        f.update_accel_at(1.0, 2.0);
        f.update_accel_at(2.0, 2.0);
        assert_eq!(f.distance, 0.0);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut f = ComplementaryFilter::new();
        f.update_gps_at(100.0, 37.0, -122.0, 1.0, 5.0);
        f.update_accel_at(100.0, 1.0);
        f.reset();
        let state = f.get_state();
        assert_eq!(state.velocity, 0.0);
        assert_eq!(state.distance, 0.0);
        assert!(state.last_gps_time.is_none());
    }

    #[test]
    fn latlon_to_meters_roundtrip_small_offset() {
        let (x, y) = latlon_to_meters(37.001, -122.0, 37.0, -122.0);
        assert!(x.abs() < 1e-6);
        assert!((y - 111.0).abs() < 10.0);
    }
}
