//! 8D Error-State EKF: `[x, y, vx, vy, ax, ay, heading, heading_rate]` in a
//! local ENU frame anchored at the first GPS fix (§4.7).
//!
//! Grounded on the teacher's `filters/es_ekf.rs`, which already modeled this
//! state layout and the heading-decomposed velocity prediction faithfully.
//! The Kalman update gained a Joseph-form covariance step and a pseudo-
//! inverse fallback on a near-singular innovation covariance, matching
//! `original_source/motion_tracker_v2/filters/ekf.py`'s `update_gps`/
//! `update_accelerometer` (`np.linalg.pinv(S)` on `LinAlgError`, and
//! `I_KH @ P @ I_KH.T + K @ R @ K.T`).

#![allow(dead_code)]

use std::collections::VecDeque;

use ndarray::{arr1, Array1, Array2};
use serde::{Deserialize, Serialize};

use super::Filter;
use crate::types::FilterState;

const STATE_DIM: usize = 8;

/// Rolling window (sample count) over which the GPS speed median is taken
/// to decide the active motion profile (§4.7).
const MOTION_PROFILE_WINDOW: usize = 30;
const VEHICLE_SPEED_THRESHOLD_M_S: f64 = 2.5;
const DEAD_RECKONING_MIN_VELOCITY: f64 = 0.5;
const DEAD_RECKONING_INTERVAL_VEHICLE: f64 = 1.0;
const DEAD_RECKONING_INTERVAL_PEDESTRIAN: f64 = 0.3;

/// Which emission cadence and speed regime the filter believes it's in,
/// based on a rolling median of recent GPS-reported speeds (§4.7). Used
/// only to pace dead-reckoning trajectory emission between GPS fixes;
/// the Kalman state itself does not branch on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionProfile {
    Pedestrian,
    Vehicle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EsEkfState {
    pub position: (f64, f64),
    pub position_local: (f64, f64),
    pub velocity: f64,
    pub velocity_vector: (f64, f64),
    pub acceleration: f64,
    pub acceleration_vector: (f64, f64),
    pub heading: f64,
    pub heading_deg: f64,
    pub heading_rate: f64,
    pub heading_rate_degs: f64,
    pub distance: f64,
    pub uncertainty_m: f64,
    pub covariance_trace: f64,
    pub gps_updates: u64,
    pub accel_updates: u64,
    pub gyro_updates: u64,
}

pub struct EsEkf {
    dt: f64,
    state: Array1<f64>,
    covariance: Array2<f64>,
    process_noise: Array2<f64>,
    r_gps: Array2<f64>,
    r_accel: f64,
    r_gyro: f64,
    enable_gyro: bool,
    origin: Option<(f64, f64)>,
    last_position: Option<(f64, f64)>,
    last_gps_timestamp: Option<f64>,
    last_gps_bearing: f64,
    heading_initialized: bool,
    accumulated_distance: f64,
    gps_update_count: u64,
    accel_update_count: u64,
    gyro_update_count: u64,
    predict_count: u64,

    speed_history: VecDeque<f64>,
    motion_profile: MotionProfile,
    last_dead_reckoning_emit: Option<f64>,
}

impl EsEkf {
    pub fn new(
        dt: f64,
        gps_noise_std: f64,
        accel_noise_std: f64,
        enable_gyro: bool,
        gyro_noise_std: f64,
    ) -> Self {
        let state = Array1::<f64>::zeros(STATE_DIM);
        let covariance = Self::default_covariance();
        let process_noise = Self::build_process_noise(dt, accel_noise_std);

        let mut r_gps = Array2::<f64>::zeros((2, 2));
        let gps_var = gps_noise_std * gps_noise_std;
        r_gps[[0, 0]] = gps_var;
        r_gps[[1, 1]] = gps_var;

        let r_accel = accel_noise_std * accel_noise_std;
        let r_gyro = gyro_noise_std * gyro_noise_std;

        Self {
            dt,
            state,
            covariance,
            process_noise,
            r_gps,
            r_accel,
            r_gyro,
            enable_gyro,
            origin: None,
            last_position: None,
            last_gps_timestamp: None,
            last_gps_bearing: 0.0,
            heading_initialized: false,
            accumulated_distance: 0.0,
            gps_update_count: 0,
            accel_update_count: 0,
            gyro_update_count: 0,
            predict_count: 0,

            speed_history: VecDeque::with_capacity(MOTION_PROFILE_WINDOW),
            motion_profile: MotionProfile::Pedestrian,
            last_dead_reckoning_emit: None,
        }
    }

    /// Folds a GPS-reported speed into the rolling window and re-derives
    /// the active motion profile from its median (§4.7). Falls back to the
    /// filter's own velocity estimate when the provider reports no speed.
    fn update_motion_profile(&mut self, speed_m_s: f64) {
        if self.speed_history.len() == MOTION_PROFILE_WINDOW {
            self.speed_history.pop_front();
        }
        self.speed_history.push_back(speed_m_s);

        let mut sorted: Vec<f64> = self.speed_history.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = sorted[sorted.len() / 2];

        self.motion_profile = if median >= VEHICLE_SPEED_THRESHOLD_M_S {
            MotionProfile::Vehicle
        } else {
            MotionProfile::Pedestrian
        };
    }

    pub fn motion_profile(&self) -> MotionProfile {
        self.motion_profile
    }

    fn dead_reckoning_interval(&self) -> f64 {
        match self.motion_profile {
            MotionProfile::Vehicle => DEAD_RECKONING_INTERVAL_VEHICLE,
            MotionProfile::Pedestrian => DEAD_RECKONING_INTERVAL_PEDESTRIAN,
        }
    }

    /// Decides whether a dead-reckoning trajectory point should be emitted
    /// at `now` (§4.7, §4.9's `es_ekf_dead_reckoning` track). Gated on a
    /// minimum velocity so a stationary filter doesn't emit noise, and on
    /// the motion-profile-dependent cadence. Advances the internal emit
    /// clock as a side effect when it returns true.
    pub fn should_emit_dead_reckoning(&mut self, now: f64) -> bool {
        if self.velocity_magnitude() < DEAD_RECKONING_MIN_VELOCITY {
            return false;
        }
        let interval = self.dead_reckoning_interval();
        let due = match self.last_dead_reckoning_emit {
            None => true,
            Some(last) => now - last >= interval,
        };
        if due {
            self.last_dead_reckoning_emit = Some(now);
        }
        due
    }

    fn default_covariance() -> Array2<f64> {
        let mut p = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        let diag = [100.0, 100.0, 10.0, 10.0, 1.0, 1.0, 0.1, 0.01];
        for (idx, value) in diag.iter().enumerate() {
            p[[idx, idx]] = *value;
        }
        p
    }

    fn build_process_noise(dt: f64, accel_noise_std: f64) -> Array2<f64> {
        let accel_var = accel_noise_std * accel_noise_std;
        let q_pos = 0.25 * dt.powi(4) * accel_var;
        let q_vel = dt.powi(2) * accel_var;
        let q_accel = 0.5;
        let q_heading = 0.01;
        let q_heading_rate = 0.005;
        let mut q = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        q[[0, 0]] = q_pos;
        q[[1, 1]] = q_pos;
        q[[2, 2]] = q_vel;
        q[[3, 3]] = q_vel;
        q[[4, 4]] = q_accel;
        q[[5, 5]] = q_accel;
        q[[6, 6]] = q_heading;
        q[[7, 7]] = q_heading_rate;
        q
    }

    fn build_es_ekf_jacobian(dt: f64) -> Array2<f64> {
        let dt2 = dt * dt;
        let mut f = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));

        f[[0, 0]] = 1.0;
        f[[0, 2]] = dt;
        f[[0, 4]] = 0.5 * dt2;

        f[[1, 1]] = 1.0;
        f[[1, 3]] = dt;
        f[[1, 5]] = 0.5 * dt2;

        f[[2, 2]] = 1.0;
        f[[2, 4]] = dt;

        f[[3, 3]] = 1.0;
        f[[3, 5]] = dt;

        f[[4, 4]] = 1.0;
        f[[5, 5]] = 1.0;

        f[[6, 6]] = 1.0;
        f[[6, 7]] = dt;

        f[[7, 7]] = 1.0;

        f
    }

    fn gps_measurement_jacobian() -> Array2<f64> {
        let mut h = Array2::<f64>::zeros((2, STATE_DIM));
        h[[0, 0]] = 1.0;
        h[[1, 1]] = 1.0;
        h
    }

    fn accel_measurement_jacobian(&self) -> Array2<f64> {
        let ax = self.state[4];
        let ay = self.state[5];
        let accel_mag = (ax * ax + ay * ay).sqrt() + 1e-6;
        let mut h = Array2::<f64>::zeros((1, STATE_DIM));
        h[[0, 4]] = ax / accel_mag;
        h[[0, 5]] = ay / accel_mag;
        h
    }

    fn gyro_measurement_jacobian() -> Array2<f64> {
        let mut h = Array2::<f64>::zeros((1, STATE_DIM));
        h[[0, 7]] = 1.0;
        h
    }

    fn measurement_noise_from_var(var: f64) -> Array2<f64> {
        let mut r = Array2::<f64>::zeros((1, 1));
        r[[0, 0]] = var;
        r
    }

    /// Kalman gain + Joseph-form covariance update, matching `ekf.py`'s
    /// `I_KH @ P @ I_KH.T + K @ R @ K.T`. Falls back to the pseudo-inverse
    /// of `S` when it is near-singular rather than skipping the update.
    fn kalman_update(
        &mut self,
        measurement_matrix: &Array2<f64>,
        residual: &Array1<f64>,
        measurement_noise: &Array2<f64>,
    ) {
        let h = measurement_matrix;
        let p = &self.covariance;
        let r = measurement_noise;

        let h_t = h.t().to_owned();
        let hph = h.dot(p).dot(&h_t);
        let s = &hph + r;

        let s_inv = pseudo_inverse_spd(&s);

        let k = p.dot(&h_t).dot(&s_inv);
        let dx = k.dot(residual);
        self.state = &self.state + &dx;

        let n = self.state.len();
        let eye = Array2::eye(n);
        let kh = k.dot(h);
        let i_kh = &eye - &kh;

        let k_r_kt = k.dot(r).dot(&k.t());
        self.covariance = i_kh.dot(p).dot(&i_kh.t()) + k_r_kt;
    }

    pub fn predict(&mut self) {
        let vx = self.state[2];
        let vy = self.state[3];
        let ax = self.state[4];
        let ay = self.state[5];
        let heading = self.state[6];
        let heading_rate = self.state[7];

        let vel_mag = (vx * vx + vy * vy).sqrt();
        let vx_pred = vel_mag * heading.cos();
        let vy_pred = vel_mag * heading.sin();

        let dt = self.dt;
        let dt2 = dt * dt;
        self.state[0] += vx_pred * dt + 0.5 * ax * dt2;
        self.state[1] += vy_pred * dt + 0.5 * ay * dt2;
        self.state[2] += ax * dt;
        self.state[3] += ay * dt;
        self.state[6] += heading_rate * dt;

        let f = Self::build_es_ekf_jacobian(dt);
        let fpt = f.dot(&self.covariance).dot(&f.t());
        self.covariance = fpt + &self.process_noise;

        self.predict_count += 1;

        // Distance is accumulated in update_gps() from haversine measurements,
        // not from velocity integration, to avoid double-counting while GPS
        // is available.
    }

    pub fn update_gps(
        &mut self,
        latitude: f64,
        longitude: f64,
        gps_speed: Option<f64>,
        gps_accuracy: Option<f64>,
    ) {
        let now = current_timestamp();
        if self.origin.is_none() {
            self.origin = Some((latitude, longitude));
            self.last_position = Some((latitude, longitude));
            self.last_gps_timestamp = Some(now);
            self.state[0] = 0.0;
            self.state[1] = 0.0;
            self.gps_update_count += 1;
            return;
        }

        let (origin_lat, origin_lon) = self.origin.unwrap();
        let (x_meas, y_meas) = latlon_to_meters(latitude, longitude, origin_lat, origin_lon);

        self.update_motion_profile(gps_speed.unwrap_or_else(|| self.velocity_magnitude()));

        if let Some(speed) = gps_speed {
            if speed > 0.5 {
                if let Some((lat_prev, lon_prev)) = self.last_position {
                    let lat_prev_rad = lat_prev.to_radians();
                    let lat_curr_rad = latitude.to_radians();
                    let d_lon = (longitude - lon_prev).to_radians();
                    let numerator = d_lon.sin() * lat_curr_rad.cos();
                    let denominator = lat_prev_rad.cos() * lat_curr_rad.sin()
                        - lat_prev_rad.sin() * lat_curr_rad.cos() * d_lon.cos();
                    let bearing = numerator.atan2(denominator);
                    self.last_gps_bearing = bearing;
                    if !self.heading_initialized {
                        self.state[6] = bearing;
                        self.heading_initialized = true;
                    }
                }
            }
        }

        let measurement_matrix = Self::gps_measurement_jacobian();
        let residual = arr1(&[x_meas - self.state[0], y_meas - self.state[1]]);
        let mut measurement_noise = self.r_gps.clone();
        if let Some(acc) = gps_accuracy {
            if acc > 0.0 {
                let var = acc * acc;
                measurement_noise[[0, 0]] = var;
                measurement_noise[[1, 1]] = var;
            }
        }

        self.kalman_update(&measurement_matrix, &residual, &measurement_noise);

        if let Some((lat_prev, lon_prev)) = self.last_position {
            let delta_dist = haversine_distance(lat_prev, lon_prev, latitude, longitude);
            let speed_ok = gps_speed.map(|s| s > 1.0).unwrap_or(false);
            let acc_limit = gps_accuracy.unwrap_or(5.0).max(1.0);
            let dist_ok = delta_dist > acc_limit;
            if speed_ok || dist_ok {
                self.accumulated_distance += delta_dist;
            }
        }

        self.last_position = Some((latitude, longitude));
        self.last_gps_timestamp = Some(now);
        self.gps_update_count += 1;
    }

    /// Scalar-magnitude accelerometer update — canonical here because the
    /// dispatcher's `Sample::Accel` carries only a gravity-subtracted
    /// magnitude, never a signed body-frame vector, so there is no input
    /// to feed a vector-form update from.
    pub fn update_accelerometer(&mut self, accel_magnitude: f64) {
        let measurement_matrix = self.accel_measurement_jacobian();
        let ax = self.state[4];
        let ay = self.state[5];
        let z_pred = (ax * ax + ay * ay + 1e-9).sqrt();
        let residual = arr1(&[accel_magnitude - z_pred]);
        let measurement_noise = Self::measurement_noise_from_var(self.r_accel);

        self.kalman_update(&measurement_matrix, &residual, &measurement_noise);

        let accel_delta = accel_magnitude * self.dt;
        if self.heading_initialized {
            self.state[2] += accel_delta * self.state[6].cos();
            self.state[3] += accel_delta * self.state[6].sin();
        }

        let vel_mag = self.velocity_magnitude();
        if !self.heading_initialized {
            if vel_mag > 0.1 {
                self.state[6] = self.state[3].atan2(self.state[2]);
                self.heading_initialized = true;
            }
        } else {
            self.state[2] = vel_mag * self.state[6].cos();
            self.state[3] = vel_mag * self.state[6].sin();
        }

        self.accel_update_count += 1;
    }

    /// Uses Z (yaw rate) for heading; X/Y are accepted but unused in this
    /// 2D motion model.
    pub fn update_gyroscope(&mut self, _gyro_x: f64, _gyro_y: f64, gyro_z: f64) {
        if !self.enable_gyro {
            return;
        }

        let measurement_matrix = Self::gyro_measurement_jacobian();
        let residual = arr1(&[gyro_z - self.state[7]]);
        let measurement_noise = Self::measurement_noise_from_var(self.r_gyro);

        self.kalman_update(&measurement_matrix, &residual, &measurement_noise);

        self.state[6] += gyro_z * self.dt;

        self.gyro_update_count += 1;
    }

    pub fn get_position(&self) -> (f64, f64, f64) {
        if let Some((origin_lat, origin_lon)) = self.origin {
            let (lat, lon) = meters_to_latlon(self.state[0], self.state[1], origin_lat, origin_lon);
            let uncertainty = ((self.covariance[[0, 0]] + self.covariance[[1, 1]]) / 2.0).sqrt();
            (lat, lon, uncertainty)
        } else {
            (0.0, 0.0, 999.9)
        }
    }

    pub fn velocity_magnitude(&self) -> f64 {
        (self.state[2] * self.state[2] + self.state[3] * self.state[3]).sqrt()
    }

    pub fn acceleration_magnitude(&self) -> f64 {
        (self.state[4] * self.state[4] + self.state[5] * self.state[5]).sqrt()
    }

    pub fn get_state(&self) -> Option<EsEkfState> {
        let (lat, lon, uncertainty) = self.get_position();
        let vel_mag = self.velocity_magnitude();
        let accel_mag = self.acceleration_magnitude();
        let covariance_trace: f64 = (0..STATE_DIM).map(|i| self.covariance[[i, i]]).sum();

        Some(EsEkfState {
            position: (lat, lon),
            position_local: (self.state[0], self.state[1]),
            velocity: vel_mag,
            velocity_vector: (self.state[2], self.state[3]),
            acceleration: accel_mag,
            acceleration_vector: (self.state[4], self.state[5]),
            heading: self.state[6],
            heading_deg: self.state[6].to_degrees(),
            heading_rate: self.state[7],
            heading_rate_degs: self.state[7].to_degrees(),
            distance: self.accumulated_distance,
            uncertainty_m: uncertainty,
            covariance_trace,
            gps_updates: self.gps_update_count,
            accel_updates: self.accel_update_count,
            gyro_updates: self.gyro_update_count,
        })
    }

    /// Zero Velocity Update: forces velocity and acceleration to zero while
    /// stationary, so `predict()` doesn't integrate velocity back in from a
    /// residual gravity/noise acceleration estimate.
    pub fn apply_zupt(&mut self) {
        self.state[2] = 0.0;
        self.state[3] = 0.0;
        self.state[4] = 0.0;
        self.state[5] = 0.0;
    }

    pub fn state_set_heading(&mut self, heading_rad: f64) {
        self.state[6] = heading_rad;
    }

    pub fn get_covariance_snapshot(&self) -> (f64, [f64; STATE_DIM]) {
        let trace: f64 = (0..STATE_DIM).map(|i| self.covariance[[i, i]]).sum();
        let diag = [
            self.covariance[[0, 0]],
            self.covariance[[1, 1]],
            self.covariance[[2, 2]],
            self.covariance[[3, 3]],
            self.covariance[[4, 4]],
            self.covariance[[5, 5]],
            self.covariance[[6, 6]],
            self.covariance[[7, 7]],
        ];
        (trace, diag)
    }
}

impl Filter for EsEkf {
    fn update_accel(&mut self, magnitude: f32) -> (f64, f64) {
        self.update_accelerometer(magnitude as f64);
        (self.velocity_magnitude(), self.accumulated_distance)
    }

    fn update_gps(&mut self, lat: f64, lon: f64, speed: f32, accuracy: f32) -> (f64, f64) {
        let speed = if speed > 0.0 { Some(speed as f64) } else { None };
        let accuracy = if accuracy > 0.0 { Some(accuracy as f64) } else { None };
        EsEkf::update_gps(self, lat, lon, speed, accuracy);
        (self.velocity_magnitude(), self.accumulated_distance)
    }

    fn update_gyro(&mut self, wx: f32, wy: f32, wz: f32) -> (f64, f64) {
        self.update_gyroscope(wx as f64, wy as f64, wz as f64);
        (self.velocity_magnitude(), self.accumulated_distance)
    }

    fn get_state(&self) -> FilterState {
        FilterState {
            velocity: self.velocity_magnitude(),
            distance: self.accumulated_distance,
            accel_magnitude: self.acceleration_magnitude(),
            stationary: self.velocity_magnitude() < 0.1,
            last_gps_time: self.last_gps_timestamp,
        }
    }

    fn get_position(&self) -> (f64, f64, f32) {
        let (lat, lon, uncertainty) = EsEkf::get_position(self);
        (lat, lon, uncertainty as f32)
    }

    fn reset(&mut self) {
        self.state = Array1::<f64>::zeros(STATE_DIM);
        self.covariance = Self::default_covariance();
        self.origin = None;
        self.last_position = None;
        self.last_gps_timestamp = None;
        self.heading_initialized = false;
        self.accumulated_distance = 0.0;
        self.speed_history.clear();
        self.motion_profile = MotionProfile::Pedestrian;
        self.last_dead_reckoning_emit = None;
    }

    fn predict(&mut self) {
        EsEkf::predict(self);
    }
}

/// Moore-Penrose pseudo-inverse for the symmetric positive-semidefinite 1x1
/// or 2x2 innovation covariance `S`, used when `S` is near-singular instead
/// of skipping the Kalman update outright (mirrors `np.linalg.pinv` in the
/// Python reference's `LinAlgError` fallback path).
fn pseudo_inverse_spd(s: &Array2<f64>) -> Array2<f64> {
    const EPS: f64 = 1e-10;
    match s.dim() {
        (1, 1) => {
            let mut inv = Array2::<f64>::zeros((1, 1));
            if s[[0, 0]].abs() > EPS {
                inv[[0, 0]] = 1.0 / s[[0, 0]];
            }
            inv
        }
        (2, 2) => {
            let a = s[[0, 0]];
            let b = s[[0, 1]];
            let d = s[[1, 1]];
            let det = a * d - b * b;
            if det.abs() > EPS {
                let mut inv = Array2::<f64>::zeros((2, 2));
                inv[[0, 0]] = d / det;
                inv[[0, 1]] = -b / det;
                inv[[1, 0]] = -b / det;
                inv[[1, 1]] = a / det;
                return inv;
            }
            // Near-singular: diagonalize (symmetric 2x2 is always
            // diagonalizable) and invert only the non-negligible eigenvalue.
            let trace = a + d;
            let disc = ((a - d) / 2.0).powi(2) + b * b;
            let sq = disc.max(0.0).sqrt();
            let lambda1 = trace / 2.0 + sq;
            let lambda2 = trace / 2.0 - sq;

            let eig = |lambda: f64| -> (f64, f64) {
                if b.abs() > EPS {
                    (lambda - d, b)
                } else if a >= d {
                    (1.0, 0.0)
                } else {
                    (0.0, 1.0)
                }
            };
            let (v1x, v1y) = eig(lambda1);
            let norm1 = (v1x * v1x + v1y * v1y).sqrt().max(EPS);
            let (v1x, v1y) = (v1x / norm1, v1y / norm1);
            let (v2x, v2y) = (-v1y, v1x);

            let inv_lambda1 = if lambda1.abs() > EPS { 1.0 / lambda1 } else { 0.0 };
            let inv_lambda2 = if lambda2.abs() > EPS { 1.0 / lambda2 } else { 0.0 };

            let mut inv = Array2::<f64>::zeros((2, 2));
            inv[[0, 0]] = inv_lambda1 * v1x * v1x + inv_lambda2 * v2x * v2x;
            inv[[0, 1]] = inv_lambda1 * v1x * v1y + inv_lambda2 * v2x * v2y;
            inv[[1, 0]] = inv[[0, 1]];
            inv[[1, 1]] = inv_lambda1 * v1y * v1y + inv_lambda2 * v2y * v2y;
            inv
        }
        _ => s.clone(),
    }
}

fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    const R: f64 = 6_371_000.0;
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let x = R * d_lon * origin_lat.to_radians().cos();
    let y = R * d_lat;
    (x, y)
}

fn meters_to_latlon(x: f64, y: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    const R: f64 = 6_371_000.0;
    let d_lat = y / R;
    let d_lon = x / (R * origin_lat.to_radians().cos());
    let lat = origin_lat + d_lat.to_degrees();
    let lon = origin_lon + d_lon.to_degrees();
    (lat, lon)
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

fn current_timestamp() -> f64 {
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
    fn first_gps_fix_anchors_origin() {
        let mut ekf = EsEkf::new(0.1, 5.0, 0.5, true, 0.05);
        ekf.update_gps(37.0, -122.0, None, None);
        assert_eq!(ekf.state[0], 0.0);
        assert_eq!(ekf.state[1], 0.0);
        assert_eq!(ekf.gps_update_count, 1);
    }

    #[test]
    fn pseudo_inverse_matches_regular_inverse_when_nonsingular() {
        let mut s = Array2::<f64>::zeros((2, 2));
        s[[0, 0]] = 4.0;
        s[[1, 1]] = 9.0;
        let inv = pseudo_inverse_spd(&s);
        assert!((inv[[0, 0]] - 0.25).abs() < 1e-9);
        assert!((inv[[1, 1]] - (1.0 / 9.0)).abs() < 1e-9);
    }

    #[test]
    fn pseudo_inverse_handles_singular_matrix() {
        let s = Array2::<f64>::zeros((2, 2));
        let inv = pseudo_inverse_spd(&s);
        assert_eq!(inv, Array2::<f64>::zeros((2, 2)));
    }

    #[test]
    fn predict_advances_position_from_velocity_and_accel() {
        let mut ekf = EsEkf::new(1.0, 5.0, 0.5, true, 0.05);
        ekf.update_gps(37.0, -122.0, None, None);
        ekf.state[2] = 1.0; // vx
        ekf.predict();
        assert!(ekf.state[0] > 0.0);
    }

    #[test]
    fn zupt_zeroes_velocity_and_acceleration() {
        let mut ekf = EsEkf::new(0.1, 5.0, 0.5, true, 0.05);
        ekf.state[2] = 2.0;
        ekf.state[4] = 1.0;
        ekf.apply_zupt();
        assert_eq!(ekf.velocity_magnitude(), 0.0);
        assert_eq!(ekf.acceleration_magnitude(), 0.0);
    }

    #[test]
    fn sustained_vehicle_speed_switches_motion_profile() {
        let mut ekf = EsEkf::new(1.0, 5.0, 0.5, true, 0.05);
        ekf.update_gps(37.0, -122.0, Some(0.0), None);
        for i in 0..MOTION_PROFILE_WINDOW {
            let lat = 37.0 + (i as f64) * 0.0001;
            ekf.update_gps(lat, -122.0, Some(10.0), None);
        }
        assert_eq!(ekf.motion_profile(), MotionProfile::Vehicle);
        assert!((ekf.dead_reckoning_interval() - DEAD_RECKONING_INTERVAL_VEHICLE).abs() < 1e-9);
    }

    #[test]
    fn dead_reckoning_respects_min_velocity_and_cadence() {
        let mut ekf = EsEkf::new(0.1, 5.0, 0.5, true, 0.05);
        assert!(!ekf.should_emit_dead_reckoning(0.0)); // stationary, below min velocity
        ekf.state[2] = 1.0;
        assert!(ekf.should_emit_dead_reckoning(10.0));
        assert!(!ekf.should_emit_dead_reckoning(10.1)); // too soon for pedestrian cadence
        assert!(ekf.should_emit_dead_reckoning(10.5));
    }
}
