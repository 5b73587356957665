//! 13-state error-state EKF (§4.6), the primary filter: local-ENU position
//! (3), velocity (3), accelerometer bias (3), orientation quaternion (4).
//! Gyro integrates directly into the quaternion kinematics rather than
//! through a separate bias state — the spec's §3 note that "gyro biases
//! may replace accel biases in variants" describes an alternative layout,
//! not an additional one, and the canonical 13-state form this module
//! builds keeps accel bias as the bias slot (documented in DESIGN.md).
//!
//! Grounded on the teacher's `filters/ekf_13d.rs` ("Experimental Shadow
//! Mode") for the state layout, quaternion helpers (`normalize_quat`,
//! `rotate_body_to_world`) and local-ENU projection, generalized from a
//! placeholder shadow filter into the spec's primary estimator: Joseph-form
//! covariance updates and the pseudoinverse-on-singular-S fallback are
//! ported from `original_source/motion_tracker_v2/filters/ekf.py`
//! (`np.linalg.pinv` on `LinAlgError`, `I_KH @ P @ I_KH.T + K @ R @ K.T`);
//! GPS NIS gating and the divergence "snap" are new per §4.6 (the Python
//! reference has no equivalent outlier test).

use nalgebra::{Matrix2, Matrix3, Vector2, SMatrix, SVD};
use serde::{Deserialize, Serialize};

use super::Filter;
use crate::types::{EkfGpsDiagnostics, FilterState};

const STATE_DIM: usize = 13;
type StateVec = SMatrix<f64, STATE_DIM, 1>;
type StateMat = SMatrix<f64, STATE_DIM, STATE_DIM>;

/// 99th-percentile chi-squared threshold for 2 degrees of freedom (§4.6).
const NIS_GATE_CHI2_DF2_P99: f64 = 9.21;
/// Cumulative divergence beyond which a rejected fix forces a position snap.
const SNAP_DIVERGENCE_M: f64 = 30.0;
const STATIONARY_SPEED_THRESHOLD: f64 = 0.1;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ekf13dState {
    pub position: (f64, f64, f64),
    pub velocity: (f64, f64, f64),
    pub accel_bias: (f64, f64, f64),
    pub quaternion: (f64, f64, f64, f64),
    pub covariance_trace: f64,
    pub distance: f64,
    pub gps_rejections: u64,
    pub gps_snaps: u64,
    pub gps_updates: u64,
    pub accel_updates: u64,
    pub gyro_updates: u64,
}

pub struct Ekf13d {
    mean: StateVec,
    cov: StateMat,
    process_noise_accel_std: f64,
    r_gps: f64,
    r_accel: f64,
    enable_gyro: bool,

    origin: Option<(f64, f64)>,
    last_gps_pos: Option<(f64, f64)>,
    last_gps_time: Option<f64>,
    last_predict_time: Option<f64>,
    last_gyro: (f64, f64, f64),
    stationary: bool,

    accumulated_distance: f64,
    gps_rejections: u64,
    gps_snaps: u64,
    gps_updates: u64,
    accel_updates: u64,
    gyro_updates: u64,

    last_diagnostics: Option<EkfGpsDiagnostics>,
}

impl Ekf13d {
    pub fn new(accel_noise_std: f64, gps_noise_std: f64, enable_gyro: bool) -> Self {
        let mut mean = StateVec::zeros();
        mean[9] = 1.0; // qw = 1 (identity orientation)

        Self {
            mean,
            cov: Self::default_covariance(),
            process_noise_accel_std: accel_noise_std,
            r_gps: gps_noise_std * gps_noise_std,
            r_accel: 0.25, // m^2/s^4, loosely tuned against a bias-drift scale
            enable_gyro,
            origin: None,
            last_gps_pos: None,
            last_gps_time: None,
            last_predict_time: None,
            last_gyro: (0.0, 0.0, 0.0),
            stationary: false,
            accumulated_distance: 0.0,
            gps_rejections: 0,
            gps_snaps: 0,
            gps_updates: 0,
            accel_updates: 0,
            gyro_updates: 0,
            last_diagnostics: None,
        }
    }

    fn default_covariance() -> StateMat {
        let mut p = StateMat::zeros();
        let diag: [f64; STATE_DIM] = [
            100.0, 100.0, 100.0, // position
            10.0, 10.0, 10.0, // velocity
            0.05, 0.05, 0.05, // accel bias
            0.05, 0.05, 0.05, 0.05, // quaternion
        ];
        for (i, v) in diag.iter().enumerate() {
            p[(i, i)] = *v;
        }
        p
    }

    fn quaternion(&self) -> (f64, f64, f64, f64) {
        (self.mean[9], self.mean[10], self.mean[11], self.mean[12])
    }

    fn set_quaternion(&mut self, q: (f64, f64, f64, f64)) {
        self.mean[9] = q.0;
        self.mean[10] = q.1;
        self.mean[11] = q.2;
        self.mean[12] = q.3;
    }

    fn normalize_quaternion(&mut self) {
        let (w, x, y, z) = self.quaternion();
        let norm = (w * w + x * x + y * y + z * z).sqrt();
        if norm > 1e-9 {
            self.set_quaternion((w / norm, x / norm, y / norm, z / norm));
        }
    }

    fn rotation_matrix(&self) -> Matrix3<f64> {
        let (w, x, y, z) = self.quaternion();
        Matrix3::new(
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        )
    }

    /// Predict step (§4.6): constant-velocity-plus-bias kinematics. Gravity
    /// is already removed from the accel magnitude upstream (§4.5), so the
    /// body-frame specific force is modeled as `(magnitude, 0, 0)` — the
    /// scalar reduction the sensor pipeline hands every filter — along the
    /// body x (forward) axis, with `g_vec` taken as zero in this frame.
    fn predict(&mut self, accel_magnitude: f64, dt: f64) {
        if dt <= 0.0 {
            return;
        }

        let bias = nalgebra::Vector3::new(self.mean[6], self.mean[7], self.mean[8]);
        let a_body = nalgebra::Vector3::new(accel_magnitude, 0.0, 0.0) - bias;
        let r = self.rotation_matrix();
        let a_world = r * a_body;

        let vel = nalgebra::Vector3::new(self.mean[3], self.mean[4], self.mean[5]);
        for i in 0..3 {
            self.mean[i] += vel[i] * dt + 0.5 * a_world[i] * dt * dt;
            self.mean[3 + i] += a_world[i] * dt;
        }

        let (gx, gy, gz) = if self.enable_gyro { self.last_gyro } else { (0.0, 0.0, 0.0) };
        let (w, x, y, z) = self.quaternion();
        let half_dt = 0.5 * dt;
        let dq = (
            -half_dt * (gx * x + gy * y + gz * z),
            half_dt * (gx * w - gy * z + gz * y),
            half_dt * (gy * w + gx * z - gz * x),
            half_dt * (gz * w - gx * y + gy * x),
        );
        self.set_quaternion((w + dq.0, x + dq.1, y + dq.2, z + dq.3));
        self.normalize_quaternion();

        let f = self.state_transition_jacobian(dt, &r);
        let q = self.process_noise(dt);
        self.cov = f * self.cov * f.transpose() + q;
        self.cov = (self.cov + self.cov.transpose()) * 0.5;

        self.last_predict_time = Some(self.last_predict_time.unwrap_or(0.0) + dt);
    }

    /// Closed-form `F = df/dstate`. The velocity-to-quaternion coupling
    /// (how a small attitude error rotates the specific-force vector) is
    /// linearized to zero here — a common simplification in
    /// production-grade filters that trade a fully exact attitude Jacobian
    /// for a tractable, numerically stable one.
    fn state_transition_jacobian(&self, dt: f64, r: &Matrix3<f64>) -> StateMat {
        let mut f = StateMat::identity();
        for i in 0..3 {
            f[(i, 3 + i)] = dt; // dp/dv
        }
        let neg_r_dt = -r * dt;
        for i in 0..3 {
            for j in 0..3 {
                f[(3 + i, 6 + j)] = neg_r_dt[(i, j)]; // dv/dba
            }
        }
        f
    }

    fn process_noise(&self, dt: f64) -> StateMat {
        let qa = self.process_noise_accel_std;
        let q_pos = 0.25 * dt.powi(4) * qa * qa;
        let q_vel = dt * dt * qa * qa;
        let q_bias = 1e-5 * dt;
        let q_quat = 1e-4 * dt;

        let mut q = StateMat::zeros();
        for i in 0..3 {
            q[(i, i)] = q_pos;
            q[(3 + i, 3 + i)] = q_vel;
            q[(6 + i, 6 + i)] = q_bias;
        }
        for i in 9..13 {
            q[(i, i)] = q_quat;
        }
        q
    }

    fn project_to_local_enu(&self, lat: f64, lon: f64) -> (f64, f64) {
        let (origin_lat, origin_lon) = self.origin.unwrap_or((lat, lon));
        let origin_lat_rad = origin_lat.to_radians();
        let east = EARTH_RADIUS_M * (lon - origin_lon).to_radians() * origin_lat_rad.cos();
        let north = EARTH_RADIUS_M * (lat - origin_lat).to_radians();
        (east, north)
    }

    fn local_enu_to_latlon(&self, east: f64, north: f64) -> (f64, f64) {
        let (origin_lat, origin_lon) = self.origin.unwrap_or((0.0, 0.0));
        let origin_lat_rad = origin_lat.to_radians();
        let lat = origin_lat + (north / EARTH_RADIUS_M).to_degrees();
        let lon = origin_lon + (east / (EARTH_RADIUS_M * origin_lat_rad.cos())).to_degrees();
        (lat, lon)
    }

    /// GPS update (§4.6): NIS-gated, Joseph-form, with a divergence snap
    /// for rejected fixes that fall far outside the filter's current track.
    fn update_gps_inner(&mut self, lat: f64, lon: f64, speed: f32, accuracy: f32) {
        if self.origin.is_none() {
            self.origin = Some((lat, lon));
            self.last_gps_pos = Some((lat, lon));
            self.last_gps_time = Some(0.0);
            self.gps_updates += 1;
            return;
        }

        let (meas_e, meas_n) = self.project_to_local_enu(lat, lon);
        let z = Vector2::new(meas_e, meas_n);
        let pred = Vector2::new(self.mean[0], self.mean[1]);
        let residual = z - pred;

        let r = if accuracy > 0.0 {
            (accuracy as f64) * (accuracy as f64)
        } else {
            self.r_gps
        };
        let mut s = Matrix2::zeros();
        for i in 0..2 {
            for j in 0..2 {
                s[(i, j)] = self.cov[(i, j)];
            }
            s[(i, i)] += r;
        }

        let s_inv = invert_or_pseudo(&s);
        let nis = (residual.transpose() * s_inv * residual)[(0, 0)];
        let rejected = nis > NIS_GATE_CHI2_DF2_P99;

        let (last_lat, last_lon) = self.last_gps_pos.unwrap_or((lat, lon));
        let step_dist = haversine_distance(last_lat, last_lon, lat, lon);
        let pred_lat_lon = self.local_enu_to_latlon(pred.x, pred.y);
        let prediction_error = haversine_distance(pred_lat_lon.0, pred_lat_lon.1, lat, lon);

        let mut snapped = false;
        if rejected {
            self.gps_rejections += 1;
            if prediction_error > SNAP_DIVERGENCE_M {
                self.mean[0] = meas_e;
                self.mean[1] = meas_n;
                for i in 0..2 {
                    self.cov[(i, i)] = 100.0;
                }
                self.gps_snaps += 1;
                snapped = true;
                log::warn!(
                    target: "ekf_13d",
                    "gps divergence {prediction_error:.1}m exceeds snap threshold; position snapped"
                );
            }
        } else {
            let movement_threshold = if accuracy > 0.0 { (5.0_f64).max(accuracy as f64 * 1.5) } else { 5.0 };
            let gps_speed = if speed > 0.0 { speed as f64 } else { step_dist / 1.0_f64.max(1e-6) };
            self.stationary = step_dist < movement_threshold && gps_speed < STATIONARY_SPEED_THRESHOLD;

            let h = {
                let mut h = SMatrix::<f64, 2, STATE_DIM>::zeros();
                h[(0, 0)] = 1.0;
                h[(1, 1)] = 1.0;
                h
            };
            let k = self.cov * h.transpose() * s_inv;
            let dx = k * residual;
            self.mean += dx;
            self.normalize_quaternion();

            let i_kh = StateMat::identity() - k * h;
            let r_mat = Matrix2::new(r, 0.0, 0.0, r);
            self.cov = i_kh * self.cov * i_kh.transpose() + k * r_mat * k.transpose();
            self.cov = (self.cov + self.cov.transpose()) * 0.5;

            if self.stationary {
                for i in 3..6 {
                    self.mean[i] = 0.0;
                    self.cov[(i, i)] = self.cov[(i, i)].min(0.01);
                }
            } else {
                self.accumulated_distance += step_dist;
            }
        }

        self.last_gps_pos = Some((lat, lon));
        self.last_gps_time = Some(self.last_predict_time.unwrap_or(0.0));
        self.gps_updates += 1;

        let cov_diag = [
            self.cov[(0, 0)],
            self.cov[(1, 1)],
            self.cov[(2, 2)],
            self.cov[(3, 3)],
            self.cov[(4, 4)],
            self.cov[(5, 5)],
        ];
        self.last_diagnostics = Some(EkfGpsDiagnostics {
            t: self.last_predict_time.unwrap_or(0.0),
            innovation_m: residual.norm(),
            prediction_error_m: prediction_error,
            nis,
            rejected,
            snapped,
            zupt_active: self.stationary,
            covariance_diag: cov_diag,
            linear_accel_magnitude: self.velocity_vector().norm(),
            turn_rate: self.last_gyro.2,
        });
    }

    /// Accel-magnitude update (§4.6): refines the accel-bias estimate by
    /// treating the residual specific force — what's left after the
    /// predict step's own correction — as a slowly-varying bias signal.
    fn update_accel_inner(&mut self, magnitude: f64, dt: f64) {
        self.predict(magnitude, dt);

        let bias = nalgebra::Vector3::new(self.mean[6], self.mean[7], self.mean[8]);
        let bias_mag = bias.norm().max(1e-6);
        let residual = magnitude - bias_mag;

        let mut h = SMatrix::<f64, 1, STATE_DIM>::zeros();
        h[(0, 6)] = bias[0] / bias_mag;
        h[(0, 7)] = bias[1] / bias_mag;
        h[(0, 8)] = bias[2] / bias_mag;

        let s = (h * self.cov * h.transpose())[(0, 0)] + self.r_accel;
        if s.abs() < 1e-9 {
            self.accel_updates += 1;
            return;
        }
        let k = self.cov * h.transpose() / s;
        self.mean += k * residual;
        self.normalize_quaternion();

        let i_kh = StateMat::identity() - k * h;
        self.cov = i_kh * self.cov * i_kh.transpose() + k * (self.r_accel) * k.transpose();
        self.cov = (self.cov + self.cov.transpose()) * 0.5;

        self.accel_updates += 1;
    }

    fn velocity_vector(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::new(self.mean[3], self.mean[4], self.mean[5])
    }

    pub fn get_diagnostics(&self) -> Option<EkfGpsDiagnostics> {
        self.last_diagnostics
    }

    pub fn get_full_state(&self) -> Ekf13dState {
        Ekf13dState {
            position: (self.mean[0], self.mean[1], self.mean[2]),
            velocity: (self.mean[3], self.mean[4], self.mean[5]),
            accel_bias: (self.mean[6], self.mean[7], self.mean[8]),
            quaternion: self.quaternion(),
            covariance_trace: (0..STATE_DIM).map(|i| self.cov[(i, i)]).sum(),
            distance: self.accumulated_distance,
            gps_rejections: self.gps_rejections,
            gps_snaps: self.gps_snaps,
            gps_updates: self.gps_updates,
            accel_updates: self.accel_updates,
            gyro_updates: self.gyro_updates,
        }
    }
}

impl Filter for Ekf13d {
    fn update_accel(&mut self, magnitude: f32) -> (f64, f64) {
        let dt = 1.0 / 20.0; // nominal accel sample interval; see §5 ordering note
        self.update_accel_inner(magnitude as f64, dt);
        (self.velocity_vector().norm(), self.accumulated_distance)
    }

    fn update_gps(&mut self, lat: f64, lon: f64, speed: f32, accuracy: f32) -> (f64, f64) {
        self.update_gps_inner(lat, lon, speed, accuracy);
        (self.velocity_vector().norm(), self.accumulated_distance)
    }

    fn update_gyro(&mut self, wx: f32, wy: f32, wz: f32) -> (f64, f64) {
        if self.enable_gyro {
            self.last_gyro = (wx as f64, wy as f64, wz as f64);
            self.gyro_updates += 1;
        }
        (self.velocity_vector().norm(), self.accumulated_distance)
    }

    fn get_state(&self) -> FilterState {
        FilterState {
            velocity: self.velocity_vector().norm(),
            distance: self.accumulated_distance,
            accel_magnitude: nalgebra::Vector3::new(self.mean[6], self.mean[7], self.mean[8]).norm(),
            stationary: self.stationary,
            last_gps_time: self.last_gps_time,
        }
    }

    fn get_position(&self) -> (f64, f64, f32) {
        if self.origin.is_none() {
            return (0.0, 0.0, 999.9);
        }
        let (lat, lon) = self.local_enu_to_latlon(self.mean[0], self.mean[1]);
        let uncertainty = ((self.cov[(0, 0)] + self.cov[(1, 1)]) * 0.5).sqrt();
        (lat, lon, uncertainty as f32)
    }

    fn reset(&mut self) {
        for i in 3..6 {
            self.mean[i] = 0.0;
        }
        self.accumulated_distance = 0.0;
    }

    fn predict(&mut self) {
        // Dead-reckoning cadence is driven by `update_accel`'s own dt for
        // this filter — GPS gaps are the ES-EKF's responsibility (§4.7).
    }
}

/// Inverts a symmetric positive semi-definite 2x2 matrix, falling back to
/// its Moore-Penrose pseudoinverse when the condition number exceeds 1e10
/// (§4.6's "if S is near-singular... fall back to pseudoinverse").
fn invert_or_pseudo(s: &Matrix2<f64>) -> Matrix2<f64> {
    let svd = SVD::new(*s, true, true);
    let sv = svd.singular_values;
    let max_sv = sv.max();
    let min_sv = sv.min();
    let condition = if min_sv > 1e-15 { max_sv / min_sv } else { f64::INFINITY };

    if condition <= 1e10 {
        if let Some(inv) = s.try_inverse() {
            return inv;
        }
    }
    svd.pseudo_inverse(1e-10).unwrap_or_else(|_| Matrix2::identity())
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_gps_fix_anchors_origin_without_moving_distance() {
        let mut ekf = Ekf13d::new(0.1, 5.0, false);
        ekf.update_gps(37.0, -122.0, 0.0, 5.0);
        assert_eq!(ekf.accumulated_distance, 0.0);
        assert!(ekf.origin.is_some());
    }

    #[test]
    fn quaternion_stays_unit_norm_after_predict() {
        let mut ekf = Ekf13d::new(0.1, 5.0, true);
        ekf.update_gyro(0.1, -0.05, 0.2);
        for _ in 0..50 {
            ekf.update_accel(0.3);
        }
        let (w, x, y, z) = ekf.quaternion();
        let norm = (w * w + x * x + y * y + z * z).sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn covariance_stays_symmetric_after_gps_update() {
        let mut ekf = Ekf13d::new(0.1, 5.0, false);
        ekf.update_gps(37.0, -122.0, 0.0, 5.0);
        ekf.update_gps(37.0001, -122.0001, 5.0, 5.0);
        for i in 0..STATE_DIM {
            for j in 0..STATE_DIM {
                assert!((ekf.cov[(i, j)] - ekf.cov[(j, i)]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn outlier_fix_is_rejected_without_snap() {
        let mut ekf = Ekf13d::new(0.1, 5.0, false);
        ekf.update_gps(37.0, -122.0, 0.0, 5.0);
        ekf.update_gps(37.001, -122.001, 0.0, 5.0); // ~140m jump with default std -> should gate
        let diag = ekf.get_diagnostics().unwrap();
        assert!(diag.rejected);
        assert_eq!(ekf.gps_rejections, 1);
    }

    #[test]
    fn far_outlier_triggers_snap() {
        let mut ekf = Ekf13d::new(0.1, 5.0, false);
        ekf.update_gps(37.0, -122.0, 0.0, 5.0);
        ekf.update_gps(37.01, -122.01, 0.0, 5.0); // >1km jump -> divergence snap
        let diag = ekf.get_diagnostics().unwrap();
        assert!(diag.rejected);
        assert!(diag.snapped);
        assert_eq!(ekf.gps_snaps, 1);
    }

    #[test]
    fn stationary_gps_zeroes_velocity_and_skips_distance() {
        let mut ekf = Ekf13d::new(0.1, 5.0, false);
        ekf.update_gps(37.0, -122.0, 0.0, 5.0);
        ekf.update_gps(37.000001, -122.0, 0.0, 5.0);
        assert_eq!(ekf.accumulated_distance, 0.0);
        assert!(ekf.stationary);
    }
}
