//! Accelerometer Calibration & Pre-Processing (§4.5).

use serde::{Deserialize, Serialize};

const GRAVITY_MIN: f64 = 9.5;
const GRAVITY_MAX: f64 = 10.1;
const DEFAULT_GRAVITY: f64 = 9.81;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Bias3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Bias3 {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn drift_from(&self, other: &Bias3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub gravity_bias: Bias3,
    pub gyro_bias: Bias3,
    pub complete: bool,
}

/// Computes per-axis accel bias (gravity vector) and gyro zero-rate bias
/// from a stationary window of samples (§4.5). `accel_samples`/`gyro_samples`
/// are raw 3-axis readings collected before gravity subtraction.
pub fn calculate_biases(
    accel_samples: &[(f64, f64, f64)],
    gyro_samples: &[(f64, f64, f64)],
) -> CalibrationResult {
    let gravity_bias = if accel_samples.is_empty() {
        Bias3 { x: 0.0, y: 0.0, z: DEFAULT_GRAVITY }
    } else {
        let n = accel_samples.len() as f64;
        let (sx, sy, sz) = accel_samples.iter().fold((0.0, 0.0, 0.0), |acc, s| {
            (acc.0 + s.0, acc.1 + s.1, acc.2 + s.2)
        });
        Bias3 { x: sx / n, y: sy / n, z: sz / n }
    };

    let gyro_bias = if gyro_samples.is_empty() {
        Bias3 { x: 0.0, y: 0.0, z: 0.0 }
    } else {
        let n = gyro_samples.len() as f64;
        let (sx, sy, sz) = gyro_samples.iter().fold((0.0, 0.0, 0.0), |acc, s| {
            (acc.0 + s.0, acc.1 + s.1, acc.2 + s.2)
        });
        Bias3 { x: sx / n, y: sy / n, z: sz / n }
    };

    let complete = !accel_samples.is_empty();
    if complete {
        let g = gravity_bias.magnitude();
        if !(GRAVITY_MIN..=GRAVITY_MAX).contains(&g) {
            log::warn!(
                target: "calibration",
                "gravity magnitude {g:.3} outside [{GRAVITY_MIN}, {GRAVITY_MAX}]; continuing with measured bias"
            );
        }
    }

    CalibrationResult { gravity_bias, gyro_bias, complete }
}

/// Opt-in dynamic gravity recalibration (§4.5): during sustained stillness,
/// accumulate samples and periodically refold them into the gravity
/// estimate via an EMA, warning if drift from the startup estimate exceeds
/// `drift_threshold`. Ported near-verbatim from the teacher's
/// `DynamicCalibration` in `main.rs`.
#[derive(Clone, Debug)]
pub struct DynamicCalibration {
    accumulator: Vec<(f64, f64, f64)>,
    estimate: Bias3,
    startup: Bias3,
    refinement_count: u64,
    ema_alpha: f64,
    min_samples: usize,
    drift_threshold: f64,
}

impl DynamicCalibration {
    pub fn new(initial_gravity: Bias3) -> Self {
        Self {
            accumulator: Vec::with_capacity(100),
            estimate: initial_gravity,
            startup: initial_gravity,
            refinement_count: 0,
            ema_alpha: 0.1,
            min_samples: 30,
            drift_threshold: 0.5,
        }
    }

    pub fn accumulate(&mut self, ax: f64, ay: f64, az: f64) {
        self.accumulator.push((ax, ay, az));
    }

    fn candidate_estimate(&self) -> Option<Bias3> {
        if self.accumulator.len() < self.min_samples {
            return None;
        }
        let n = self.accumulator.len() as f64;
        let (sx, sy, sz) = self.accumulator.iter().fold((0.0, 0.0, 0.0), |acc, s| {
            (acc.0 + s.0, acc.1 + s.1, acc.2 + s.2)
        });
        Some(Bias3 { x: sx / n, y: sy / n, z: sz / n })
    }

    /// Refines the gravity estimate if enough stationary samples have been
    /// accumulated, returning the new estimate and whether it exceeds the
    /// drift-warning threshold.
    pub fn try_refine(&mut self) -> Option<(Bias3, bool)> {
        let candidate = self.candidate_estimate()?;
        self.estimate = Bias3 {
            x: self.ema_alpha * candidate.x + (1.0 - self.ema_alpha) * self.estimate.x,
            y: self.ema_alpha * candidate.y + (1.0 - self.ema_alpha) * self.estimate.y,
            z: self.ema_alpha * candidate.z + (1.0 - self.ema_alpha) * self.estimate.z,
        };
        self.refinement_count += 1;
        self.accumulator.clear();

        let drift = self.estimate.drift_from(&self.startup);
        let warn = drift > self.drift_threshold;
        if warn {
            log::warn!(
                target: "calibration",
                "gravity drift {drift:.3} m/s^2 exceeds threshold {:.3} m/s^2; possible sensor degradation",
                self.drift_threshold
            );
        }
        Some((self.estimate, warn))
    }

    pub fn estimate(&self) -> Bias3 {
        self.estimate
    }

    pub fn refinement_count(&self) -> u64 {
        self.refinement_count
    }
}

/// Reduces a raw (gravity-subtracted) 3-axis reading to the scalar motion
/// magnitude filters consume (§4.5): `m = max(0, |(x,y,z)| - g)`.
pub fn motion_magnitude(x: f64, y: f64, z: f64, gravity_magnitude: f64) -> f64 {
    let raw = (x * x + y * y + z * z).sqrt();
    (raw - gravity_magnitude).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biases_from_stationary_window() {
        let accel: Vec<_> = (0..20).map(|_| (0.01, -0.02, 9.80)).collect();
        let gyro: Vec<_> = (0..20).map(|_| (0.001, -0.001, 0.0)).collect();
        let result = calculate_biases(&accel, &gyro);
        assert!(result.complete);
        assert!((result.gravity_bias.z - 9.80).abs() < 1e-9);
    }

    #[test]
    fn empty_window_uses_default_gravity() {
        let result = calculate_biases(&[], &[]);
        assert!(!result.complete);
        assert!((result.gravity_bias.magnitude() - DEFAULT_GRAVITY).abs() < 1e-9);
    }

    #[test]
    fn dynamic_recalibration_requires_min_samples() {
        let mut calib = DynamicCalibration::new(Bias3 { x: 0.0, y: 0.0, z: 9.81 });
        for _ in 0..29 {
            calib.accumulate(0.0, 0.0, 9.81);
        }
        assert!(calib.try_refine().is_none());
        calib.accumulate(0.0, 0.0, 9.81);
        assert!(calib.try_refine().is_some());
    }
}
