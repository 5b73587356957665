//! Runtime configuration, separated from CLI flag parsing so it can be
//! built directly in tests. `Args` (clap) is the only thing that knows
//! about flag names and help text; everything else takes a `TrackerConfig`.

use clap::Parser;

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Session duration in seconds; 0 means run until stop signal.
    pub duration_secs: u64,
    pub enable_gyro: bool,
    pub filter_mode: FilterMode,
    pub output_dir: String,

    /// §4.2
    pub restart_cooldown_secs: u64,
    pub max_restart_attempts: u32,
    pub accel_silence_threshold_secs: f64,
    pub gps_silence_threshold_secs: f64,

    /// §4.8
    pub raw_queue_capacity: usize,
    pub gps_inlet_capacity: usize,
    pub accel_inlet_capacity: usize,
    pub gyro_inlet_capacity: usize,

    /// §4.9
    pub trajectory_capacity: usize,
    pub covariance_capacity: usize,

    /// §4.11 / §4.12
    pub autosave_interval_secs: u64,
    pub status_interval_secs: u64,

    /// §4.5
    pub calibration_min_samples: usize,
    pub dynamic_recalibration: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    Ekf,
    Complementary,
    Both,
}

impl std::str::FromStr for FilterMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ekf" => Ok(FilterMode::Ekf),
            "complementary" => Ok(FilterMode::Complementary),
            "both" => Ok(FilterMode::Both),
            other => Err(format!("unknown filter mode: {other}")),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            duration_secs: 0,
            enable_gyro: true,
            filter_mode: FilterMode::Both,
            output_dir: "motion_tracker_sessions".to_string(),
            restart_cooldown_secs: 10,
            max_restart_attempts: 60,
            accel_silence_threshold_secs: 5.0,
            gps_silence_threshold_secs: 30.0,
            raw_queue_capacity: 100,
            gps_inlet_capacity: 50,
            accel_inlet_capacity: 100,
            gyro_inlet_capacity: 100,
            trajectory_capacity: 5000,
            covariance_capacity: 2000,
            autosave_interval_secs: 15,
            status_interval_secs: 2,
            calibration_min_samples: 50,
            dynamic_recalibration: true,
        }
    }
}

/// CLI surface (§6.4) — out of scope for behavior, in scope only for its
/// exit semantics. Kept thin on purpose.
#[derive(Parser, Debug)]
#[command(name = "motion_tracker")]
#[command(about = "Real-time GPS+IMU motion tracking engine", long_about = None)]
pub struct Args {
    #[arg(value_name = "SECONDS", default_value = "0")]
    pub duration: u64,

    #[arg(long, default_value = "true")]
    pub enable_gyro: bool,

    #[arg(long, default_value = "both")]
    pub filter: String,

    #[arg(long, default_value = "motion_tracker_sessions")]
    pub output_dir: String,
}

impl From<Args> for TrackerConfig {
    fn from(args: Args) -> Self {
        let mut cfg = TrackerConfig {
            duration_secs: args.duration,
            enable_gyro: args.enable_gyro,
            output_dir: args.output_dir,
            ..TrackerConfig::default()
        };
        if let Ok(mode) = args.filter.parse() {
            cfg.filter_mode = mode;
        }
        cfg
    }
}
