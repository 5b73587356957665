//! Real-time GPS+IMU motion tracking engine: sensor sources feed a
//! non-blocking dispatcher which fans samples out to three independent
//! motion filters, an incident detector, and a bounded-memory trajectory
//! store; a liveness supervisor restarts dead sensor sources and a status
//! writer publishes progress for external consumers.

pub mod calibration;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod incident;
pub mod live_status;
pub mod liveness;
pub mod metrics;
pub mod persistence;
pub mod sensor_source;
pub mod smoothing;
pub mod trajectory;
pub mod types;
