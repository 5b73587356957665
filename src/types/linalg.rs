//! Linear algebra type aliases for the 13-state primary filter.

use nalgebra::{SMatrix, SVector};

pub const STATE_DIM_13: usize = 13;

pub type StateVec13 = SVector<f64, STATE_DIM_13>;
pub type StateMat13 = SMatrix<f64, STATE_DIM_13, STATE_DIM_13>;
