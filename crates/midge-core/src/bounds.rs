//! Divergence detection on the estimated state.

#[cfg(not(feature = "std"))]
use num_traits::Float as _;

use crate::ekf::{Ekf, STATE_DX, STATE_DY, STATE_DZ, STATE_Z};

/// Limits beyond which the estimate is considered divergent. These shouldn't
/// be hit in flight; crossing one means the filter must be reinitialized.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateBounds {
    /// Maximum plausible altitude magnitude, meters.
    pub max_position: f32,
    /// Maximum plausible body-velocity magnitude, m/s.
    pub max_velocity: f32,
}

impl Default for StateBounds {
    fn default() -> Self {
        Self {
            max_position: 100.0,
            max_velocity: 10.0,
        }
    }
}

impl StateBounds {
    /// True while the estimate is plausible.
    pub fn check(&self, ekf: &Ekf) -> bool {
        ekf.x[STATE_Z].abs() < self.max_position
            && ekf.x[STATE_DX].abs() < self.max_velocity
            && ekf.x[STATE_DY].abs() < self.max_velocity
            && ekf.x[STATE_DZ].abs() < self.max_velocity
    }
}
