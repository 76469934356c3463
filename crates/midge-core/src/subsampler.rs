//! IMU sub-sampling between prediction steps.

use nalgebra::Vector3;

/// Accumulates raw three-axis samples and hands out unit-converted means.
///
/// The prediction step runs an order of magnitude slower than the IMU, so
/// samples are summed as they arrive and averaged when consumed. When no
/// sample arrived in the interval the previous mean is kept.
#[derive(Clone, Copy, Debug)]
pub struct SubSampler {
    sum: Vector3<f32>,
    count: u32,
    mean: Vector3<f32>,
}

impl SubSampler {
    pub fn new() -> Self {
        Self {
            sum: Vector3::zeros(),
            count: 0,
            mean: Vector3::zeros(),
        }
    }

    /// Add one raw sample.
    pub fn accumulate(&mut self, sample: Vector3<f32>) {
        self.sum += sample;
        self.count += 1;
    }

    /// Mean of the accumulated samples scaled by `conversion_factor`,
    /// clearing the accumulator. An empty accumulator keeps the previous
    /// mean.
    pub fn take_mean(&mut self, conversion_factor: f32) -> Vector3<f32> {
        if self.count > 0 {
            self.mean = self.sum * (conversion_factor / self.count as f32);
            self.sum = Vector3::zeros();
            self.count = 0;
        }
        self.mean
    }
}

impl Default for SubSampler {
    fn default() -> Self {
        Self::new()
    }
}
