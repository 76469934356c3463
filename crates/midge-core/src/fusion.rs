//! Sensor-fusion layer: maps typed measurements onto scalar EKF updates.
//!
//! Gyro and accelerometer samples never reach the update path; they feed the
//! sub-samplers and are consumed as means inside the prediction step. Flow
//! and range carry real information about the state and each become one or
//! two scalar updates with their own observation vector and noise model.

use nalgebra::Vector3;

#[cfg(not(feature = "std"))]
use num_traits::Float as _;

use crate::ekf::{Ekf, DEGREES_TO_RADIANS, STATE_DX, STATE_DY, STATE_Z};
use crate::math::DIM;
use crate::types::{FlowMeasurement, Measurement, RangeMeasurement};

/// Range readings at or above this are implausible and dropped outright.
pub const RANGEFINDER_OUTLIER_LIMIT_MM: u32 = 5000;

// Rangefinder measurement noise model: flat near the ground, exponential
// growth between the two calibration points.
const RANGEFINDER_EXP_POINT_A: f32 = 2.5;
const RANGEFINDER_EXP_STD_A: f32 = 0.0025;
const RANGEFINDER_EXP_POINT_B: f32 = 4.0;
const RANGEFINDER_EXP_STD_B: f32 = 0.2;

/// Half the range sensor's cone aperture, degrees.
const RANGEFINDER_CONE_HALF_ANGLE_DEG: f32 = 15.0 / 2.0;

/// Pixel count across the flow sensor aperture (same in x and y).
const FLOW_NPIX: f32 = 35.0;

/// Ground length subtended by the 42° aperture: 2·sin(21°).
const FLOW_THETAPIX: f32 = 0.71674;

/// The sensor reports ten counts per motion pixel.
const FLOW_RESOLUTION: f32 = 0.1;

const FLOW_STD_FIXED: f32 = 2.0;

/// Dispatch one queued measurement to the matching fusion path.
pub fn apply(ekf: &mut Ekf, measurement: &Measurement) {
    match *measurement {
        Measurement::Gyroscope(gyro) => update_with_gyro(ekf, gyro),
        Measurement::Accelerometer(accel) => update_with_accel(ekf, accel),
        Measurement::Flow(flow) => update_with_flow(ekf, &flow),
        Measurement::Range(range) => {
            update_with_range(ekf, &range);
        }
    }
}

/// Accumulate a gyro sample (degrees/second) and remember it as the latest
/// body rate.
pub fn update_with_gyro(ekf: &mut Ekf, gyro: Vector3<f32>) {
    ekf.gyro_sub.accumulate(gyro);
    ekf.gyro_latest = gyro;
}

/// Accumulate an accelerometer sample (g).
pub fn update_with_accel(ekf: &mut Ekf, accel: Vector3<f32>) {
    ekf.accel_sub.accumulate(accel);
}

/// Fuse a downward range reading. Returns whether the update was applied;
/// outliers and ill-conditioned geometry (sensor pointing sideways) are
/// skipped silently.
pub fn update_with_range(ekf: &mut Ekf, range: &RangeMeasurement) -> bool {
    // h → ∞ as the body z axis leaves the vertical.
    if ekf.r.z <= 0.1 || range.distance_mm >= RANGEFINDER_OUTLIER_LIMIT_MM {
        return false;
    }

    // Tilt of the measurement cone past its own aperture.
    let angle = (ekf.r.z.acos().abs() - DEGREES_TO_RADIANS * RANGEFINDER_CONE_HALF_ANGLE_DEG)
        .max(0.0);

    // The sensor reports the slant distance z / cos(α), so the observation
    // of Z is scaled by 1 / cos(α).
    let predicted_distance = ekf.x[STATE_Z] / angle.cos();
    let measured_distance = range.distance_mm as f32 / 1000.0; // mm => m

    let coeff = (RANGEFINDER_EXP_STD_B / RANGEFINDER_EXP_STD_A).ln()
        / (RANGEFINDER_EXP_POINT_B - RANGEFINDER_EXP_POINT_A);
    let std_dev = RANGEFINDER_EXP_STD_A
        * (1.0 + (coeff * (measured_distance - RANGEFINDER_EXP_POINT_A)).exp());

    let mut h = [0.0; DIM];
    h[STATE_Z] = 1.0 / angle.cos();

    ekf.update(&h, measured_distance - predicted_distance, std_dev);
    true
}

/// Fuse an optical-flow reading as two scalar updates, one per axis.
pub fn update_with_flow(ekf: &mut Ekf, flow: &FlowMeasurement) {
    // Body rates from the latest gyro sample.
    let omega_x = ekf.gyro_latest.x * DEGREES_TO_RADIANS;
    let omega_y = ekf.gyro_latest.y * DEGREES_TO_RADIANS;

    let dx_g = ekf.x[STATE_DX];
    let dy_g = ekf.x[STATE_DY];
    let rz = ekf.r.z;

    // Saturate elevation in prediction and correction to avoid the
    // singularity at touchdown.
    let z_g = if ekf.x[STATE_Z] < 0.1 { 0.1 } else { ekf.x[STATE_Z] };

    let scale = flow.dt * FLOW_NPIX / FLOW_THETAPIX;

    // ~~~ X velocity prediction and update ~~~
    // Accumulated pixels are translation over altitude minus apparent
    // rotation.
    let predicted_nx = scale * (dx_g * rz / z_g - omega_y);
    let measured_nx = flow.dpixel_x * FLOW_RESOLUTION;

    let mut hx = [0.0; DIM];
    hx[STATE_Z] = scale * (rz * dx_g) / (-z_g * z_g);
    hx[STATE_DX] = scale * rz / z_g;
    ekf.update(&hx, measured_nx - predicted_nx, FLOW_STD_FIXED * FLOW_RESOLUTION);

    // ~~~ Y velocity prediction and update ~~~ (body-rate term flips sign)
    let predicted_ny = scale * (dy_g * rz / z_g + omega_x);
    let measured_ny = flow.dpixel_y * FLOW_RESOLUTION;

    let mut hy = [0.0; DIM];
    hy[STATE_Z] = scale * (rz * dy_g) / (-z_g * z_g);
    hy[STATE_DY] = scale * rz / z_g;
    ekf.update(&hy, measured_ny - predicted_ny, FLOW_STD_FIXED * FLOW_RESOLUTION);
}
