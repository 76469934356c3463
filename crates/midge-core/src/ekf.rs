//! Error-state Kalman filter over altitude, body velocity and attitude.
//!
//! The Kalman state is seven-dimensional: altitude `Z`, body-frame
//! velocities `DX, DY, DZ`, and a small-angle attitude-error vector
//! `E0, E1, E2`. The full attitude quaternion is carried outside the state;
//! the gyro integrates it during prediction and [`Ekf::finalize`] folds the
//! accumulated attitude error back into it, resetting the error to zero.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

#[cfg(not(feature = "std"))]
use num_traits::Float as _;

use crate::math::{self, Matrix7, Vector7, DIM};
use crate::subsampler::SubSampler;
use crate::types::VehicleState;

// State vector layout.
pub(crate) const STATE_Z: usize = 0;
pub(crate) const STATE_DX: usize = 1;
pub(crate) const STATE_DY: usize = 2;
pub(crate) const STATE_DZ: usize = 3;
pub(crate) const STATE_E0: usize = 4;
pub(crate) const STATE_E1: usize = 5;
pub(crate) const STATE_E2: usize = 6;

/// Gravity; also converts accelerometer readings from g to m/s².
pub const GRAVITY_MSS: f32 = 9.81;

pub(crate) const DEGREES_TO_RADIANS: f32 = core::f32::consts::PI / 180.0;
pub(crate) const RADIANS_TO_DEGREES: f32 = 180.0 / core::f32::consts::PI;

/// Small number epsilon, to prevent dividing by zero.
const EPS: f32 = 1e-6;

/// Per-step pull of the attitude toward upright while on the ground.
const ROLLPITCH_ZERO_REVERSION: f32 = 0.001;

// Initial standard deviations: uncertain of position, but we know we're
// stationary and roughly flat.
const STDEV_INITIAL_POSITION_Z: f32 = 1.0;
const STDEV_INITIAL_VELOCITY: f32 = 0.01;
const STDEV_INITIAL_ATTITUDE_ROLL_PITCH: f32 = 0.01;
const STDEV_INITIAL_ATTITUDE_YAW: f32 = 0.01;

// Attitude process noise, accumulated once per process-noise interval.
const MEAS_NOISE_GYRO: f32 = 0.1; // rad/s
const PROC_NOISE_ATT: f32 = 0.0;

const fn square(x: f32) -> f32 {
    x * x
}

/// Filter parameters. The defaults give a 100 Hz prediction rate and the
/// covariance bounds the filter is tuned against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EkfConfig {
    /// Interval between prediction steps, milliseconds.
    pub prediction_interval_ms: u32,
    /// Floor on the covariance diagonal.
    pub min_covariance: f32,
    /// Ceiling on every covariance entry.
    pub max_covariance: f32,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            prediction_interval_ms: 10,
            min_covariance: 1e-6,
            max_covariance: 100.0,
        }
    }
}

/// The estimator core. Owns the covariance, the Kalman state, the attitude
/// quaternion and the IMU accumulators; every operation recovers its errors
/// locally, so none of them can fail.
pub struct Ekf {
    config: EkfConfig,

    pub(crate) p: Matrix7,
    pub(crate) x: Vector7,

    quat: UnitQuaternion<f32>,
    /// Body z axis expressed in the world frame (third row of the
    /// body-to-world rotation). Refreshed from the quaternion at finalize.
    pub(crate) r: Vector3<f32>,

    pub(crate) gyro_sub: SubSampler,
    pub(crate) accel_sub: SubSampler,
    /// Latest raw gyro sample, degrees/second. Feeds the flow model and the
    /// angular rates of the vehicle-state record.
    pub(crate) gyro_latest: Vector3<f32>,

    is_flying: bool,
    is_updated: bool,

    last_prediction_ms: u32,
    last_process_noise_ms: u32,
    next_prediction_ms: u32,
}

impl Ekf {
    pub fn new(config: EkfConfig, now_ms: u32) -> Self {
        let mut ekf = Self {
            config,
            p: [[0.0; DIM]; DIM],
            x: [0.0; DIM],
            quat: UnitQuaternion::identity(),
            r: Vector3::new(0.0, 0.0, 1.0),
            gyro_sub: SubSampler::new(),
            accel_sub: SubSampler::new(),
            gyro_latest: Vector3::zeros(),
            is_flying: false,
            is_updated: false,
            last_prediction_ms: now_ms,
            last_process_noise_ms: now_ms,
            next_prediction_ms: now_ms,
        };
        ekf.initialize(now_ms);
        ekf
    }

    /// Reset to the startup state: level attitude, zero state, diagonal
    /// covariance.
    pub fn initialize(&mut self, now_ms: u32) {
        self.p = [[0.0; DIM]; DIM];
        self.p[STATE_Z][STATE_Z] = square(STDEV_INITIAL_POSITION_Z);
        self.p[STATE_DX][STATE_DX] = square(STDEV_INITIAL_VELOCITY);
        self.p[STATE_DY][STATE_DY] = square(STDEV_INITIAL_VELOCITY);
        self.p[STATE_DZ][STATE_DZ] = square(STDEV_INITIAL_VELOCITY);
        self.p[STATE_E0][STATE_E0] = square(STDEV_INITIAL_ATTITUDE_ROLL_PITCH);
        self.p[STATE_E1][STATE_E1] = square(STDEV_INITIAL_ATTITUDE_ROLL_PITCH);
        self.p[STATE_E2][STATE_E2] = square(STDEV_INITIAL_ATTITUDE_YAW);

        self.x = [0.0; DIM];
        self.quat = UnitQuaternion::identity();
        self.r = Vector3::new(0.0, 0.0, 1.0);

        self.gyro_sub = SubSampler::new();
        self.accel_sub = SubSampler::new();
        self.gyro_latest = Vector3::zeros();

        self.is_flying = false;
        self.is_updated = false;

        self.last_prediction_ms = now_ms;
        self.last_process_noise_ms = now_ms;
        self.next_prediction_ms = now_ms;
    }

    /// Told by the safety module; gates the accelerometer's role in the
    /// process model and the upright reversion.
    pub fn set_flying(&mut self, is_flying: bool) {
        self.is_flying = is_flying;
    }

    /// Run the process model if the prediction deadline has passed, advancing
    /// the deadline by the prediction interval. Returns whether the
    /// propagation actually executed.
    pub fn predict(&mut self, now_ms: u32) -> bool {
        if now_ms < self.next_prediction_ms {
            return false;
        }
        self.next_prediction_ms = now_ms + self.config.prediction_interval_ms;

        self.is_updated = true;

        let gyro = self.gyro_sub.take_mean(DEGREES_TO_RADIANS); // rad/s
        let accel = self.accel_sub.take_mean(GRAVITY_MSS); // m/s²

        let dt = (now_ms - self.last_prediction_ms) as f32 / 1000.0;
        let dt2 = dt * dt;

        // While airborne the lateral accelerometer channels measure thrust,
        // not motion, and are useless to the process model.
        let (ax, ay) = if self.is_flying {
            (0.0, 0.0)
        } else {
            (accel.x, accel.y)
        };
        let az = accel.z;

        // Displacement over the step in the body frame; rotated into the
        // altitude update below.
        let dx_b = self.x[STATE_DX] * dt + ax * dt2 / 2.0;
        let dy_b = self.x[STATE_DY] * dt + ay * dt2 / 2.0;
        let dz_b = self.x[STATE_DZ] * dt + az * dt2 / 2.0;

        // Coriolis cross terms use the pre-update velocities.
        let (vx, vy, vz) = (self.x[STATE_DX], self.x[STATE_DY], self.x[STATE_DZ]);

        let z_new = self.x[STATE_Z] + self.r.x * dx_b + self.r.y * dy_b + self.r.z * dz_b
            - GRAVITY_MSS * dt2 / 2.0;

        // Body velocity: accelerometer, minus gyro cross velocity, minus
        // gravity in the body frame.
        let dx_new = vx + dt * (ax + gyro.z * vy - gyro.y * vz - GRAVITY_MSS * self.r.x);
        let dy_new = vy + dt * (ay - gyro.z * vx + gyro.x * vz - GRAVITY_MSS * self.r.y);
        let dz_new = vz + dt * (az + gyro.y * vx - gyro.x * vy - GRAVITY_MSS * self.r.z);

        let quat_new = self.rotate_quat(gyro * dt, !self.is_flying);

        let mut f = [[0.0; DIM]; DIM];

        // altitude from body-frame velocity
        f[STATE_Z][STATE_DX] = self.r.x * dt;
        f[STATE_Z][STATE_DY] = self.r.y * dt;
        f[STATE_Z][STATE_DZ] = self.r.z * dt;

        // altitude from attitude error
        f[STATE_Z][STATE_E0] = (dy_new * self.r.z - dz_new * self.r.y) * dt;
        f[STATE_Z][STATE_E1] = (-dx_new * self.r.z + dz_new * self.r.x) * dt;
        f[STATE_Z][STATE_E2] = (dx_new * self.r.y - dy_new * self.r.x) * dt;

        // body-frame velocity from body-frame velocity; drag negligible
        f[STATE_DX][STATE_DX] = 1.0;
        f[STATE_DY][STATE_DX] = -gyro.z * dt;
        f[STATE_DZ][STATE_DX] = gyro.y * dt;

        f[STATE_DX][STATE_DY] = gyro.z * dt;
        f[STATE_DY][STATE_DY] = 1.0;
        f[STATE_DZ][STATE_DY] = gyro.x * dt;

        f[STATE_DX][STATE_DZ] = gyro.y * dt;
        f[STATE_DY][STATE_DZ] = gyro.x * dt;
        f[STATE_DZ][STATE_DZ] = 1.0;

        // body-frame velocity from attitude error
        f[STATE_DY][STATE_E0] = -GRAVITY_MSS * self.r.z * dt;
        f[STATE_DZ][STATE_E0] = GRAVITY_MSS * self.r.y * dt;

        f[STATE_DX][STATE_E1] = GRAVITY_MSS * self.r.z * dt;
        f[STATE_DZ][STATE_E1] = -GRAVITY_MSS * self.r.x * dt;

        f[STATE_DX][STATE_E2] = -GRAVITY_MSS * self.r.y * dt;
        f[STATE_DY][STATE_E2] = GRAVITY_MSS * self.r.x * dt;

        // attitude error from attitude error: second-order small-angle
        // exponential of the gyro increment
        fill_attitude_block(
            &mut f,
            gyro.x * dt / 2.0,
            gyro.y * dt / 2.0,
            gyro.z * dt / 2.0,
        );

        self.multiply_covariance(&f);

        if now_ms > self.last_process_noise_ms {
            let noise_dt = (now_ms - self.last_process_noise_ms) as f32 / 1000.0;
            let att_noise = square(MEAS_NOISE_GYRO * noise_dt + PROC_NOISE_ATT);
            self.p[STATE_E0][STATE_E0] += att_noise;
            self.p[STATE_E1][STATE_E1] += att_noise;
            self.p[STATE_E2][STATE_E2] += att_noise;
            self.last_process_noise_ms = now_ms;
        }

        self.cleanup_covariance();

        self.x[STATE_Z] = z_new;
        self.x[STATE_DX] = dx_new;
        self.x[STATE_DY] = dy_new;
        self.x[STATE_DZ] = dz_new;
        self.quat = quat_new;

        self.last_prediction_ms = now_ms;

        true
    }

    /// Apply one scalar measurement: observation vector `h`, innovation
    /// (measured minus predicted) and measurement noise standard deviation.
    pub fn update(&mut self, h: &Vector7, innovation: f32, std_meas_noise: f32) {
        // ====== INNOVATION COVARIANCE ======
        let mut ph = [0.0; DIM];
        math::mat_vec(&self.p, h, &mut ph);
        let r = std_meas_noise * std_meas_noise;
        let hphr = r + math::dot(h, &ph); // HPH' + R

        // Kalman gain as a column vector: PH' (HPH' + R)^-1
        let mut gain = [0.0; DIM];
        for i in 0..DIM {
            gain[i] = ph[i] / hphr;
        }

        for i in 0..DIM {
            self.x[i] += gain[i] * innovation;
        }

        // ====== COVARIANCE UPDATE ======
        // Joseph form: (GH - I) P (GH - I)' plus the measurement variance,
        // added on the upper triangle and mirrored by the cleanup pass.
        let mut gh = [[0.0; DIM]; DIM];
        math::outer(&gain, h, &mut gh);
        for i in 0..DIM {
            gh[i][i] -= 1.0;
        }
        self.multiply_covariance(&gh);

        for i in 0..DIM {
            for j in i..DIM {
                self.p[i][j] += r * gain[i] * gain[j];
            }
        }

        self.cleanup_covariance();

        self.is_updated = true;
    }

    /// Fold the attitude-error substate into the attitude quaternion and
    /// zero it. Runs once per driver tick, after all measurement updates.
    pub fn finalize(&mut self) {
        if !self.is_updated {
            return;
        }

        let v = Vector3::new(self.x[STATE_E0], self.x[STATE_E1], self.x[STATE_E2]);

        // Move the attitude error into the attitude if any component is
        // large enough, but not so large that the small-angle approximation
        // stops holding.
        let is_error_sufficient = (is_error_large(v.x)
            || is_error_large(v.y)
            || is_error_large(v.z))
            && is_error_in_bounds(v.x)
            && is_error_in_bounds(v.y)
            && is_error_in_bounds(v.z);

        if is_error_sufficient {
            self.quat = self.rotate_quat(v, false);

            // Rotate the covariance into the post-reset error frame.
            let mut a = [[0.0; DIM]; DIM];
            a[STATE_Z][STATE_Z] = 1.0;
            a[STATE_DX][STATE_DX] = 1.0;
            a[STATE_DY][STATE_DY] = 1.0;
            a[STATE_DZ][STATE_DZ] = 1.0;
            fill_attitude_block(&mut a, v.x / 2.0, v.y / 2.0, v.z / 2.0);
            self.multiply_covariance(&a);
            self.cleanup_covariance();
        }

        self.x[STATE_E0] = 0.0;
        self.x[STATE_E1] = 0.0;
        self.x[STATE_E2] = 0.0;

        // Refresh the body z axis in the world frame.
        let (qw, qx, qy, qz) = (self.quat.w, self.quat.i, self.quat.j, self.quat.k);
        self.r = Vector3::new(
            2.0 * (qx * qz - qw * qy),
            2.0 * (qy * qz + qw * qx),
            qw * qw - qx * qx - qy * qy + qz * qz,
        );

        self.is_updated = false;
    }

    /// Vehicle-state record for the flight controller. Horizontal position
    /// is not estimated and reads zero; angles come out in degrees with
    /// pitch negated into the ENU convention.
    pub fn vehicle_state(&self) -> VehicleState {
        let (qw, qx, qy, qz) = (self.quat.w, self.quat.i, self.quat.j, self.quat.k);

        let phi = RADIANS_TO_DEGREES
            * (2.0 * (qy * qz + qw * qx)).atan2(qw * qw - qx * qx - qy * qy + qz * qz);
        let theta = -RADIANS_TO_DEGREES * ((-2.0) * (qx * qz - qw * qy)).asin();
        let psi = RADIANS_TO_DEGREES
            * (2.0 * (qx * qy + qw * qz)).atan2(qw * qw + qx * qx - qy * qy - qz * qz);

        VehicleState {
            x: 0.0,
            y: 0.0,
            z: self.x[STATE_Z],
            dx: self.x[STATE_DX],
            dy: self.x[STATE_DY],
            dz: self.r.x * self.x[STATE_DX]
                + self.r.y * self.x[STATE_DY]
                + self.r.z * self.x[STATE_DZ],
            phi,
            theta,
            psi,
            // Angular rates straight from the gyro, pitch rate negated for ENU.
            dphi: self.gyro_latest.x,
            dtheta: -self.gyro_latest.y,
            dpsi: self.gyro_latest.z,
        }
    }

    /// Full covariance matrix.
    pub fn covariance(&self) -> &Matrix7 {
        &self.p
    }

    /// Current attitude estimate.
    pub fn quaternion(&self) -> &UnitQuaternion<f32> {
        &self.quat
    }

    /// Attitude-error substate; exactly zero after every finalize.
    pub fn attitude_error(&self) -> Vector3<f32> {
        Vector3::new(self.x[STATE_E0], self.x[STATE_E1], self.x[STATE_E2])
    }

    /// Right-multiply the attitude by the rotation for the axis-angle
    /// increment `theta`, optionally bleeding roll and pitch back toward
    /// upright (used while the vehicle sits on the ground).
    fn rotate_quat(&self, theta: Vector3<f32>, revert: bool) -> UnitQuaternion<f32> {
        let angle = theta.norm() + EPS;
        let half = angle / 2.0;
        let (sa, ca) = (half.sin(), half.cos());
        let dq = Quaternion::new(
            ca,
            sa * theta.x / angle,
            sa * theta.y / angle,
            sa * theta.z / angle,
        );

        let mut q = self.quat.into_inner() * dq;
        if revert {
            let keep = 1.0 - ROLLPITCH_ZERO_REVERSION;
            q.w = q.w * keep + ROLLPITCH_ZERO_REVERSION;
            q.i *= keep;
            q.j *= keep;
            q.k *= keep;
        }
        UnitQuaternion::new_normalize(q)
    }

    /// P ← A · P · Aᵀ
    fn multiply_covariance(&mut self, a: &Matrix7) {
        let mut at = [[0.0; DIM]; DIM];
        math::transpose(a, &mut at);
        let mut ap = [[0.0; DIM]; DIM];
        math::mat_mul(a, &self.p, &mut ap);
        math::mat_mul(&ap, &at, &mut self.p);
    }

    /// Enforce symmetry of the covariance matrix, and ensure the values stay
    /// bounded. NaNs collapse to the ceiling.
    fn cleanup_covariance(&mut self) {
        for i in 0..DIM {
            for j in i..DIM {
                let pval = (self.p[i][j] + self.p[j][i]) / 2.0;
                let bounded = if pval.is_nan() || pval > self.config.max_covariance {
                    self.config.max_covariance
                } else if i == j && pval < self.config.min_covariance {
                    self.config.min_covariance
                } else {
                    pval
                };
                self.p[i][j] = bounded;
                self.p[j][i] = bounded;
            }
        }
    }
}

/// Second-order small-angle rotation block shared by the process Jacobian
/// (ek = ωk·dt/2) and the finalize rotation (ek = vk/2).
fn fill_attitude_block(m: &mut Matrix7, e0: f32, e1: f32, e2: f32) {
    m[STATE_E0][STATE_E0] = 1.0 - e1 * e1 / 2.0 - e2 * e2 / 2.0;
    m[STATE_E0][STATE_E1] = e2 + e0 * e1 / 2.0;
    m[STATE_E0][STATE_E2] = -e1 + e0 * e2 / 2.0;

    m[STATE_E1][STATE_E0] = -e2 + e0 * e1 / 2.0;
    m[STATE_E1][STATE_E1] = 1.0 - e0 * e0 / 2.0 - e2 * e2 / 2.0;
    m[STATE_E1][STATE_E2] = e0 + e1 * e2 / 2.0;

    m[STATE_E2][STATE_E0] = e1 + e0 * e2 / 2.0;
    m[STATE_E2][STATE_E1] = -e0 + e1 * e2 / 2.0;
    m[STATE_E2][STATE_E2] = 1.0 - e0 * e0 / 2.0 - e1 * e1 / 2.0;
}

fn is_error_large(v: f32) -> bool {
    v.abs() > 0.1e-3
}

fn is_error_in_bounds(v: f32) -> bool {
    v.abs() < 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn initialize_sets_the_documented_diagonal() {
        let ekf = Ekf::new(EkfConfig::default(), 0);
        let p = ekf.covariance();
        assert_eq!(p[STATE_Z][STATE_Z], 1.0);
        assert_relative_eq!(p[STATE_DX][STATE_DX], 1e-4, epsilon = 1e-10);
        assert_relative_eq!(p[STATE_E2][STATE_E2], 1e-4, epsilon = 1e-10);
        for i in 0..DIM {
            for j in 0..DIM {
                if i != j {
                    assert_eq!(p[i][j], 0.0);
                }
            }
        }
        assert_eq!(ekf.r, Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(*ekf.quaternion(), UnitQuaternion::identity());
    }

    #[test]
    fn predict_waits_for_the_deadline() {
        let mut ekf = Ekf::new(EkfConfig::default(), 0);
        // The first deadline is immediate; the next one is a full interval out.
        assert!(ekf.predict(5));
        for now in 6..15 {
            assert!(!ekf.predict(now));
        }
        assert!(ekf.predict(15));
        assert!(!ekf.predict(16));
        assert!(ekf.predict(25));
    }

    #[test]
    fn cleanup_clamps_and_symmetrizes() {
        let mut ekf = Ekf::new(EkfConfig::default(), 0);
        ekf.p[0][1] = 4.0;
        ekf.p[1][0] = 2.0;
        ekf.p[2][2] = 1e-9;
        ekf.p[3][3] = 1e6;
        ekf.p[4][5] = f32::NAN;
        ekf.cleanup_covariance();
        assert_eq!(ekf.p[0][1], 3.0);
        assert_eq!(ekf.p[1][0], 3.0);
        assert_eq!(ekf.p[2][2], 1e-6);
        assert_eq!(ekf.p[3][3], 100.0);
        assert_eq!(ekf.p[4][5], 100.0);
        assert_eq!(ekf.p[5][4], 100.0);
    }

    #[test]
    fn scalar_update_moves_the_observed_state() {
        let mut ekf = Ekf::new(EkfConfig::default(), 0);
        let mut h = [0.0; DIM];
        h[STATE_Z] = 1.0;
        ekf.update(&h, 1.0, 0.1);
        // Gain for a diagonal P with p_zz = 1 and r = 0.01 is ~0.99.
        assert_relative_eq!(ekf.x[STATE_Z], 1.0 / 1.01, epsilon = 1e-5);
        assert_eq!(ekf.x[STATE_DX], 0.0);
        // Covariance on the observed axis shrinks.
        assert!(ekf.p[STATE_Z][STATE_Z] < 1.0);
    }

    #[test]
    fn finalize_zeroes_attitude_error_and_refreshes_r() {
        let mut ekf = Ekf::new(EkfConfig::default(), 0);
        let mut h = [0.0; DIM];
        h[STATE_E0] = 1.0;
        ekf.update(&h, 0.2, 0.1);
        assert!(ekf.attitude_error().x != 0.0);

        ekf.finalize();
        assert_eq!(ekf.attitude_error(), Vector3::zeros());
        // A positive roll error tips the body z axis toward +y.
        assert!(ekf.r.y > 0.0);
        assert_relative_eq!(ekf.r.norm(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn finalize_without_updates_is_a_noop() {
        let mut ekf = Ekf::new(EkfConfig::default(), 0);
        let p_before = *ekf.covariance();
        let q_before = *ekf.quaternion();
        ekf.finalize();
        assert_eq!(p_before, *ekf.covariance());
        assert_eq!(q_before, *ekf.quaternion());
    }

    #[test]
    fn ground_reversion_pulls_attitude_upright() {
        let mut ekf = Ekf::new(EkfConfig::default(), 0);
        // Tip the attitude over, then predict on the ground with a silent gyro.
        ekf.quat = UnitQuaternion::from_euler_angles(0.3, 0.0, 0.0);
        let mut now = 0;
        for _ in 0..8000 {
            now += 10;
            ekf.predict(now);
            ekf.finalize();
        }
        let (roll, _, _) = ekf.quaternion().euler_angles();
        assert!(roll.abs() < 0.02, "roll still {roll}");
    }
}
