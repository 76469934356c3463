//! Truth profile and noisy sensor-stream generation.

use midge_core::{FlowMeasurement, Measurement, RangeMeasurement};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const GRAVITY_MSS: f64 = 9.81;

/// Flight and sensor configuration for one synthetic run.
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    /// Total run length, seconds.
    pub duration_s: f64,
    /// Hover altitude reached after the climb, meters.
    pub climb_altitude_m: f64,

    pub imu_rate_hz: u32,
    pub flow_rate_hz: u32,
    pub range_rate_hz: u32,

    /// Multiplier on every noise standard deviation below.
    pub noise_scale: f64,
    pub gyro_noise_std: f64,  // deg/s
    pub accel_noise_std: f64, // g
    pub flow_noise_std: f64,  // raw sensor counts
    pub range_noise_std: f64, // mm

    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            duration_s: 5.0,
            climb_altitude_m: 1.0,
            imu_rate_hz: 1000,
            flow_rate_hz: 100,
            range_rate_hz: 40,
            noise_scale: 1.0,
            gyro_noise_std: 0.1,
            accel_noise_std: 0.002,
            flow_noise_std: 0.5,
            range_noise_std: 5.0,
            seed: 42,
        }
    }
}

/// Truth sample recorded every ten milliseconds, aligned with the estimate
/// trace.
#[derive(Clone, Copy, Debug)]
pub struct TruthSample {
    pub t_ms: u32,
    pub altitude_m: f64,
    pub climb_rate_ms: f64,
}

/// One generated run: timestamped measurements in enqueue order, plus the
/// truth they were derived from.
pub struct SensorTimeline {
    pub duration_ms: u32,
    /// When the safety module flips `isFlying`.
    pub takeoff_ms: u32,
    pub events: Vec<(u32, Measurement)>,
    pub truth: Vec<TruthSample>,
}

// The vehicle sits on the ground for a second, then rises to the hover
// altitude along a half-cosine over one second.
const GROUND_TIME_S: f64 = 1.0;
const CLIMB_TIME_S: f64 = 1.0;

fn altitude(cfg: &ScenarioConfig, t: f64) -> f64 {
    let s = ((t - GROUND_TIME_S) / CLIMB_TIME_S).clamp(0.0, 1.0);
    cfg.climb_altitude_m * (1.0 - (core::f64::consts::PI * s).cos()) / 2.0
}

fn climb_rate(cfg: &ScenarioConfig, t: f64) -> f64 {
    let s = (t - GROUND_TIME_S) / CLIMB_TIME_S;
    if !(0.0..=1.0).contains(&s) {
        return 0.0;
    }
    cfg.climb_altitude_m * core::f64::consts::PI / (2.0 * CLIMB_TIME_S)
        * (core::f64::consts::PI * s).sin()
}

fn climb_accel(cfg: &ScenarioConfig, t: f64) -> f64 {
    let s = (t - GROUND_TIME_S) / CLIMB_TIME_S;
    if !(0.0..=1.0).contains(&s) {
        return 0.0;
    }
    cfg.climb_altitude_m * core::f64::consts::PI * core::f64::consts::PI
        / (2.0 * CLIMB_TIME_S * CLIMB_TIME_S)
        * (core::f64::consts::PI * s).cos()
}

/// Generate the measurement stream and truth trace for one run.
///
/// The flight stays level, so the gyro and flow channels carry pure noise
/// while the accelerometer and range finder see the climb.
pub fn generate_timeline(cfg: &ScenarioConfig) -> SensorTimeline {
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let d_gyro = Normal::new(0.0, cfg.noise_scale * cfg.gyro_noise_std).unwrap();
    let d_accel = Normal::new(0.0, cfg.noise_scale * cfg.accel_noise_std).unwrap();
    let d_flow = Normal::new(0.0, cfg.noise_scale * cfg.flow_noise_std).unwrap();
    let d_range = Normal::new(0.0, cfg.noise_scale * cfg.range_noise_std).unwrap();

    let duration_ms = (cfg.duration_s * 1000.0) as u32;
    let imu_period = (1000 / cfg.imu_rate_hz).max(1);
    let flow_period = (1000 / cfg.flow_rate_hz).max(1);
    let range_period = (1000 / cfg.range_rate_hz).max(1);

    let mut events = Vec::new();
    let mut truth = Vec::new();

    for now in 1..=duration_ms {
        let t = now as f64 / 1000.0;

        if now % imu_period == 0 {
            let gyro = Vector3::new(
                d_gyro.sample(&mut rng) as f32,
                d_gyro.sample(&mut rng) as f32,
                d_gyro.sample(&mut rng) as f32,
            );
            events.push((now, Measurement::Gyroscope(gyro)));

            // Specific force while level: 1 g plus the climb acceleration.
            let az = 1.0 + climb_accel(cfg, t) / GRAVITY_MSS;
            let accel = Vector3::new(
                d_accel.sample(&mut rng) as f32,
                d_accel.sample(&mut rng) as f32,
                (az + d_accel.sample(&mut rng)) as f32,
            );
            events.push((now, Measurement::Accelerometer(accel)));
        }

        if now % flow_period == 0 {
            events.push((
                now,
                Measurement::Flow(FlowMeasurement {
                    dt: flow_period as f32 / 1000.0,
                    dpixel_x: d_flow.sample(&mut rng) as f32,
                    dpixel_y: d_flow.sample(&mut rng) as f32,
                }),
            ));
        }

        if now % range_period == 0 {
            let mm = altitude(cfg, t) * 1000.0 + d_range.sample(&mut rng);
            events.push((
                now,
                Measurement::Range(RangeMeasurement {
                    distance_mm: mm.max(0.0) as u32,
                }),
            ));
        }

        if now % 10 == 0 {
            truth.push(TruthSample {
                t_ms: now,
                altitude_m: altitude(cfg, t),
                climb_rate_ms: climb_rate(cfg, t),
            });
        }
    }

    SensorTimeline {
        duration_ms,
        takeoff_ms: (GROUND_TIME_S * 1000.0) as u32,
        events,
        truth,
    }
}
