//! Replay harness: pushes a generated timeline through the estimator task.

use midge_core::{EkfConfig, Estimator, EstimatorTask, Measurement, VehicleState};

use crate::sensor::SensorTimeline;

/// Estimate trace recorded every ten milliseconds, with the truth it should
/// be tracking.
pub struct EstimateTrace {
    pub time_s: Vec<f64>,
    pub estimate: Vec<VehicleState>,
    pub truth_z: Vec<f64>,
    pub truth_dz: Vec<f64>,
}

impl EstimateTrace {
    /// Root-mean-square altitude error against truth, over the whole trace.
    pub fn altitude_rmse(&self) -> f64 {
        let n = self.estimate.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .estimate
            .iter()
            .zip(&self.truth_z)
            .map(|(est, truth)| {
                let err = est.z as f64 - truth;
                err * err
            })
            .sum();
        (sum / n as f64).sqrt()
    }
}

/// Run a generated timeline through the estimator: one tick per millisecond,
/// measurements enqueued at their recorded times, the flying flag flipped at
/// takeoff.
pub fn run_estimator(timeline: &SensorTimeline, config: EkfConfig) -> EstimateTrace {
    let task = EstimatorTask::new();
    let mut estimator = Estimator::new(&task, config, 0);

    let mut trace = EstimateTrace {
        time_s: Vec::new(),
        estimate: Vec::new(),
        truth_z: Vec::new(),
        truth_dz: Vec::new(),
    };

    let mut next_event = 0;
    let mut next_truth = 0;

    for now in 1..=timeline.duration_ms {
        if now == timeline.takeoff_ms {
            task.set_flying(true);
        }

        while next_event < timeline.events.len() && timeline.events[next_event].0 <= now {
            match timeline.events[next_event].1 {
                Measurement::Gyroscope(gyro) => task.enqueue_gyro(gyro),
                Measurement::Accelerometer(accel) => task.enqueue_accel(accel),
                Measurement::Flow(flow) => task.enqueue_flow(flow),
                Measurement::Range(range) => task.enqueue_range(range),
            }
            next_event += 1;
        }

        estimator.tick(now);

        if next_truth < timeline.truth.len() && timeline.truth[next_truth].t_ms == now {
            let sample = &timeline.truth[next_truth];
            trace.time_s.push(now as f64 / 1000.0);
            trace.estimate.push(task.vehicle_state());
            trace.truth_z.push(sample.altitude_m);
            trace.truth_dz.push(sample.climb_rate_ms);
            next_truth += 1;
        }
    }

    trace
}
