//! The estimator task: queue, signal, snapshot mutex and the tick loop.
//!
//! Sensor drivers (possibly in interrupt context) push typed measurements
//! into a bounded channel; the flight-control loop posts a signal whenever
//! it wants a fresh state. One tick of the estimator then runs
//! predict → update* → finalize → read, publishing the snapshot under a
//! blocking mutex that is held only for the copy.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::{info, warn};
use nalgebra::Vector3;

use crate::bounds::StateBounds;
use crate::ekf::{Ekf, EkfConfig};
use crate::fusion;
use crate::supervisor::RateSupervisor;
use crate::types::{FlowMeasurement, Measurement, RangeMeasurement, VehicleState};

/// Capacity of the measurement queue. A full queue drops the newest sample.
pub const QUEUE_LENGTH: usize = 20;

/// Minimum spacing between repeated console warnings of one kind.
const WARNING_HOLD_BACK_TIME_MS: u32 = 2000;

const RATE_EVALUATION_INTERVAL_MS: u32 = 1000;
// Allowed band around the 100 Hz prediction rate.
const RATE_EXPECTED_MIN: u32 = 99;
const RATE_EXPECTED_MAX: u32 = 101;

/// Shared face of the estimator. Producers and the flight-control loop hold
/// `&EstimatorTask`; the single [`Estimator`] owner drains it.
pub struct EstimatorTask {
    measurements: Channel<CriticalSectionRawMutex, Measurement, QUEUE_LENGTH>,
    run_signal: Signal<CriticalSectionRawMutex, ()>,
    state: Mutex<CriticalSectionRawMutex, Cell<VehicleState>>,
    is_flying: AtomicBool,
}

impl EstimatorTask {
    pub const fn new() -> Self {
        Self {
            measurements: Channel::new(),
            run_signal: Signal::new(),
            state: Mutex::new(Cell::new(VehicleState::new())),
            is_flying: AtomicBool::new(false),
        }
    }

    /// Queue a gyro sample (degrees/second, body frame). Safe from interrupt
    /// context; drops the sample when the queue is full.
    pub fn enqueue_gyro(&self, gyro: Vector3<f32>) {
        let _ = self.measurements.try_send(Measurement::Gyroscope(gyro));
    }

    /// Queue an accelerometer sample (g, body frame).
    pub fn enqueue_accel(&self, accel: Vector3<f32>) {
        let _ = self.measurements.try_send(Measurement::Accelerometer(accel));
    }

    /// Queue an optical-flow reading.
    pub fn enqueue_flow(&self, flow: FlowMeasurement) {
        let _ = self.measurements.try_send(Measurement::Flow(flow));
    }

    /// Queue a range reading.
    pub fn enqueue_range(&self, range: RangeMeasurement) {
        let _ = self.measurements.try_send(Measurement::Range(range));
    }

    /// Toggled by the safety module.
    pub fn set_flying(&self, is_flying: bool) {
        self.is_flying.store(is_flying, Ordering::Relaxed);
    }

    /// Ask the estimator to produce a fresh snapshot.
    pub fn request_state(&self) {
        self.run_signal.signal(());
    }

    /// Latest published snapshot. The lock is held only for the copy, so
    /// this returns quickly enough for the 1 kHz control loop.
    pub fn vehicle_state(&self) -> VehicleState {
        self.state.lock(|cell| cell.get())
    }
}

impl Default for EstimatorTask {
    fn default() -> Self {
        Self::new()
    }
}

/// The estimation loop itself. Owns the filter exclusively; everything it
/// shares with other tasks goes through the [`EstimatorTask`] it was built
/// around.
pub struct Estimator<'a> {
    shared: &'a EstimatorTask,
    ekf: Ekf,
    bounds: StateBounds,
    supervisor: RateSupervisor,
    reset_pending: bool,
    rate_warning_block_ms: u32,
    bounds_warning_block_ms: u32,
}

impl<'a> Estimator<'a> {
    pub fn new(shared: &'a EstimatorTask, config: EkfConfig, now_ms: u32) -> Self {
        info!("estimator: started");
        Self {
            shared,
            ekf: Ekf::new(config, now_ms),
            bounds: StateBounds::default(),
            supervisor: RateSupervisor::new(
                now_ms,
                RATE_EVALUATION_INTERVAL_MS,
                RATE_EXPECTED_MIN,
                RATE_EXPECTED_MAX,
                1,
            ),
            reset_pending: false,
            rate_warning_block_ms: 0,
            bounds_warning_block_ms: 0,
        }
    }

    /// One pass of the loop: reinitialize if the previous tick flagged
    /// divergence, predict, drain the measurement queue, fold the attitude
    /// error, police the state, publish a snapshot.
    pub fn tick(&mut self, now_ms: u32) {
        if self.reset_pending {
            info!("estimator: resetting");
            self.ekf.initialize(now_ms);
            self.reset_pending = false;
        }

        self.ekf
            .set_flying(self.shared.is_flying.load(Ordering::Relaxed));

        if self.ekf.predict(now_ms) && !self.supervisor.validate(now_ms) {
            if now_ms > self.rate_warning_block_ms {
                self.rate_warning_block_ms = now_ms + WARNING_HOLD_BACK_TIME_MS;
                warn!(
                    "estimator: Kalman prediction rate off ({})",
                    self.supervisor.latest_count()
                );
            }
        }

        // Sensor measurements come in sporadically and faster than the loop
        // frequency; consume everything queued since the previous tick.
        while let Ok(measurement) = self.shared.measurements.try_receive() {
            fusion::apply(&mut self.ekf, &measurement);
        }

        self.ekf.finalize();

        if !self.bounds.check(&self.ekf) {
            self.reset_pending = true;
            if now_ms > self.bounds_warning_block_ms {
                self.bounds_warning_block_ms = now_ms + WARNING_HOLD_BACK_TIME_MS;
                warn!("estimator: State out of bounds, resetting");
            }
        }

        let state = self.ekf.vehicle_state();
        self.shared.state.lock(|cell| cell.set(state));
    }

    /// Run forever, one tick per state request.
    pub async fn run(mut self, mut now_ms: impl FnMut() -> u32) -> ! {
        loop {
            self.shared.run_signal.wait().await;
            self.tick(now_ms());
        }
    }

    /// Read-only access to the filter, for harnesses and tests.
    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }
}
