//! End-to-end scenarios for the estimator, driven the way the flight stack
//! drives it: sensor samples enqueued at their real rates, one driver tick
//! per millisecond.

use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::Vector3;

use midge_core::fusion;
use midge_core::math::DIM;
use midge_core::{Ekf, EkfConfig, Estimator, EstimatorTask, FlowMeasurement, RangeMeasurement};

const MIN_COVARIANCE: f32 = 1e-6;
const MAX_COVARIANCE: f32 = 100.0;

/// Covariance invariants that must hold after every tick: symmetry within
/// numerical tolerance and a bounded diagonal.
fn assert_covariance_sane(ekf: &Ekf) {
    let p = ekf.covariance();
    let mut max_abs: f32 = 0.0;
    for row in p.iter() {
        for &v in row.iter() {
            max_abs = max_abs.max(v.abs());
        }
    }
    for i in 0..DIM {
        assert!(
            p[i][i] >= MIN_COVARIANCE && p[i][i] <= MAX_COVARIANCE,
            "diagonal {i} out of bounds: {}",
            p[i][i]
        );
        for j in 0..DIM {
            assert!(
                (p[i][j] - p[j][i]).abs() < 1e-9 * max_abs.max(1.0),
                "asymmetry at ({i},{j})"
            );
        }
    }
}

fn assert_quaternion_normalized(ekf: &Ekf) {
    let q = ekf.quaternion();
    let norm_sq = q.w * q.w + q.i * q.i + q.j * q.j + q.k * q.k;
    assert!(
        (norm_sq - 1.0).abs() <= 1e-6,
        "quaternion norm² drifted: {norm_sq}"
    );
}

#[test]
fn stationary_imu_keeps_the_filter_quiet() {
    let task = EstimatorTask::new();
    let mut estimator = Estimator::new(&task, EkfConfig::default(), 0);

    // Perfect stationary IMU at 1 kHz: silent gyro, 1 g straight up.
    for now in 1..=5000u32 {
        task.enqueue_gyro(Vector3::zeros());
        task.enqueue_accel(Vector3::new(0.0, 0.0, 1.0));
        estimator.tick(now);

        if now % 250 == 0 {
            assert_covariance_sane(estimator.ekf());
            assert_quaternion_normalized(estimator.ekf());
            assert_eq!(estimator.ekf().attitude_error(), Vector3::zeros());
        }

        if now > 1000 {
            let state = task.vehicle_state();
            assert!(state.dx.abs() < 1e-2, "dx drifted to {} at {now}", state.dx);
            assert!(state.dy.abs() < 1e-2, "dy drifted to {} at {now}", state.dy);
            assert!(state.dz.abs() < 1e-2, "dz drifted to {} at {now}", state.dz);
            assert!(state.phi.abs() < 0.5);
            assert!(state.theta.abs() < 0.5);
        }
    }

    // Grounded and fed a clean 1 g, the attitude stays pinned upright.
    let q = estimator.ekf().quaternion();
    assert!(q.w > 0.99999);
    assert!(q.i.abs() < 1e-3 && q.j.abs() < 1e-3 && q.k.abs() < 1e-3);
}

#[test]
fn yaw_rate_integrates_to_ninety_degrees() {
    let task = EstimatorTask::new();
    let mut estimator = Estimator::new(&task, EkfConfig::default(), 0);
    task.set_flying(true);

    // 90 deg/s about body z for one second, hovering accelerometer signal so
    // the vertical channel stays balanced.
    for now in 1..=1005u32 {
        task.enqueue_gyro(Vector3::new(0.0, 0.0, 90.0));
        task.enqueue_accel(Vector3::new(0.0, 0.0, 1.0));
        estimator.tick(now);
    }

    let state = task.vehicle_state();
    assert!((state.psi - 90.0).abs() < 1.0, "psi = {}", state.psi);
    assert!(state.phi.abs() < 0.5, "phi = {}", state.phi);
    assert!(state.theta.abs() < 0.5, "theta = {}", state.theta);
    assert!(state.z.abs() < 0.05, "z = {}", state.z);
    assert_eq!(state.dpsi, 90.0);
}

#[test]
fn range_only_fusion_converges_to_the_measured_altitude() {
    let mut ekf = Ekf::new(EkfConfig::default(), 0);

    for _ in 0..50 {
        fusion::update_with_range(&mut ekf, &RangeMeasurement { distance_mm: 1000 });
        ekf.finalize();
    }

    let z = ekf.vehicle_state().z;
    assert!((z - 1.0).abs() < 0.05, "z = {z}");
    assert_covariance_sane(&ekf);
}

#[test]
fn flow_pixels_pull_forward_velocity_up() {
    let mut ekf = Ekf::new(EkfConfig::default(), 0);

    // Establish one meter of altitude first.
    for _ in 0..10 {
        fusion::update_with_range(&mut ekf, &RangeMeasurement { distance_mm: 1000 });
    }

    // Constant positive pixel drift along x. The implied equilibrium is
    // dpx · resolution · θ_pix / (dt · Npix) ≈ 2.05 m/s; the velocity
    // estimate climbs toward it from below as the covariance opens up.
    for _ in 0..500 {
        fusion::update_with_flow(
            &mut ekf,
            &FlowMeasurement {
                dt: 0.01,
                dpixel_x: 10.0,
                dpixel_y: 0.0,
            },
        );
        ekf.finalize();
    }

    let state = ekf.vehicle_state();
    assert!(state.dx > 0.2, "dx = {}", state.dx);
    assert!(state.dx < 2.1, "dx overshot: {}", state.dx);
    assert!(state.dy.abs() < 1e-6, "dy = {}", state.dy);
    assert!(state.z > 0.8 && state.z < 1.05, "z = {}", state.z);
}

#[test]
fn range_outliers_change_nothing() {
    let mut ekf = Ekf::new(EkfConfig::default(), 0);

    fusion::update_with_range(&mut ekf, &RangeMeasurement { distance_mm: 1000 });
    let z_before = ekf.vehicle_state().z;
    let p_before = *ekf.covariance();

    // At and beyond the outlier limit the update must be skipped outright.
    for mm in [6000, 9999] {
        assert!(!fusion::update_with_range(
            &mut ekf,
            &RangeMeasurement { distance_mm: mm }
        ));
        assert_eq!(ekf.vehicle_state().z, z_before);
        assert_eq!(*ekf.covariance(), p_before);
    }

    // A good sample afterwards still fuses.
    assert!(fusion::update_with_range(
        &mut ekf,
        &RangeMeasurement { distance_mm: 1000 }
    ));
}

#[test]
fn reinitialization_restores_the_initial_covariance() {
    let mut ekf = Ekf::new(EkfConfig::default(), 0);
    for _ in 0..5 {
        fusion::update_with_range(&mut ekf, &RangeMeasurement { distance_mm: 2000 });
        fusion::update_with_flow(
            &mut ekf,
            &FlowMeasurement {
                dt: 0.01,
                dpixel_x: 3.0,
                dpixel_y: -2.0,
            },
        );
    }
    assert_ne!(*ekf.covariance(), *Ekf::new(EkfConfig::default(), 0).covariance());

    ekf.initialize(1234);
    let fresh = Ekf::new(EkfConfig::default(), 1234);
    assert_eq!(*ekf.covariance(), *fresh.covariance());
    assert_eq!(ekf.vehicle_state(), fresh.vehicle_state());
}

static BOUNDS_WARNINGS: AtomicUsize = AtomicUsize::new(0);

struct CountingLogger;

impl log::Log for CountingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if record.level() == log::Level::Warn
            && record.args().to_string().contains("out of bounds")
        {
            BOUNDS_WARNINGS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

#[test]
fn divergence_resets_the_filter_and_warns_once() {
    static LOGGER: CountingLogger = CountingLogger;
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Warn);

    let task = EstimatorTask::new();
    let mut estimator = Estimator::new(&task, EkfConfig::default(), 0);

    let bad_flow = FlowMeasurement {
        dt: 0.01,
        dpixel_x: 1e9,
        dpixel_y: 0.0,
    };

    // The pathological sample blows the velocity estimate out of bounds.
    task.enqueue_flow(bad_flow);
    estimator.tick(10);
    assert!(task.vehicle_state().dx.abs() > 10.0);
    assert_eq!(BOUNDS_WARNINGS.load(Ordering::SeqCst), 1);

    // A second violation inside the hold-back window stays silent.
    task.enqueue_flow(bad_flow);
    estimator.tick(20);
    assert_eq!(BOUNDS_WARNINGS.load(Ordering::SeqCst), 1);

    // Once the queue is clean the reset takes and the estimate is sane again.
    estimator.tick(30);
    let state = task.vehicle_state();
    assert_eq!(state.dx, 0.0);
    assert_covariance_sane(estimator.ekf());
}
