//! # Midge Core
//!
//! Attitude-and-altitude estimation library for a small multirotor, designed
//! for `no_std` environments. High-rate IMU samples are fused with downward
//! optical-flow and time-of-flight range measurements in an error-state
//! Kalman filter, producing bounded vehicle-state snapshots at roughly
//! 100 Hz for the flight-control loop:
//! - Fixed-size 7-state EKF over altitude, body velocities and attitude error
//! - Sensor-fusion layer mapping typed measurements onto scalar updates
//! - Cooperative estimator task with a bounded measurement queue
//!
//! # Features
//! - `std`: Enable standard library support (host tests and tooling)
//! - Default: `no_std` path with no allocations (bare metal embedded)

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod bounds;
pub mod ekf;
pub mod fusion;
pub mod math;
pub mod subsampler;
pub mod supervisor;
pub mod task;
pub mod types;

// Re-export core types
pub use bounds::StateBounds;
pub use ekf::{Ekf, EkfConfig};
pub use supervisor::RateSupervisor;
pub use task::{Estimator, EstimatorTask};
pub use types::{FlowMeasurement, Measurement, RangeMeasurement, VehicleState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
