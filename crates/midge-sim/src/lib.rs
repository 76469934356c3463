//! Synthetic flight data for the midge estimator.
//!
//! Generates truth profiles and noisy sensor streams for a simple
//! ground → climb → hover flight, and replays them through the estimator
//! task exactly the way the flight stack drives it: samples enqueued at
//! their native rates, one driver tick per millisecond.

pub mod harness;
pub mod sensor;

pub use harness::{run_estimator, EstimateTrace};
pub use sensor::{generate_timeline, ScenarioConfig, SensorTimeline, TruthSample};
