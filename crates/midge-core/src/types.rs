//! Measurement and output records exchanged with the rest of the flight
//! stack.

use nalgebra::Vector3;

/// Optical-flow pixel deltas accumulated over `dt` seconds by the downward
/// camera. Raw sensor counts arrive scaled by ten; the fusion layer undoes
/// that.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowMeasurement {
    /// Integration interval, seconds.
    pub dt: f32,
    /// Accumulated pixel count along body x, raw sensor units.
    pub dpixel_x: f32,
    /// Accumulated pixel count along body y, raw sensor units.
    pub dpixel_y: f32,
}

/// Downward time-of-flight range reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeMeasurement {
    /// Distance to ground along the sensor axis, millimeters.
    pub distance_mm: u32,
}

/// One typed sensor reading, as carried by the measurement queue.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Measurement {
    /// Body-frame angular rates, degrees/second.
    Gyroscope(Vector3<f32>),
    /// Body-frame specific force, g.
    Accelerometer(Vector3<f32>),
    Flow(FlowMeasurement),
    Range(RangeMeasurement),
}

/// Snapshot of the estimate consumed by the flight-control loop.
///
/// Horizontal position is not estimated and always reads zero. Angles are
/// degrees in the ENU convention, angular rates degrees/second.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VehicleState {
    pub x: f32,
    pub y: f32,
    /// Altitude above the initialization point, meters.
    pub z: f32,
    /// Body-frame velocities, m/s.
    pub dx: f32,
    pub dy: f32,
    /// World-frame vertical velocity, m/s.
    pub dz: f32,
    /// Roll, degrees.
    pub phi: f32,
    /// Pitch, degrees.
    pub theta: f32,
    /// Yaw, degrees.
    pub psi: f32,
    pub dphi: f32,
    pub dtheta: f32,
    pub dpsi: f32,
}

impl VehicleState {
    /// Zeroed record, usable in `const` context.
    pub const fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            dx: 0.0,
            dy: 0.0,
            dz: 0.0,
            phi: 0.0,
            theta: 0.0,
            psi: 0.0,
            dphi: 0.0,
            dtheta: 0.0,
            dpsi: 0.0,
        }
    }
}
