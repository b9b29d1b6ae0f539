use nalgebra::{UnitQuaternion, Vector3};
use serde::Serialize;

/// Decoded sensor reading from the headset feature report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    /// Gyroscope angular velocity (deg/s).
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
    /// Accelerometer linear acceleration (m/s^2).
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    /// Magnetometer, raw device units.
    pub mx: f32,
    pub my: f32,
    pub mz: f32,
    /// Device clock timestamp (seconds). Wraps with the 32-bit tick counter.
    pub t: f64,
}

impl SensorSample {
    pub fn gyro(&self) -> Vector3<f32> {
        Vector3::new(self.gx, self.gy, self.gz)
    }

    pub fn accel(&self) -> Vector3<f32> {
        Vector3::new(self.ax, self.ay, self.az)
    }

    pub fn mag(&self) -> Vector3<f32> {
        Vector3::new(self.mx, self.my, self.mz)
    }
}

/// Orientation as roll/pitch/yaw. Units depend on the accessor that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl EulerAngles {
    pub fn from_quaternion(q: &UnitQuaternion<f64>) -> Self {
        let (roll, pitch, yaw) = q.euler_angles();
        Self { roll, pitch, yaw }
    }

    pub fn to_degrees(self) -> Self {
        Self {
            roll: self.roll.to_degrees(),
            pitch: self.pitch.to_degrees(),
            yaw: self.yaw.to_degrees(),
        }
    }
}

/// Rotation axis and angle (radians) of an orientation.
///
/// The identity rotation has no defined axis and is reported as a zero axis with a zero angle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AxisAngle {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub angle: f64,
}

impl AxisAngle {
    pub fn from_quaternion(q: &UnitQuaternion<f64>) -> Self {
        match q.axis_angle() {
            Some((axis, angle)) => Self {
                x: axis.x,
                y: axis.y,
                z: axis.z,
                angle,
            },
            None => Self::default(),
        }
    }
}

/// Event published to stream subscribers. Field names are part of the wire contract.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RotationEvent {
    pub rotation: EulerAngles,
}
