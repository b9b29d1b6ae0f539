use crate::protocol::TIMESTAMP_WRAP_SECONDS;
use crate::types::{AxisAngle, EulerAngles, SensorSample};
use ahrs::{Ahrs, Madgwick};
use nalgebra::{UnitQuaternion, Vector3};

/// Standard gravity (m/s^2). The fusion step expects acceleration in multiples of g.
pub const STANDARD_GRAVITY: f64 = 9.81;

/// Gaps longer than this are treated as a device clock reset, not elapsed time.
const MAX_PLAUSIBLE_DT: f64 = 1.0;

/// Sensor values in the units the fusion step expects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionInput {
    /// Angular rate (rad/s).
    pub gyro: Vector3<f64>,
    /// Acceleration (g).
    pub accel: Vector3<f64>,
    /// Magnetic field, unscaled.
    pub mag: Vector3<f64>,
}

impl FusionInput {
    pub fn from_sample(sample: &SensorSample) -> Self {
        Self {
            gyro: sample.gyro().cast::<f64>().map(f64::to_radians),
            accel: sample.accel().cast::<f64>() / STANDARD_GRAVITY,
            mag: sample.mag().cast::<f64>(),
        }
    }
}

/// An orientation estimator fed one sample at a time.
///
/// `integrate` is the only mutator; the read accessors derive their view from
/// [`OrientationFilter::quaternion`] and never change state.
pub trait OrientationFilter: Send {
    /// Advance the estimate. `dt` is the elapsed time since the previous sample in
    /// seconds; `None` means the filter should use its default period.
    fn integrate(&mut self, input: &FusionInput, dt: Option<f64>);

    /// Current orientation as a unit quaternion.
    fn quaternion(&self) -> UnitQuaternion<f64>;

    /// Roll, pitch and yaw in radians.
    fn euler_angles(&self) -> EulerAngles {
        EulerAngles::from_quaternion(&self.quaternion())
    }

    /// Roll, pitch and yaw in degrees.
    fn euler_angles_degrees(&self) -> EulerAngles {
        self.euler_angles().to_degrees()
    }

    /// Rotation axis and angle.
    fn to_vector(&self) -> AxisAngle {
        AxisAngle::from_quaternion(&self.quaternion())
    }
}

/// Madgwick AHRS filter with a per-sample period.
pub struct MadgwickFilter {
    beta: f64,
    /// Period used when no measured time delta is available.
    default_period: f64,
    /// Seed the orientation from gravity and magnetic north on the first sample.
    initialise: bool,
    initialised: bool,
    quat: UnitQuaternion<f64>,
}

impl MadgwickFilter {
    pub fn new(beta: f64, sample_rate_hz: f64) -> Self {
        Self {
            beta,
            default_period: 1.0 / sample_rate_hz,
            initialise: true,
            initialised: false,
            quat: UnitQuaternion::identity(),
        }
    }

    pub fn with_initialisation(mut self, enabled: bool) -> Self {
        self.initialise = enabled;
        self
    }

    pub fn default_period(&self) -> f64 {
        self.default_period
    }
}

impl OrientationFilter for MadgwickFilter {
    fn integrate(&mut self, input: &FusionInput, dt: Option<f64>) {
        if !self.initialised {
            self.initialised = true;
            if self.initialise {
                if let Some(q) = initial_orientation(input) {
                    self.quat = q;
                    tracing::debug!(?q, "Orientation initialised from first sample");
                }
            }
        }

        let period = match dt {
            Some(dt) if dt.is_finite() && dt >= 0.0 => dt,
            _ => self.default_period,
        };

        // The period is fixed per filter instance in ahrs, so rebuild around the current state.
        let mut filter = Madgwick::new_with_quat(period, self.beta, self.quat);
        let result = if input.mag.norm() == 0.0 {
            filter.update_imu(&input.gyro, &input.accel).map(|q| *q)
        } else {
            filter
                .update(&input.gyro, &input.accel, &input.mag)
                .map(|q| *q)
        };

        match result {
            Ok(q) => self.quat = q,
            Err(e) => {
                // No usable gravity reference: integrate the gyroscope alone.
                tracing::trace!(?e, "Fusion step rejected, integrating gyro only");
                self.quat *= UnitQuaternion::from_scaled_axis(input.gyro * period);
            }
        }
    }

    fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quat
    }
}

/// Orientation implied by a stationary reading: tilt from gravity, heading from the
/// tilt-compensated magnetometer. `None` without a gravity reading.
fn initial_orientation(input: &FusionInput) -> Option<UnitQuaternion<f64>> {
    let a = input.accel;
    if a.norm() == 0.0 {
        return None;
    }
    let roll = a.y.atan2(a.z);
    let pitch = (-a.x).atan2((a.y * a.y + a.z * a.z).sqrt());

    let m = input.mag;
    let yaw = if m.norm() == 0.0 {
        0.0
    } else {
        let (sr, cr) = roll.sin_cos();
        let (sp, cp) = pitch.sin_cos();
        let bx = m.x * cp + m.y * sr * sp + m.z * cr * sp;
        let by = m.y * cr - m.z * sr;
        (-by).atan2(bx)
    };

    Some(UnitQuaternion::from_euler_angles(roll, pitch, yaw))
}

/// Drives an [`OrientationFilter`] from decoded samples, deriving the time delta
/// from the device clock.
pub struct SensorFusion<F = MadgwickFilter> {
    filter: F,
    /// Raw timestamp of the previous sample (seconds).
    last_timestamp: Option<f64>,
}

impl<F: OrientationFilter> SensorFusion<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            last_timestamp: None,
        }
    }

    /// Feed one sample to the filter. Returns the time delta that was passed to it.
    pub fn integrate(&mut self, sample: &SensorSample) -> Option<f64> {
        let dt = self
            .last_timestamp
            .and_then(|previous| elapsed(previous, sample.t));
        self.filter.integrate(&FusionInput::from_sample(sample), dt);
        self.last_timestamp = Some(sample.t);
        dt
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }
}

/// Time between two device timestamps, unwrapping one counter rollover.
fn elapsed(previous: f64, current: f64) -> Option<f64> {
    let dt = if current >= previous {
        current - previous
    } else {
        current + TIMESTAMP_WRAP_SECONDS - previous
    };
    if dt > MAX_PLAUSIBLE_DT {
        tracing::warn!(previous, current, dt, "Device clock jumped, using default period");
        return None;
    }
    Some(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every time delta it is given.
    struct RecordingFilter {
        dts: Arc<Mutex<Vec<Option<f64>>>>,
    }

    impl OrientationFilter for RecordingFilter {
        fn integrate(&mut self, _input: &FusionInput, dt: Option<f64>) {
            self.dts.lock().unwrap().push(dt);
        }

        fn quaternion(&self) -> UnitQuaternion<f64> {
            UnitQuaternion::identity()
        }
    }

    fn recording() -> (SensorFusion<RecordingFilter>, Arc<Mutex<Vec<Option<f64>>>>) {
        let dts = Arc::new(Mutex::new(Vec::new()));
        let fusion = SensorFusion::new(RecordingFilter { dts: dts.clone() });
        (fusion, dts)
    }

    fn stationary(t: f64) -> SensorSample {
        SensorSample {
            gx: 0.0,
            gy: 0.0,
            gz: 0.0,
            ax: 0.0,
            ay: 0.0,
            az: 9.81,
            mx: 30.0,
            my: 0.0,
            mz: -20.0,
            t,
        }
    }

    #[test]
    fn input_unit_conversion() {
        let mut sample = stationary(0.0);
        sample.gx = 180.0;
        sample.gz = -90.0;
        sample.ax = 19.62;
        let input = FusionInput::from_sample(&sample);
        assert!((input.gyro.x - std::f64::consts::PI).abs() < 1e-9);
        assert!((input.gyro.z + std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert!((input.accel.x - 2.0).abs() < 1e-6);
        assert!((input.accel.z - 1.0).abs() < 1e-6);
        assert_eq!(input.mag, Vector3::new(30.0, 0.0, -20.0));
    }

    #[test]
    fn first_sample_has_no_dt_then_elapsed_time() {
        let (mut fusion, dts) = recording();
        assert_eq!(fusion.integrate(&stationary(1.0)), None);
        let dt = fusion.integrate(&stationary(1.01)).unwrap();
        assert!((dt - 0.01).abs() < 1e-12);

        let recorded = dts.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], None);
        assert!((recorded[1].unwrap() - 0.01).abs() < 1e-12);
        assert_eq!(fusion.last_timestamp(), Some(1.01));
    }

    #[test]
    fn wraparound_unwraps_one_rollover() {
        let (mut fusion, _) = recording();
        fusion.integrate(&stationary(TIMESTAMP_WRAP_SECONDS - 0.005));
        let dt = fusion.integrate(&stationary(0.005)).unwrap();
        assert!((dt - 0.01).abs() < 1e-6);
        assert_eq!(fusion.last_timestamp(), Some(0.005));
    }

    #[test]
    fn clock_jump_falls_back_to_default_but_still_advances_timestamp() {
        let (mut fusion, dts) = recording();
        fusion.integrate(&stationary(100.0));
        assert_eq!(fusion.integrate(&stationary(5.0)), None);
        assert_eq!(dts.lock().unwrap()[1], None);
        assert_eq!(fusion.last_timestamp(), Some(5.0));
    }

    #[test]
    fn madgwick_first_sample_keeps_unit_quaternion() {
        let mut fusion = SensorFusion::new(MadgwickFilter::new(0.4, 300.0));
        fusion.integrate(&stationary(0.0));
        let q = fusion.filter().quaternion();
        assert!((q.into_inner().norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn level_headset_initialises_near_identity() {
        let mut filter = MadgwickFilter::new(0.4, 300.0);
        let input = FusionInput::from_sample(&SensorSample {
            mz: 0.0,
            ..stationary(0.0)
        });
        filter.integrate(&input, None);
        let e = filter.euler_angles();
        assert!(e.roll.abs() < 1e-3);
        assert!(e.pitch.abs() < 1e-3);
        assert!(e.yaw.abs() < 1e-3);
    }

    #[test]
    fn initialisation_picks_up_tilt() {
        // Rolled 90 degrees: gravity along +y.
        let input = FusionInput {
            gyro: Vector3::zeros(),
            accel: Vector3::new(0.0, 1.0, 0.0),
            mag: Vector3::zeros(),
        };
        let q = initial_orientation(&input).unwrap();
        let (roll, pitch, _) = q.euler_angles();
        assert!((roll - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert!(pitch.abs() < 1e-9);
    }

    #[test]
    fn gyro_only_without_gravity() {
        let mut filter = MadgwickFilter::new(0.4, 100.0).with_initialisation(false);
        let input = FusionInput {
            gyro: Vector3::new(0.0, 0.0, 1.0),
            accel: Vector3::zeros(),
            mag: Vector3::zeros(),
        };
        filter.integrate(&input, Some(0.5));
        let e = filter.euler_angles();
        assert!((e.yaw - 0.5).abs() < 1e-9);
        assert!((filter.quaternion().into_inner().norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stationary_samples_stay_stable() {
        let mut fusion = SensorFusion::new(MadgwickFilter::new(0.4, 300.0));
        for i in 0..600 {
            fusion.integrate(&SensorSample {
                mz: 0.0,
                ..stationary(i as f64 / 300.0)
            });
        }
        let e = fusion.filter().euler_angles_degrees();
        assert!(e.roll.abs() < 1.0);
        assert!(e.pitch.abs() < 1.0);
        assert!(e.yaw.abs() < 1.0);
    }

    #[test]
    fn negative_or_nan_dt_uses_default_period() {
        let mut filter = MadgwickFilter::new(0.4, 100.0).with_initialisation(false);
        let input = FusionInput {
            gyro: Vector3::new(0.0, 0.0, 1.0),
            accel: Vector3::zeros(),
            mag: Vector3::zeros(),
        };
        filter.integrate(&input, Some(-3.0));
        filter.integrate(&input, Some(f64::NAN));
        assert!((filter.euler_angles().yaw - 0.02).abs() < 1e-9);
    }
}
