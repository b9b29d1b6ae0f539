use crate::device::{DeviceError, FeatureReportSource, HidReportSource, FEATURE_REPORT_ID};
use crate::fusion::{MadgwickFilter, OrientationFilter, SensorFusion};
use crate::protocol::{self, ReportError, FEATURE_REPORT_LENGTH};
use crate::types::{AxisAngle, EulerAngles, SensorSample};
use nalgebra::UnitQuaternion;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Malformed feature report: {0}")]
    MalformedReport(#[from] ReportError),
    #[error("Driver is closed")]
    Closed,
    #[error("Device I/O error: {0}")]
    DeviceIo(#[from] DeviceError),
}

/// Headset driver: owns the device and the orientation filter.
///
/// Open from construction until [`Driver::close`]; once closed, `update` fails
/// with [`DriverError::Closed`].
pub struct Driver<S, F = MadgwickFilter> {
    device: Option<S>,
    fusion: SensorFusion<F>,
    last_sample: Option<SensorSample>,
    sample_count: u64,
}

impl<S: FeatureReportSource, F: OrientationFilter> Driver<S, F> {
    pub fn new(device: S, filter: F) -> Self {
        Self {
            device: Some(device),
            fusion: SensorFusion::new(filter),
            last_sample: None,
            sample_count: 0,
        }
    }

    /// Read one report from the device, decode it and advance the filter.
    pub fn update(&mut self) -> Result<SensorSample, DriverError> {
        let device = self.device.as_mut().ok_or(DriverError::Closed)?;
        let report = device.read_feature_report(FEATURE_REPORT_ID, FEATURE_REPORT_LENGTH)?;
        let sample = protocol::decode(&report)?;

        let dt = self.fusion.integrate(&sample);
        tracing::trace!(t = sample.t, ?dt, "Sample integrated");

        self.last_sample = Some(sample);
        self.sample_count += 1;
        Ok(sample)
    }

    /// Release the device. Closing an already closed driver does nothing.
    pub fn close(&mut self) -> Result<(), DriverError> {
        let Some(mut device) = self.device.take() else {
            return Ok(());
        };
        tracing::info!(samples = self.sample_count, "Closing headset driver");
        device.close()?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<&S> {
        self.device.as_ref()
    }

    /// Most recent decoded sample.
    pub fn last_sample(&self) -> Option<SensorSample> {
        self.last_sample
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn euler_angles(&self) -> EulerAngles {
        self.fusion.filter().euler_angles()
    }

    pub fn euler_angles_degrees(&self) -> EulerAngles {
        self.fusion.filter().euler_angles_degrees()
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.fusion.filter().quaternion()
    }

    pub fn to_vector(&self) -> AxisAngle {
        self.fusion.filter().to_vector()
    }
}

impl<F: OrientationFilter> Driver<HidReportSource, F> {
    /// Open the first HID device matching the ids.
    pub fn open_hid(vendor_id: u16, product_id: u16, filter: F) -> Result<Self, DriverError> {
        let device = HidReportSource::open(vendor_id, product_id)?;
        Ok(Self::new(device, filter))
    }
}
