//! Feature report sources: the USB HID headset and a synthetic stand-in.
//!
//! The driver only needs one call from a device, `read_feature_report`. Real
//! hardware goes through hidapi (cargo feature `hid`); `MockReportSource`
//! produces valid reports without glasses attached.

use crate::protocol;
use crate::types::SensorSample;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

/// DPVR headset USB identifiers.
pub const VENDOR_ID: u16 = 0x2d49;
pub const PRODUCT_ID: u16 = 0x001b;

/// Feature report carrying the sensor block. The low byte doubles as the report marker.
pub const FEATURE_REPORT_ID: u16 = 0x031b;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[cfg(feature = "hid")]
    #[error("Failed to open HID device {vendor_id:04x}:{product_id:04x}: {source}")]
    Open {
        vendor_id: u16,
        product_id: u16,
        #[source]
        source: hidapi::HidError,
    },
    #[cfg(feature = "hid")]
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),
    #[error("HID support not enabled. Rebuild with --features hid")]
    HidNotEnabled,
    #[error("Device disconnected")]
    Disconnected,
}

/// Anything that can answer a feature report query.
pub trait FeatureReportSource: Send {
    /// Request one feature report. The returned buffer is whatever the device sent.
    fn read_feature_report(&mut self, report_id: u16, length: usize) -> Result<Vec<u8>, DeviceError>;

    /// Release the device. Called once by the driver.
    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Headset opened through hidapi.
pub struct HidReportSource {
    #[cfg(feature = "hid")]
    device: hidapi::HidDevice,
}

impl HidReportSource {
    /// Open the first device matching the vendor and product id.
    #[cfg(feature = "hid")]
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, DeviceError> {
        let api = hidapi::HidApi::new()?;
        let device = api
            .open(vendor_id, product_id)
            .map_err(|source| DeviceError::Open {
                vendor_id,
                product_id,
                source,
            })?;

        tracing::info!(
            vendor = format!("{vendor_id:04x}"),
            product = format!("{product_id:04x}"),
            product_string = ?device.get_product_string().ok().flatten(),
            "Opened HID device"
        );

        Ok(Self { device })
    }

    /// Open the first device matching the vendor and product id.
    #[cfg(not(feature = "hid"))]
    pub fn open(_vendor_id: u16, _product_id: u16) -> Result<Self, DeviceError> {
        Err(DeviceError::HidNotEnabled)
    }
}

impl FeatureReportSource for HidReportSource {
    #[cfg(feature = "hid")]
    fn read_feature_report(&mut self, report_id: u16, length: usize) -> Result<Vec<u8>, DeviceError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        // hidapi takes the report number in the first byte and overwrites it with the reply.
        let mut buf = vec![0u8; length];
        buf[0] = (report_id & 0xff) as u8;
        let n = self.device.get_feature_report(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    #[cfg(not(feature = "hid"))]
    fn read_feature_report(&mut self, _report_id: u16, _length: usize) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::HidNotEnabled)
    }
}

/// Synthetic device for development without a headset and for tests.
pub struct MockReportSource {
    mode: MockMode,
    requests: Vec<(u16, usize)>,
}

enum MockMode {
    /// Level, motionless headset with a running clock.
    Stationary {
        ticks: u32,
        ticks_per_report: u32,
        interval: Duration,
    },
    /// Fixed list of replies, then `Disconnected`.
    Scripted(VecDeque<Vec<u8>>),
}

impl MockReportSource {
    /// Stationary headset reporting every `interval` of device time (and wall time).
    pub fn stationary(interval: Duration) -> Self {
        let ticks_per_report = (interval.as_secs_f64() * 10_000.0).round().max(1.0) as u32;
        Self {
            mode: MockMode::Stationary {
                ticks: 0,
                ticks_per_report,
                interval,
            },
            requests: Vec::new(),
        }
    }

    /// Reply with `reports` in order, then fail as if unplugged.
    pub fn scripted(reports: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            mode: MockMode::Scripted(reports.into_iter().collect()),
            requests: Vec::new(),
        }
    }

    /// Every `(report_id, length)` requested so far.
    pub fn requests(&self) -> &[(u16, usize)] {
        &self.requests
    }
}

impl FeatureReportSource for MockReportSource {
    fn read_feature_report(&mut self, report_id: u16, length: usize) -> Result<Vec<u8>, DeviceError> {
        self.requests.push((report_id, length));
        match &mut self.mode {
            MockMode::Stationary {
                ticks,
                ticks_per_report,
                interval,
            } => {
                if !interval.is_zero() {
                    std::thread::sleep(*interval);
                }
                *ticks = ticks.wrapping_add(*ticks_per_report);
                let sample = SensorSample {
                    gx: 0.0,
                    gy: 0.0,
                    gz: 0.0,
                    ax: 0.0,
                    ay: 0.0,
                    az: 9.81,
                    mx: 30.0,
                    my: 0.0,
                    mz: 0.0,
                    t: *ticks as f64 / 10_000.0,
                };
                let mut report = protocol::encode(&sample).to_vec();
                report.resize(length, 0);
                Ok(report)
            }
            MockMode::Scripted(reports) => reports.pop_front().ok_or(DeviceError::Disconnected),
        }
    }
}

/// udev rule granting `group` access to the headset.
pub fn udev_rule(vendor_id: u16, product_id: u16, mode: &str, group: &str) -> String {
    format!(
        r#"ATTRS{{idVendor}}=="{vendor_id:04x}", ATTRS{{idProduct}}=="{product_id:04x}", MODE:="{mode}", GROUP="{group}""#
    )
}
