use crate::types::SensorSample;
use thiserror::Error;

/// Size of the sensor feature report, including the report id byte.
pub const FEATURE_REPORT_LENGTH: usize = 107;
/// First byte of every sensor report.
pub const REPORT_MAGIC: u8 = 0x1b;

/// Field offsets inside the report. All values are little-endian.
const ACCEL_OFFSET: usize = 4;
const GYRO_OFFSET: usize = 16;
const MAG_OFFSET: usize = 28;
const TIMESTAMP_OFFSET: usize = 91;

/// Raw-to-physical scale factors.
const ACCEL_SCALE: f32 = 10_000.0;
const GYRO_SCALE: f32 = 100.0;
const TICKS_PER_SECOND: f64 = 10_000.0;

/// Span of the 32-bit device tick counter in seconds.
pub const TIMESTAMP_WRAP_SECONDS: f64 = (u32::MAX as f64 + 1.0) / TICKS_PER_SECOND;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("Unexpected report length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("Unexpected report marker 0x{0:02x} (expected 0x1b)")]
    BadMagic(u8),
}

/// Decode a raw feature report into a sensor sample.
///
/// Only the documented fields are read; every other byte is reserved and ignored.
pub fn decode(report: &[u8]) -> Result<SensorSample, ReportError> {
    if report.len() != FEATURE_REPORT_LENGTH {
        return Err(ReportError::WrongLength {
            expected: FEATURE_REPORT_LENGTH,
            actual: report.len(),
        });
    }
    if report[0] != REPORT_MAGIC {
        return Err(ReportError::BadMagic(report[0]));
    }

    let f = |offset: usize| -> f32 {
        f32::from_le_bytes([
            report[offset],
            report[offset + 1],
            report[offset + 2],
            report[offset + 3],
        ])
    };
    let ticks = u32::from_le_bytes([
        report[TIMESTAMP_OFFSET],
        report[TIMESTAMP_OFFSET + 1],
        report[TIMESTAMP_OFFSET + 2],
        report[TIMESTAMP_OFFSET + 3],
    ]);

    Ok(SensorSample {
        ax: f(ACCEL_OFFSET) / ACCEL_SCALE,
        ay: f(ACCEL_OFFSET + 4) / ACCEL_SCALE,
        az: f(ACCEL_OFFSET + 8) / ACCEL_SCALE,
        gx: f(GYRO_OFFSET) / GYRO_SCALE,
        gy: f(GYRO_OFFSET + 4) / GYRO_SCALE,
        gz: f(GYRO_OFFSET + 8) / GYRO_SCALE,
        mx: f(MAG_OFFSET),
        my: f(MAG_OFFSET + 4),
        mz: f(MAG_OFFSET + 8),
        t: ticks as f64 / TICKS_PER_SECOND,
    })
}

/// Build a report carrying `sample`. Reserved bytes are zero.
///
/// The timestamp is rounded to the nearest device tick and wraps like the hardware counter.
pub fn encode(sample: &SensorSample) -> [u8; FEATURE_REPORT_LENGTH] {
    let mut report = [0u8; FEATURE_REPORT_LENGTH];
    report[0] = REPORT_MAGIC;

    let mut put = |offset: usize, value: f32| {
        report[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    };
    put(ACCEL_OFFSET, sample.ax * ACCEL_SCALE);
    put(ACCEL_OFFSET + 4, sample.ay * ACCEL_SCALE);
    put(ACCEL_OFFSET + 8, sample.az * ACCEL_SCALE);
    put(GYRO_OFFSET, sample.gx * GYRO_SCALE);
    put(GYRO_OFFSET + 4, sample.gy * GYRO_SCALE);
    put(GYRO_OFFSET + 8, sample.gz * GYRO_SCALE);
    put(MAG_OFFSET, sample.mx);
    put(MAG_OFFSET + 4, sample.my);
    put(MAG_OFFSET + 8, sample.mz);

    let ticks = (sample.t * TICKS_PER_SECOND).round() as u64 as u32;
    report[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&ticks.to_le_bytes());
    report
}
