pub mod device;
pub mod driver;
pub mod fusion;
pub mod protocol;
pub mod types;

use device::FeatureReportSource;
use driver::{Driver, DriverError};
use fusion::OrientationFilter;
use std::ops::ControlFlow;
use tokio::sync::watch;
use types::SensorSample;

pub use device::{HidReportSource, MockReportSource, PRODUCT_ID, VENDOR_ID};
pub use fusion::MadgwickFilter;
pub use types::{EulerAngles, RotationEvent};

/// Drive the headset until `shutdown` flips to `true`, an update fails, or
/// `on_update` breaks.
///
/// Updates run strictly one after another; `on_update` sees the driver right after
/// each sample has been integrated. Returns the number of samples processed.
/// Blocks the calling thread, so run it on a dedicated or blocking task.
pub fn run_sampling_loop<S, F>(
    driver: &mut Driver<S, F>,
    shutdown: &watch::Receiver<bool>,
    mut on_update: impl FnMut(&Driver<S, F>, &SensorSample) -> ControlFlow<()>,
) -> Result<u64, DriverError>
where
    S: FeatureReportSource,
    F: OrientationFilter,
{
    let mut sample_count: u64 = 0;

    while !*shutdown.borrow() {
        let sample = driver.update()?;
        let flow = on_update(driver, &sample);

        sample_count += 1;
        if sample_count % 1000 == 0 {
            tracing::debug!(sample_count, t = sample.t, "IMU samples processed");
        }
        if flow.is_break() {
            break;
        }
    }

    tracing::info!(sample_count, "Sampling loop stopped");
    Ok(sample_count)
}
