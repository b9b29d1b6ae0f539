use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Which USB HID device to open.
    pub device: DeviceConfig,
    /// Orientation filter tuning.
    pub fusion: FusionConfig,
    /// Server-sent events endpoint.
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// USB vendor id. Only the DPVR E3 family is supported today.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x2d49,
            product_id: 0x001b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Madgwick filter beta parameter (convergence speed). Higher = more responsive, less smooth.
    pub madgwick_beta: f64,
    /// Nominal sample rate, used for the first sample and after clock jumps.
    pub sample_rate_hz: f64,
    /// Seed the orientation from gravity and magnetic north on the first sample.
    pub initialise: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            madgwick_beta: 0.4,
            sample_rate_hz: 300.0,
            initialise: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname or address to listen on.
    pub host: String,
    pub port: u16,
    /// Request path serving the event stream.
    pub path: String,
    /// Value for `Access-Control-Allow-Origin`. `None` omits the header.
    pub origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 4001,
            path: "/events".into(),
            origin: None,
        }
    }
}
