use imu_fusion::{FusionConfig, DEFAULT_BAUD_RATE, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Filter selection, validation limits and calibration tuning.
    pub fusion: FusionConfig,
    /// Where samples come from.
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Listen for the sensor board on TCP; falls back to mock if binding fails.
    #[default]
    Tcp,
    /// Read the board over its USB serial link; falls back to mock if the
    /// port cannot be opened.
    Serial,
    /// Synthetic motion, no hardware needed.
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Address the TCP transport binds to.
    pub listen_addr: String,
    /// Serial device the board enumerates as.
    pub serial_port: String,
    pub baud_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Tcp,
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            serial_port: "/dev/ttyACM0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}
