use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub sensor: SensorConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Device address; 0xFFFFFFFF is the factory default
    #[serde(default = "default_address")]
    pub address: u32,
    #[serde(default)]
    pub password: u32,
    /// Budget for each exact-length read while parsing a packet
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Silence required before the link counts as flushed
    #[serde(default = "default_drain_quiet_ms")]
    pub drain_quiet_ms: u64,
}

impl SensorConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for the server's reply once the body is sent
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: String,
}

impl ImageConfig {
    /// Two 4-bit pixels per byte
    pub fn packed_len(&self) -> usize {
        (self.width as usize * self.height as usize) / 2
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            width: default_width(),
            height: default_height(),
            format: default_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_samples_per_subject")]
    pub samples_per_subject: u32,
    #[serde(default = "default_quiet_ms")]
    pub quiet_ms: u64,
    #[serde(default = "default_finger_poll_ms")]
    pub finger_poll_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_busy_poll_ms")]
    pub busy_poll_ms: u64,
    #[serde(default = "default_lift_poll_ms")]
    pub lift_poll_ms: u64,
    #[serde(default = "default_lift_timeout_ms")]
    pub lift_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            samples_per_subject: default_samples_per_subject(),
            quiet_ms: default_quiet_ms(),
            finger_poll_ms: default_finger_poll_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            busy_poll_ms: default_busy_poll_ms(),
            lift_poll_ms: default_lift_poll_ms(),
            lift_timeout_ms: default_lift_timeout_ms(),
        }
    }
}

fn default_baud_rate() -> u32 {
    57600
}

fn default_address() -> u32 {
    0xFFFF_FFFF
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_drain_quiet_ms() -> u64 {
    50
}

fn default_path() -> String {
    "/upload-image".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_response_timeout_ms() -> u64 {
    3000
}

fn default_width() -> u32 {
    256
}

fn default_height() -> u32 {
    288
}

fn default_format() -> String {
    "packed4".to_string()
}

fn default_samples_per_subject() -> u32 {
    3
}

fn default_quiet_ms() -> u64 {
    800
}

fn default_finger_poll_ms() -> u64 {
    80
}

fn default_idle_poll_ms() -> u64 {
    120
}

fn default_busy_poll_ms() -> u64 {
    150
}

fn default_lift_poll_ms() -> u64 {
    150
}

fn default_lift_timeout_ms() -> u64 {
    7000
}
