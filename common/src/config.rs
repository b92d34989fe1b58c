use serde::{Deserialize, Serialize};
use url::Url;

use crate::{buffer::DEFAULT_RESPONSE_CAPACITY, registry::DeviceId};

pub const DEFAULT_HUB_PORT: u16 = 8443;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_HUB_PORT,
            token: String::new(),
            api_version: default_api_version(),
        }
    }
}

impl HubConfig {
    pub fn base_url(&self) -> String {
        format!(
            "https://{}:{}/{}",
            self.host.trim(),
            self.port,
            self.api_version.trim_matches('/')
        )
    }

    pub fn devices_url(&self) -> String {
        format!("{}/devices", self.base_url())
    }

    /// URL of a single device, with the identifier encoded as one path
    /// segment. `None` when the configured host does not form a valid URL.
    pub fn device_url(&self, id: &DeviceId) -> Option<String> {
        let mut url = Url::parse(&self.devices_url()).ok()?;
        url.path_segments_mut().ok()?.push(id.as_str());
        Some(url.into())
    }

    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && !self.token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub button_pin: i32,
    pub response_buffer_bytes: usize,
    pub request_timeout_ms: u64,
    pub tx_buffer_bytes: usize,
    pub wifi_connect_attempts: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            button_pin: 7,
            response_buffer_bytes: DEFAULT_RESPONSE_CAPACITY,
            request_timeout_ms: 10_000,
            tx_buffer_bytes: 2142,
            wifi_connect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub hub: HubConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

impl HubConfig {
    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = DEFAULT_HUB_PORT;
        }
        if self.api_version.trim_matches('/').is_empty() {
            self.api_version = default_api_version();
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        // RTC-capable GPIOs only; EXT1 wake-up cannot use the others.
        if !(0..=21).contains(&self.button_pin) {
            self.button_pin = 7;
        }
        self.response_buffer_bytes = self.response_buffer_bytes.clamp(1024, 64 * 1024);
        self.request_timeout_ms = self.request_timeout_ms.clamp(1_000, 60_000);
        self.tx_buffer_bytes = self.tx_buffer_bytes.clamp(512, 8192);
        self.wifi_connect_attempts = self.wifi_connect_attempts.clamp(1, 20);
    }

    /// EXT1 wake-up mask selecting the button GPIO.
    pub fn button_mask(&self) -> u64 {
        1_u64 << self.button_pin
    }
}

/// Lowest GPIO set in an EXT1 wake-up status mask. An empty mask means the
/// wake-up was not caused by any pin.
pub fn wake_pin(mask: u64) -> Option<u32> {
    (mask != 0).then(|| mask.trailing_zeros())
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.hub.sanitize();
        self.device.sanitize();
    }
}
