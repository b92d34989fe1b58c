use log::{debug, error, info, warn};
use serde_json::json;

use crate::{
    client::HttpClient,
    config::HubConfig,
    devices::parse_lights,
    error::HubError,
    registry::{Light, LightRegistry},
    transport::Transport,
};

/// Body of a power-state PATCH.
pub fn power_command(on: bool) -> String {
    json!([{ "attributes": { "isOn": on } }]).to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchReport {
    pub discovered: usize,
    pub failed: usize,
}

impl SwitchReport {
    pub fn succeeded(&self) -> usize {
        self.discovered - self.failed
    }
}

pub struct HubClient<T: Transport> {
    http: HttpClient<T>,
    config: HubConfig,
}

impl<T: Transport> HubClient<T> {
    pub fn new(transport: T, config: HubConfig, buffer_capacity: usize) -> Self {
        Self {
            http: HttpClient::new(transport, config.token.clone(), buffer_capacity),
            config,
        }
    }

    /// Lists the hub's lights, keeping the reason when that fails.
    pub fn try_discover(&mut self) -> Result<LightRegistry, HubError> {
        let url = self.config.devices_url();
        let mut handle = self.http.open(&url)?;
        let response = handle.perform()?;
        if !response.is_success() {
            return Err(HubError::Status {
                status: response.status,
                body: response.body_text().into_owned(),
            });
        }

        let lights = parse_lights(&response.body)?;
        Ok(LightRegistry::new(lights))
    }

    /// Lists the hub's lights. Any failure is logged and reported as an empty
    /// registry.
    pub fn discover(&mut self) -> LightRegistry {
        match self.try_discover() {
            Ok(registry) => {
                if registry.is_empty() {
                    warn!("did not find any lights");
                }
                registry
            }
            Err(err) => {
                error!("failed to discover lights: {err}");
                LightRegistry::default()
            }
        }
    }

    /// Sends one power command and returns the hub's status code.
    pub fn try_set_light_power(&mut self, light: &Light, on: bool) -> Result<u16, HubError> {
        let url = self
            .config
            .device_url(light.id())
            .ok_or_else(|| HubError::TransportInit {
                url: format!("{}/{}", self.config.devices_url(), light.id()),
                reason: "cannot build device url".to_string(),
            })?;
        info!("set_light_power url is {url}");

        let body = power_command(on);
        let mut handle = self.http.open(&url)?;
        let response = handle.patch(&body)?;
        if !response.is_success() {
            return Err(HubError::Status {
                status: response.status,
                body: response.body_text().into_owned(),
            });
        }
        Ok(response.status)
    }

    /// Fire-and-forget variant of [`Self::try_set_light_power`]. Returns
    /// whether the hub accepted the command.
    pub fn set_light_power(&mut self, light: &Light, on: bool) -> bool {
        match self.try_set_light_power(light, on) {
            Ok(_) => true,
            Err(HubError::Status { status, body }) => {
                error!(
                    "set_light_power for {} failed with status code {status}, body {body}",
                    light.id()
                );
                false
            }
            Err(err) => {
                error!("set_light_power for {} failed: {err}", light.id());
                false
            }
        }
    }

    pub fn set_all(&mut self, registry: &LightRegistry, on: bool) -> SwitchReport {
        let mut report = SwitchReport {
            discovered: registry.len(),
            failed: 0,
        };
        for light in registry {
            if !self.set_light_power(light, on) {
                report.failed += 1;
            }
        }
        report
    }

    /// Discovers every light, switches it, and releases the registry.
    pub fn switch_all(&mut self, on: bool) -> SwitchReport {
        let registry = self.discover();
        let report = self.set_all(&registry, on);
        let freed = LightRegistry::release(Some(registry));
        debug!("released {freed} light identifiers");
        report
    }

    /// Logs the identifier of every light. Returns how many were found.
    pub fn log_lights(&mut self) -> usize {
        let registry = self.discover();
        for light in &registry {
            info!("light id: {}", light.id());
        }
        LightRegistry::release(Some(registry))
    }
}
