pub mod buffer;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod hub;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use buffer::{ResponseBuffer, DEFAULT_RESPONSE_CAPACITY};
pub use client::{HttpClient, RequestHandle, Response};
pub use config::{DeviceConfig, HubConfig, NetworkConfig, RuntimeConfig};
pub use devices::parse_lights;
pub use error::{HubError, ParseError, TlsFailure, TransportError};
pub use hub::{HubClient, SwitchReport};
pub use registry::{DeviceId, Light, LightRegistry};
pub use transport::{Connection, Exchange, Flow, Method, Request, Transport, TransportEvent};
