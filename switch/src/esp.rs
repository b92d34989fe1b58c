use core::convert::TryInto;
use std::{thread, time::Duration};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    handle::RawHandle,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{
            Configuration as HttpClientConfiguration, EspHttpConnection, FollowRedirectsPolicy,
        },
        Method as EspMethod,
    },
    io::EspIOError,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use dirigera_common::{
    config::{wake_pin, DeviceConfig, NetworkConfig},
    Connection, Exchange, Flow, HubClient, Method, Request, RuntimeConfig, TlsFailure, Transport,
    TransportError, TransportEvent,
};

const NVS_NAMESPACE: &str = "dirigera";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const READ_CHUNK_SIZE: usize = 1024;
const HUB_TASK_STACK_SIZE: usize = 16 * 1024;
const WIFI_RETRY_DELAY_MS: u64 = 1_000;

// Response headers the event handler cares about; the ESP client only
// exposes headers by name.
const FORWARDED_HEADERS: [&str; 4] = [
    "Content-Type",
    "Content-Length",
    "Transfer-Encoding",
    "Location",
];

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let woke_by_button = woke_from_button();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_build_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "config loaded: ssid=`{}`, hub=`{}:{}`, button=GPIO{}",
        runtime.network.wifi_ssid, runtime.hub.host, runtime.hub.port, runtime.device.button_pin,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network, &runtime.device) {
        Ok(mut wifi) => {
            if let Err(err) = spawn_hub_task(runtime.clone(), woke_by_button) {
                warn!("hub task failed: {err:#}");
            }
            let _ = wifi.disconnect();
            let _ = wifi.stop();
        }
        Err(err) => warn!("wifi unavailable, skipping hub requests: {err:#}"),
    }

    enter_deep_sleep(&runtime.device);
    Ok(())
}

fn ensure_build_defaults(runtime: &mut RuntimeConfig) {
    let fill = |field: &mut String, value: Option<&'static str>| {
        if field.is_empty() {
            if let Some(value) = value {
                *field = value.to_string();
            }
        }
    };

    fill(&mut runtime.hub.host, option_env!("DIRIGERA_HOST"));
    fill(&mut runtime.hub.token, option_env!("DIRIGERA_TOKEN"));
    fill(&mut runtime.network.wifi_ssid, option_env!("WIFI_SSID"));
    fill(&mut runtime.network.wifi_pass, option_env!("WIFI_PASS"));
}

fn spawn_hub_task(runtime: RuntimeConfig, woke_by_button: bool) -> anyhow::Result<()> {
    // TLS handshakes need more stack than the main task provides.
    thread::Builder::new()
        .name("hub".into())
        .stack_size(HUB_TASK_STACK_SIZE)
        .spawn(move || run_hub_requests(&runtime, woke_by_button))
        .context("failed to spawn hub task")?
        .join()
        .map_err(|_| anyhow!("hub task panicked"))
}

fn run_hub_requests(runtime: &RuntimeConfig, woke_by_button: bool) {
    if !runtime.hub.is_configured() {
        warn!("hub host or token missing; nothing to do");
        return;
    }

    let transport = EspTransport::new(&runtime.device);
    let mut hub = HubClient::new(
        transport,
        runtime.hub.clone(),
        runtime.device.response_buffer_bytes,
    );

    if woke_by_button {
        let report = hub.switch_all(false);
        info!(
            "switched off {} of {} lights",
            report.succeeded(),
            report.discovered
        );
    } else {
        let count = hub.log_lights();
        info!("hub reports {count} lights");
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    device: &DeviceConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let attempts = device.wifi_connect_attempts;
    let mut last_err = None;
    for attempt in 1..=attempts {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{attempts} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < attempts {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    let _ = wifi.stop();
    Err(anyhow!(
        "all {attempts} wifi connect attempts failed; last error: {last_err:?}"
    ))
}

struct EspTransport {
    timeout: Duration,
    tx_buffer_bytes: usize,
}

impl EspTransport {
    fn new(device: &DeviceConfig) -> Self {
        Self {
            timeout: Duration::from_millis(device.request_timeout_ms),
            tx_buffer_bytes: device.tx_buffer_bytes,
        }
    }
}

impl Transport for EspTransport {
    type Connection = EspConnection;

    fn connect(&mut self, _url: &str) -> Result<Self::Connection, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            buffer_size_tx: Some(self.tx_buffer_bytes),
            follow_redirects_policy: FollowRedirectsPolicy::FollowNone,
            ..Default::default()
        };
        let inner = EspHttpConnection::new(&conf).map_err(esp_error)?;
        Ok(EspConnection { inner })
    }
}

struct EspConnection {
    inner: EspHttpConnection,
}

fn esp_error(err: EspError) -> TransportError {
    TransportError::new(err.code(), err.to_string())
}

fn esp_io_error(err: EspIOError) -> TransportError {
    esp_error(err.0)
}

impl EspConnection {
    /// Reads and clears the last error recorded by the client's TLS layer.
    fn take_tls_failure(&self) -> Option<TlsFailure> {
        let mut tls_code = 0;
        let mut tls_flags = 0;
        let esp_code = unsafe {
            esp_idf_svc::sys::esp_http_client_get_and_clear_last_tls_error(
                self.inner.handle(),
                &mut tls_code,
                &mut tls_flags,
            )
        };
        TlsFailure::from_codes(esp_code, tls_code)
    }

    fn fail(
        &self,
        on_event: &mut dyn FnMut(TransportEvent<'_>) -> Flow,
        err: TransportError,
    ) -> Result<Exchange, TransportError> {
        on_event(TransportEvent::Error);
        on_event(TransportEvent::Disconnected {
            tls: self.take_tls_failure(),
        });
        Err(err)
    }
}

impl Connection for EspConnection {
    fn exchange(
        &mut self,
        request: &Request,
        on_event: &mut dyn FnMut(TransportEvent<'_>) -> Flow,
    ) -> Result<Exchange, TransportError> {
        let method = match request.method {
            Method::Get => EspMethod::Get,
            Method::Patch => EspMethod::Patch,
        };
        let body_len = request.body.as_ref().map(|body| body.len().to_string());
        let mut headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        if let Some(len) = body_len.as_deref() {
            headers.push(("Content-Length", len));
        }

        if let Err(err) = self.inner.initiate_request(method, &request.url, &headers) {
            return self.fail(on_event, esp_error(err));
        }
        on_event(TransportEvent::Connected);

        if let Some(body) = &request.body {
            if let Err(err) = Write::write_all(&mut self.inner, body) {
                return self.fail(on_event, esp_io_error(err));
            }
        }
        on_event(TransportEvent::HeaderSent);

        if let Err(err) = self.inner.initiate_response() {
            return self.fail(on_event, esp_error(err));
        }

        for name in FORWARDED_HEADERS {
            if let Some(value) = self.inner.header(name) {
                on_event(TransportEvent::HeaderReceived { key: name, value });
            }
        }

        let status = self.inner.status();
        let exchange = Exchange {
            status,
            content_length: self
                .inner
                .header("Content-Length")
                .and_then(|value| value.trim().parse().ok()),
        };

        if (300..400).contains(&status) {
            if let Some(location) = self.inner.header("Location") {
                on_event(TransportEvent::Redirect { location });
                return Ok(exchange);
            }
        }

        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match Read::read(&mut self.inner, &mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    if on_event(TransportEvent::DataReceived(&chunk[..read])) == Flow::Abort {
                        on_event(TransportEvent::Disconnected {
                            tls: self.take_tls_failure(),
                        });
                        return Err(TransportError::aborted());
                    }
                }
                Err(err) => return self.fail(on_event, esp_io_error(err)),
            }
        }

        on_event(TransportEvent::Finished);
        Ok(exchange)
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn woke_from_button() -> bool {
    let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
    if cause != esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT1 {
        info!("not a deep sleep reset (wake cause {cause})");
        return false;
    }

    let mask = unsafe { esp_idf_svc::sys::esp_sleep_get_ext1_wakeup_status() };
    match wake_pin(mask) {
        Some(pin) => {
            info!("wake up from GPIO {pin}");
            true
        }
        None => {
            info!("wake up from GPIO, pin unknown");
            false
        }
    }
}

fn enter_deep_sleep(device: &DeviceConfig) {
    let button_pin = device.button_pin;
    let mask = device.button_mask();
    info!("enabling wake up on GPIO{button_pin}");

    let rc = unsafe {
        esp_idf_svc::sys::esp_sleep_enable_ext1_wakeup(
            mask,
            esp_idf_svc::sys::esp_sleep_ext1_wakeup_mode_t_ESP_EXT1_WAKEUP_ANY_LOW,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to enable EXT1 wake up: esp_err_t={rc}");
    }

    let rc = unsafe { esp_idf_svc::sys::rtc_gpio_pulldown_dis(button_pin) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable pull-down on GPIO{button_pin}: esp_err_t={rc}");
    }
    let rc = unsafe { esp_idf_svc::sys::rtc_gpio_pullup_en(button_pin) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to enable pull-up on GPIO{button_pin}: esp_err_t={rc}");
    }

    info!("entering deep sleep");
    unsafe { esp_idf_svc::sys::esp_deep_sleep_start() };
}
