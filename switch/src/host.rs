use std::{io::Read, time::Duration};

use anyhow::{bail, Context};
use reqwest::{
    blocking::Client,
    header::LOCATION,
    redirect::Policy,
};
use tracing::{info, warn};

use dirigera_common::{
    config::DEFAULT_HUB_PORT, Connection, Exchange, Flow, HubClient, Method, Request,
    RuntimeConfig, Transport, TransportError, TransportEvent,
};

const READ_CHUNK_SIZE: usize = 1024;
// Mirrors ESP-IDF's ESP_ERR_HTTP_CONNECT / ESP_ERR_HTTP_CONNECTION_CLOSED.
const HTTP_CONNECT_FAILED: i32 = 0x7002;
const HTTP_CONNECTION_CLOSED: i32 = 0x7008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    On,
    Off,
    List,
}

impl Action {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "list" => Ok(Self::List),
            other => bail!("unknown SWITCH_ACTION `{other}`; use `on`, `off` or `list`"),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = runtime_from_env()?;
    let action = match std::env::var("SWITCH_ACTION") {
        Ok(value) => Action::parse(&value)?,
        Err(_) => Action::Off,
    };

    info!(
        "hub `{}:{}`, action {:?}",
        runtime.hub.host, runtime.hub.port, action
    );

    tokio::task::spawn_blocking(move || run_action(runtime, action))
        .await
        .context("light switch task panicked")?
}

fn runtime_from_env() -> anyhow::Result<RuntimeConfig> {
    let mut runtime = RuntimeConfig::default();
    runtime.hub.host = std::env::var("DIRIGERA_HOST").context("DIRIGERA_HOST is not set")?;
    runtime.hub.token = std::env::var("DIRIGERA_TOKEN").context("DIRIGERA_TOKEN is not set")?;
    runtime.hub.port = std::env::var("DIRIGERA_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HUB_PORT);
    if let Some(timeout_ms) = std::env::var("DIRIGERA_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        runtime.device.request_timeout_ms = timeout_ms;
    }
    runtime.sanitize();
    Ok(runtime)
}

fn run_action(runtime: RuntimeConfig, action: Action) -> anyhow::Result<()> {
    let transport =
        ReqwestTransport::new(Duration::from_millis(runtime.device.request_timeout_ms))?;
    let mut hub = HubClient::new(transport, runtime.hub, runtime.device.response_buffer_bytes);

    match action {
        Action::List => {
            let count = hub.log_lights();
            info!("found {count} lights");
        }
        Action::On | Action::Off => {
            let on = action == Action::On;
            let report = hub.switch_all(on);
            if report.failed > 0 {
                warn!(
                    "{} of {} lights did not accept the command",
                    report.failed, report.discovered
                );
            }
            info!(
                "switched {} lights {}",
                report.succeeded(),
                if on { "on" } else { "off" }
            );
        }
    }
    Ok(())
}

/// Blocking desktop transport used to drive a real hub from a workstation.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            // The hub serves a self-signed certificate.
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    type Connection = ReqwestConnection;

    fn connect(&mut self, _url: &str) -> Result<Self::Connection, TransportError> {
        Ok(ReqwestConnection {
            client: self.client.clone(),
        })
    }
}

pub struct ReqwestConnection {
    client: Client,
}

impl Connection for ReqwestConnection {
    fn exchange(
        &mut self,
        request: &Request,
        on_event: &mut dyn FnMut(TransportEvent<'_>) -> Flow,
    ) -> Result<Exchange, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Patch => reqwest::Method::PATCH,
        };
        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let mut response = match builder.send() {
            Ok(response) => response,
            Err(err) => {
                on_event(TransportEvent::Error);
                on_event(TransportEvent::Disconnected { tls: None });
                return Err(TransportError::new(HTTP_CONNECT_FAILED, err.to_string()));
            }
        };
        on_event(TransportEvent::Connected);
        on_event(TransportEvent::HeaderSent);

        for (key, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                on_event(TransportEvent::HeaderReceived {
                    key: key.as_str(),
                    value,
                });
            }
        }

        let exchange = Exchange {
            status: response.status().as_u16(),
            content_length: response.content_length(),
        };

        if response.status().is_redirection() {
            if let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            {
                on_event(TransportEvent::Redirect { location });
                return Ok(exchange);
            }
        }

        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    if on_event(TransportEvent::DataReceived(&chunk[..read])) == Flow::Abort {
                        on_event(TransportEvent::Disconnected { tls: None });
                        return Err(TransportError::aborted());
                    }
                }
                Err(err) => {
                    on_event(TransportEvent::Error);
                    on_event(TransportEvent::Disconnected { tls: None });
                    return Err(TransportError::new(HTTP_CONNECTION_CLOSED, err.to_string()));
                }
            }
        }

        on_event(TransportEvent::Finished);
        Ok(exchange)
    }
}

#[cfg(test)]
mod tests {
    use dirigera_common::{parse_lights, HttpClient, HubError};
    use wiremock::{
        matchers::{body_string, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn client() -> HttpClient<ReqwestTransport> {
        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        HttpClient::new(transport, "secret", 1024)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetches_device_listing_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"[{"type":"light","id":"abc"},{"type":"outlet","id":"x"}]"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/v1/devices", server.uri());
        let ids = tokio::task::spawn_blocking(move || {
            let mut client = client();
            let mut handle = client.open(&url).unwrap();
            let response = handle.perform().unwrap();
            assert_eq!(response.status, 200);
            let lights = parse_lights(&response.body).unwrap();
            let ids: Vec<String> = lights
                .iter()
                .map(|light| light.id().to_string())
                .collect();
            ids
        })
        .await
        .unwrap();

        assert_eq!(ids, vec!["abc".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn patches_device_with_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/devices/abc"))
            .and(header("authorization", "Bearer secret"))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"[{"attributes":{"isOn":false}}]"#))
            .respond_with(ResponseTemplate::new(202))
            .expect(2)
            .mount(&server)
            .await;

        let url = format!("{}/v1/devices/abc", server.uri());
        let statuses = tokio::task::spawn_blocking(move || {
            let mut client = client();
            let mut statuses = Vec::new();
            for _ in 0..2 {
                let mut handle = client.open(&url).unwrap();
                statuses.push(
                    handle
                        .patch(r#"[{"attributes":{"isOn":false}}]"#)
                        .unwrap()
                        .status,
                );
                handle.close();
            }
            statuses
        })
        .await
        .unwrap();

        assert_eq!(statuses, vec![202, 202]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn follows_redirect_with_rewritten_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/v1/devices"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(header("from", "user@example.com"))
            .and(header("accept", "text/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/devices", server.uri());
        let body = tokio::task::spawn_blocking(move || {
            let mut client = client();
            let mut handle = client.open(&url).unwrap();
            let body = handle.perform().unwrap().body.into_owned();
            body
        })
        .await
        .unwrap();

        assert_eq!(body, b"[]".to_vec());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_host_is_a_transport_error() {
        let result = tokio::task::spawn_blocking(|| {
            let mut client = client();
            let mut handle = client.open("http://127.0.0.1:1/v1/devices").unwrap();
            let err = handle.perform().unwrap_err();
            err
        })
        .await
        .unwrap();

        match result {
            HubError::Transport(err) => assert_eq!(err.code, HTTP_CONNECT_FAILED),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parses_switch_action() {
        assert_eq!(Action::parse("OFF").unwrap(), Action::Off);
        assert_eq!(Action::parse(" on ").unwrap(), Action::On);
        assert_eq!(Action::parse("list").unwrap(), Action::List);
        assert!(Action::parse("toggle").is_err());
    }
}
