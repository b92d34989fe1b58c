use log::{debug, error, info};

use crate::{
    buffer::BodyAccumulator,
    error::{HubError, TlsFailure, TransportError},
    transport::{Exchange, Flow, TransportEvent},
};

/// Lifecycle phase of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Streaming,
    Finished,
    Failed,
}

/// Result of one exchange as seen by the request issuer.
#[derive(Debug)]
pub enum Outcome {
    Redirect(String),
    Done {
        exchange: Exchange,
        /// Owned body when no fixed buffer was supplied.
        body: Option<Vec<u8>>,
    },
}

/// Drives the body accumulator from transport lifecycle events.
pub struct ResponseHandler<'a> {
    phase: Phase,
    body: BodyAccumulator<'a>,
    content_length: Option<u64>,
    chunked: bool,
    redirect: Option<String>,
    failure: Option<HubError>,
    tls: Option<TlsFailure>,
    owned_body: Option<Vec<u8>>,
}

impl<'a> ResponseHandler<'a> {
    pub fn new(body: BodyAccumulator<'a>) -> Self {
        Self {
            phase: Phase::Idle,
            body,
            content_length: None,
            chunked: false,
            redirect: None,
            failure: None,
            tls: None,
            owned_body: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn dispatch(&mut self, event: TransportEvent<'_>) -> Flow {
        match event {
            TransportEvent::Error => {
                debug!("HTTP_EVENT_ERROR");
                self.fail();
            }
            TransportEvent::Connected => {
                debug!("HTTP_EVENT_ON_CONNECTED");
                if self.phase == Phase::Idle {
                    self.phase = Phase::Connecting;
                }
            }
            TransportEvent::HeaderSent => debug!("HTTP_EVENT_HEADER_SENT"),
            TransportEvent::HeaderReceived { key, value } => {
                debug!("HTTP_EVENT_ON_HEADER, key={key}, value={value}");
                self.record_header(key, value);
            }
            TransportEvent::DataReceived(chunk) => {
                debug!("HTTP_EVENT_ON_DATA, len={}", chunk.len());
                return self.on_data(chunk);
            }
            TransportEvent::Finished => {
                debug!("HTTP_EVENT_ON_FINISH");
                self.finish();
            }
            TransportEvent::Disconnected { tls } => {
                info!("HTTP_EVENT_DISCONNECTED");
                if let Some(tls) = tls {
                    info!("last TLS failure: {tls}");
                    self.tls = Some(tls);
                }
                // A disconnect after a completed response only closes the socket.
                if self.phase != Phase::Finished {
                    self.fail();
                }
            }
            TransportEvent::Redirect { location } => {
                debug!("HTTP_EVENT_REDIRECT to {location}");
                self.body.abort();
                self.redirect = Some(location.to_string());
                self.content_length = None;
                self.chunked = false;
                self.phase = Phase::Idle;
            }
        }
        Flow::Continue
    }

    fn record_header(&mut self, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("content-length") {
            self.content_length = value.trim().parse().ok();
        } else if key.eq_ignore_ascii_case("transfer-encoding") {
            self.chunked = value.to_ascii_lowercase().contains("chunked");
        }
    }

    fn on_data(&mut self, chunk: &[u8]) -> Flow {
        if matches!(self.phase, Phase::Finished | Phase::Failed) {
            debug!("ignoring {} bytes after response ended", chunk.len());
            return Flow::Continue;
        }
        self.phase = Phase::Streaming;

        if self.chunked {
            error!("hub sent a chunked response, which is not supported");
            self.failure = Some(HubError::ChunkedResponse);
            self.fail();
            return Flow::Abort;
        }

        match self.body.accept(chunk, self.content_length) {
            Ok(_) => Flow::Continue,
            Err(err) => {
                error!("{err}");
                self.failure = Some(err);
                self.fail();
                Flow::Abort
            }
        }
    }

    fn finish(&mut self) {
        if matches!(self.phase, Phase::Finished | Phase::Failed) {
            return;
        }
        self.owned_body = self.body.finish();
        self.phase = Phase::Finished;
    }

    fn fail(&mut self) {
        self.body.abort();
        self.owned_body = None;
        self.phase = Phase::Failed;
    }

    /// Combines the transport's verdict with what the events reported.
    pub fn complete(
        mut self,
        result: Result<Exchange, TransportError>,
    ) -> Result<Outcome, HubError> {
        let exchange = match result {
            Ok(exchange) => exchange,
            Err(err) => {
                self.fail();
                return Err(match self.failure.take() {
                    Some(failure) => failure,
                    None => HubError::Transport(err.with_tls(self.tls)),
                });
            }
        };

        if let Some(failure) = self.failure.take() {
            self.fail();
            return Err(failure);
        }

        if let Some(location) = self.redirect.take() {
            return Ok(Outcome::Redirect(location));
        }

        self.finish();
        if self.phase == Phase::Failed {
            return Err(HubError::Transport(
                TransportError::new(
                    TransportError::INCOMPLETE,
                    "connection closed before the response completed",
                )
                .with_tls(self.tls),
            ));
        }

        let body = if self.body.is_dynamic() {
            Some(self.owned_body.take().unwrap_or_default())
        } else {
            None
        };
        Ok(Outcome::Done { exchange, body })
    }
}
