use std::borrow::Cow;

use log::{debug, info, warn};
use url::Url;

use crate::{
    buffer::{BodyAccumulator, ResponseBuffer},
    error::HubError,
    events::{Outcome, ResponseHandler},
    transport::{Connection, Method, Request, Transport, TransportEvent},
};

pub const MAX_REDIRECTS: usize = 10;

const REDIRECT_FROM: &str = "user@example.com";
const REDIRECT_ACCEPT: &str = "text/html";

/// Authenticated request factory over a [`Transport`].
///
/// When built with a fixed buffer, every response body is accumulated into
/// that buffer. A [`RequestHandle`] borrows the client mutably, so only one
/// request can use the buffer at a time.
pub struct HttpClient<T: Transport> {
    transport: T,
    token: String,
    buffer: Option<ResponseBuffer>,
}

impl<T: Transport> HttpClient<T> {
    pub fn new(transport: T, token: impl Into<String>, buffer_capacity: usize) -> Self {
        Self {
            transport,
            token: token.into(),
            buffer: Some(ResponseBuffer::with_capacity(buffer_capacity)),
        }
    }

    /// Client whose responses are collected into buffers sized from the
    /// declared content length.
    pub fn without_buffer(transport: T, token: impl Into<String>) -> Self {
        Self {
            transport,
            token: token.into(),
            buffer: None,
        }
    }

    pub fn open(&mut self, url: &str) -> Result<RequestHandle<'_, T::Connection>, HubError> {
        let init_error = |reason: String| HubError::TransportInit {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|err| init_error(err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(init_error(format!("unsupported scheme `{}`", parsed.scheme())));
        }
        if parsed.host_str().is_none() {
            return Err(init_error("missing host".to_string()));
        }

        let connection = self
            .transport
            .connect(parsed.as_str())
            .map_err(|err| init_error(err.to_string()))?;
        info!("created client with url {parsed}");

        let mut request = Request::get(parsed.as_str());
        request.set_header("Authorization", format!("Bearer {}", self.token));

        Ok(RequestHandle {
            connection,
            request,
            buffer: self.buffer.as_mut(),
        })
    }
}

#[derive(Debug)]
pub struct Response<'r> {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Cow<'r, [u8]>,
}

impl Response<'_> {
    pub fn is_success(&self) -> bool {
        self.status < 300
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// One open connection plus the request it will send. Dropping the handle
/// releases the connection.
pub struct RequestHandle<'c, C: Connection> {
    connection: C,
    request: Request,
    buffer: Option<&'c mut ResponseBuffer>,
}

impl<C: Connection> RequestHandle<'_, C> {
    /// Sends the request and blocks until the transport completes or fails.
    pub fn perform(&mut self) -> Result<Response<'_>, HubError> {
        let mut redirects = 0;
        let (exchange, owned_body) = loop {
            let accumulator = match self.buffer.as_deref_mut() {
                Some(buffer) => BodyAccumulator::fixed(buffer),
                None => BodyAccumulator::dynamic(),
            };
            let mut handler = ResponseHandler::new(accumulator);
            let result = self
                .connection
                .exchange(&self.request, &mut |event: TransportEvent<'_>| {
                    handler.dispatch(event)
                });

            match handler.complete(result) {
                Ok(Outcome::Done { exchange, body }) => break (exchange, body),
                Ok(Outcome::Redirect(location)) => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(HubError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    self.follow_redirect(&location)?;
                }
                Err(err) => {
                    warn!(
                        "HTTP {} request to {} failed: {err}",
                        self.request.method.as_str(),
                        self.request.url
                    );
                    return Err(err);
                }
            }
        };

        info!(
            "HTTP Status = {}, content_length = {:?}",
            exchange.status, exchange.content_length
        );

        let body = match owned_body {
            Some(body) => Cow::Owned(body),
            None => Cow::Borrowed(
                self.buffer
                    .as_deref()
                    .map(ResponseBuffer::as_bytes)
                    .unwrap_or_default(),
            ),
        };

        Ok(Response {
            status: exchange.status,
            content_length: exchange.content_length,
            body,
        })
    }

    /// Sends `body_json` as a PATCH. The status is left for the caller to
    /// judge.
    pub fn patch(&mut self, body_json: &str) -> Result<Response<'_>, HubError> {
        self.request.method = Method::Patch;
        self.request.set_header("Content-Type", "application/json");
        self.request.body = Some(body_json.as_bytes().to_vec());
        self.perform()
    }

    pub fn close(self) {
        debug!("closing connection to {}", self.request.url);
    }

    fn follow_redirect(&mut self, location: &str) -> Result<(), HubError> {
        let invalid = || HubError::InvalidRedirect(location.to_string());
        let base = Url::parse(&self.request.url).map_err(|_| invalid())?;
        let next = base.join(location).map_err(|_| invalid())?;

        // The token is only ever sent to the origin it was opened for.
        if next.origin() != base.origin() {
            warn!(
                "redirect leaves {}, dropping credentials",
                base.origin().ascii_serialization()
            );
            self.request.remove_header("Authorization");
        }

        info!("following redirect to {next}");
        self.request.url = next.to_string();
        self.request.set_header("From", REDIRECT_FROM);
        self.request.set_header("Accept", REDIRECT_ACCEPT);
        Ok(())
    }
}
