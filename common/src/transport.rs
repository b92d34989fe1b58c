//! Contract between the hub client and the HTTP(S) stack underneath it.
//!
//! A transport opens a connection per request and performs one exchange at a
//! time, reporting progress through [`TransportEvent`]s. Automatic redirect
//! following must be disabled; a 3xx answer with a `Location` header is
//! reported as [`TransportEvent::Redirect`] instead.

use crate::error::{TlsFailure, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Patch => "PATCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Sets a header, replacing any existing value with the same
    /// (case-insensitive) name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent<'a> {
    Error,
    Connected,
    HeaderSent,
    HeaderReceived { key: &'a str, value: &'a str },
    DataReceived(&'a [u8]),
    Finished,
    Disconnected { tls: Option<TlsFailure> },
    Redirect { location: &'a str },
}

/// Answer of the event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop reading and fail the exchange.
    Abort,
}

/// What the transport knows once an exchange has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub status: u16,
    pub content_length: Option<u64>,
}

pub trait Connection {
    /// Performs `request` synchronously. Must stop delivering data and return
    /// an error once `on_event` answers [`Flow::Abort`].
    fn exchange(
        &mut self,
        request: &Request,
        on_event: &mut dyn FnMut(TransportEvent<'_>) -> Flow,
    ) -> Result<Exchange, TransportError>;
}

pub trait Transport {
    type Connection: Connection;

    /// Allocates the resources for one request to `url`. Dropping the
    /// returned connection releases them.
    fn connect(&mut self, url: &str) -> Result<Self::Connection, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Connection = T::Connection;

    fn connect(&mut self, url: &str) -> Result<Self::Connection, TransportError> {
        (**self).connect(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut request = Request::get("https://hub:8443/v1/devices");
        request.set_header("Accept", "application/json");
        request.set_header("accept", "text/html");

        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("ACCEPT"), Some("text/html"));
        assert_eq!(request.header("From"), None);

        request.remove_header("ACCEPT");
        assert!(request.headers.is_empty());
    }
}
