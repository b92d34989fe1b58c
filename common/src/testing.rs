//! In-memory transport that replays scripted responses and records requests.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{
    error::{TlsFailure, TransportError},
    transport::{Connection, Exchange, Flow, Request, Transport, TransportEvent},
};

#[derive(Debug, Clone)]
pub struct Scripted {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Vec<u8>>,
    failure: Option<TransportError>,
    fail_after_data: bool,
    tls: Option<TlsFailure>,
}

impl Scripted {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            chunks: if body.is_empty() {
                Vec::new()
            } else {
                vec![body.as_bytes().to_vec()]
            },
            failure: None,
            fail_after_data: false,
            tls: None,
        }
    }

    pub fn chunked(status: u16, body: &str) -> Self {
        let mut scripted = Self::json(status, body).without_content_length();
        scripted
            .headers
            .push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        scripted
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        let mut scripted = Self::json(status, "");
        scripted
            .headers
            .push(("Location".to_string(), location.to_string()));
        scripted
    }

    /// Fails before anything is received.
    pub fn failure(error: TransportError, tls: Option<TlsFailure>) -> Self {
        Self {
            failure: Some(error),
            tls,
            ..Self::json(0, "")
        }
    }

    /// Delivers the body, then fails instead of finishing.
    pub fn failing_after_data(mut self, error: TransportError) -> Self {
        self.failure = Some(error);
        self.fail_after_data = true;
        self
    }

    pub fn in_chunks(mut self, size: usize) -> Self {
        let body: Vec<u8> = self.chunks.concat();
        self.chunks = body.chunks(size.max(1)).map(<[u8]>::to_vec).collect();
        self
    }

    pub fn without_content_length(mut self) -> Self {
        self.headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case("content-length"));
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct Shared {
    responses: VecDeque<Scripted>,
    requests: Vec<Request>,
    connects: usize,
    closed: usize,
    refuse: bool,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    shared: Rc<RefCell<Shared>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Scripted) {
        self.shared.borrow_mut().responses.push_back(response);
    }

    pub fn refuse_connections(&self) {
        self.shared.borrow_mut().refuse = true;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.borrow().requests.clone()
    }

    pub fn connects(&self) -> usize {
        self.shared.borrow().connects
    }

    pub fn open_connections(&self) -> usize {
        let shared = self.shared.borrow();
        shared.connects - shared.closed
    }
}

impl Transport for ScriptedTransport {
    type Connection = ScriptedConnection;

    fn connect(&mut self, _url: &str) -> Result<Self::Connection, TransportError> {
        let mut shared = self.shared.borrow_mut();
        if shared.refuse {
            return Err(TransportError::new(0x101, "ESP_ERR_NO_MEM"));
        }
        shared.connects += 1;
        Ok(ScriptedConnection {
            shared: self.shared.clone(),
        })
    }
}

pub struct ScriptedConnection {
    shared: Rc<RefCell<Shared>>,
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.shared.borrow_mut().closed += 1;
    }
}

impl Connection for ScriptedConnection {
    fn exchange(
        &mut self,
        request: &Request,
        on_event: &mut dyn FnMut(TransportEvent<'_>) -> Flow,
    ) -> Result<Exchange, TransportError> {
        let script = {
            let mut shared = self.shared.borrow_mut();
            shared.requests.push(request.clone());
            shared.responses.pop_front()
        };
        let script = script.unwrap_or_else(|| {
            Scripted::failure(TransportError::new(0x7000, "no scripted response"), None)
        });

        if let (Some(error), false) = (&script.failure, script.fail_after_data) {
            on_event(TransportEvent::Error);
            on_event(TransportEvent::Disconnected { tls: script.tls });
            return Err(error.clone());
        }

        on_event(TransportEvent::Connected);
        on_event(TransportEvent::HeaderSent);
        for (key, value) in &script.headers {
            on_event(TransportEvent::HeaderReceived { key, value });
        }

        let exchange = Exchange {
            status: script.status,
            content_length: script
                .header("content-length")
                .and_then(|value| value.parse().ok()),
        };

        if (300..400).contains(&script.status) {
            if let Some(location) = script.header("location") {
                on_event(TransportEvent::Redirect { location });
                return Ok(exchange);
            }
        }

        for chunk in &script.chunks {
            if on_event(TransportEvent::DataReceived(chunk)) == Flow::Abort {
                on_event(TransportEvent::Disconnected { tls: None });
                return Err(TransportError::aborted());
            }
        }

        if let Some(error) = script.failure {
            on_event(TransportEvent::Error);
            on_event(TransportEvent::Disconnected { tls: script.tls });
            return Err(error);
        }

        on_event(TransportEvent::Finished);
        on_event(TransportEvent::Disconnected { tls: None });
        Ok(exchange)
    }
}
