use thiserror::Error;

/// Low-level TLS failure captured when the transport reports a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsFailure {
    pub esp_code: i32,
    pub mbedtls_code: i32,
}

impl TlsFailure {
    /// Builds the failure reported by the TLS layer, or `None` when both
    /// codes say nothing went wrong.
    pub fn from_codes(esp_code: i32, mbedtls_code: i32) -> Option<Self> {
        (esp_code != 0 || mbedtls_code != 0).then_some(Self {
            esp_code,
            mbedtls_code,
        })
    }
}

impl std::fmt::Display for TlsFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "esp error 0x{:x}, mbedtls failure 0x{:x}",
            self.esp_code, self.mbedtls_code
        )
    }
}

/// Connect, TLS or read failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
    pub tls: Option<TlsFailure>,
}

impl TransportError {
    /// Code used when the event handler asked the transport to stop.
    pub const ABORTED: i32 = -1;
    /// Code used when the connection went away before the response ended.
    pub const INCOMPLETE: i32 = -2;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            tls: None,
        }
    }

    pub fn aborted() -> Self {
        Self::new(Self::ABORTED, "aborted by response handler")
    }

    pub fn with_tls(mut self, tls: Option<TlsFailure>) -> Self {
        if self.tls.is_none() {
            self.tls = tls;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("response body is not valid JSON")]
    NotJson,
    #[error("response JSON root is not an array")]
    NotArray,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to initialise transport for `{url}`: {reason}")]
    TransportInit { url: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to allocate response buffer (declared content length: {declared:?})")]
    AllocationFailure { declared: Option<u64> },
    #[error("chunked transfer encoding is not supported")]
    ChunkedResponse,
    #[error("gave up after {0} redirects")]
    TooManyRedirects(usize),
    #[error("redirect without a usable location: `{0}`")]
    InvalidRedirect(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("hub rejected request with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}
