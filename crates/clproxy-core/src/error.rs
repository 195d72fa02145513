use bytes::Bytes;
use http::StatusCode;

use clproxy_protocol::claude::error::{ErrorResponse, ErrorType};
use clproxy_provider_core::ProviderError;

/// The full inbound-facing error taxonomy (spec §7). Each kind carries its
/// own HTTP status mapping and, where applicable, a Claude `ErrorType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Auth,
    Permission,
    RateLimit,
    Timeout,
    Connection,
    Upstream,
    Unknown,
    NoProvider,
    ClientDisconnect,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::Permission => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Connection | ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::NoProvider => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ClientDisconnect => StatusCode::from_u16(499).unwrap(),
            ErrorKind::Config => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn claude_error_type(self) -> ErrorType {
        match self {
            ErrorKind::InvalidRequest | ErrorKind::Config => ErrorType::InvalidRequestError,
            ErrorKind::Auth => ErrorType::AuthenticationError,
            ErrorKind::Permission => ErrorType::PermissionError,
            ErrorKind::RateLimit => ErrorType::RateLimitError,
            ErrorKind::NoProvider => ErrorType::OverloadedError,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Upstream => ErrorType::ApiError,
            ErrorKind::Unknown | ErrorKind::ClientDisconnect | ErrorKind::Internal => ErrorType::ApiError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Unknown => "unknown",
            ErrorKind::NoProvider => "no_provider",
            ErrorKind::ClientDisconnect => "client_disconnect",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

/// An error on its way back to the inbound caller. Stack traces and other
/// internal detail never reach `message` for [`ErrorKind::Internal`] - callers
/// should `tracing::error!` the underlying cause separately before
/// constructing one of these.
#[derive(Debug)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn no_provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoProvider, message)
    }

    pub fn client_disconnect() -> Self {
        Self::new(ErrorKind::ClientDisconnect, "client disconnected")
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Generic, non-leaky message for internal failures; logs should carry
    /// the real cause via `tracing::error!`, never this returned body.
    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal, "internal server error")
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// Renders the Claude-shaped `{"type": "error", "error": {...}}` body
    /// used both for non-streaming JSON errors and the pre-first-byte
    /// streaming error event (spec §7).
    pub fn to_claude_body(&self) -> Bytes {
        let response = ErrorResponse::new(self.kind.claude_error_type(), self.message.clone());
        Bytes::from(serde_json::to_vec(&response).unwrap_or_default())
    }
}

impl From<ProviderError> for ProxyError {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::Permission(_) => ErrorKind::Permission,
            ProviderError::RateLimit(_) => ErrorKind::RateLimit,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Connection(_) => ErrorKind::Connection,
            ProviderError::Upstream(_) => ErrorKind::Upstream,
            ProviderError::Unknown(_) => ErrorKind::Unknown,
        };
        Self::new(kind, err.message().to_string())
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ProxyError {}
