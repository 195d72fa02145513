use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Error taxonomy for upstream transport/HTTP failures (spec §4.1).
#[derive(Debug, Clone)]
pub enum ProviderError {
    InvalidRequest(String),
    Auth(String),
    Permission(String),
    RateLimit(String),
    Timeout(String),
    Connection(String),
    Upstream(String),
    Unknown(String),
}

impl ProviderError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(body),
            402 => ProviderError::Permission(body),
            429 => ProviderError::RateLimit(body),
            400..=499 => ProviderError::InvalidRequest(body),
            500..=599 => ProviderError::Upstream(body),
            _ => ProviderError::Unknown(body),
        }
    }

    /// Whether a local retry (§4.1 "at most `max_retries`") is permitted for
    /// this error on a unary call. Only transport-level transient errors
    /// qualify; HTTP-level errors are left for the Fallback Controller.
    pub fn is_locally_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Connection(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::InvalidRequest(m)
            | ProviderError::Auth(m)
            | ProviderError::Permission(m)
            | ProviderError::RateLimit(m)
            | ProviderError::Timeout(m)
            | ProviderError::Connection(m)
            | ProviderError::Upstream(m)
            | ProviderError::Unknown(m) => m,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::Auth(_) => "auth",
            ProviderError::Permission(_) => "permission",
            ProviderError::RateLimit(_) => "rate_limit",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Connection(_) => "connection",
            ProviderError::Upstream(_) => "upstream",
            ProviderError::Unknown(_) => "unknown",
        };
        write!(f, "{kind}: {}", self.message())
    }
}

impl Error for ProviderError {}
