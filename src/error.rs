use http::Method;
use thiserror::Error;

use crate::hooks::HookPhase;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Coarse failure category shared by every connector built on this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    NetworkError,
    Timeout,
    AuthFailed,
    RateLimit,
    InvalidRequest,
    ServerError,
    ParsingError,
    ValidationError,
    Cancelled,
    CircuitOpen,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::AuthFailed => "AUTH_FAILED",
            Self::RateLimit => "RATE_LIMIT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ServerError => "SERVER_ERROR",
            Self::ParsingError => "PARSING_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Maps an HTTP status onto its error kind. Success statuses map to `None`.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(Self::AuthFailed),
            429 => Some(Self::RateLimit),
            408 | 425 => Some(Self::Timeout),
            500..=599 => Some(Self::ServerError),
            400..=499 => Some(Self::InvalidRequest),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to initialize http transport: {source}")]
    TransportInit {
        #[source]
        source: crate::transport::TransportError,
    },
    #[error("http transport error ({kind}) for {method} {uri} after {attempts} attempt(s): {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        attempts: usize,
        retryable: bool,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri} ({attempts} attempt(s))")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
        attempts: usize,
        retryable: bool,
    },
    #[error("retry budget exceeded ({budget_ms}ms) for {method} {uri} after {attempts} attempt(s)")]
    RetryBudgetExceeded {
        budget_ms: u128,
        method: Method,
        uri: String,
        attempts: usize,
    },
    #[error("http status error {status} for {method} {uri} after {attempts} attempt(s): {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        request_id: Option<String>,
        attempts: usize,
        retryable: bool,
        body: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        request_id: Option<String>,
        body: String,
    },
    #[error("circuit breaker is open for {method} {uri}; retry after {retry_after_ms}ms")]
    CircuitOpen {
        method: Method,
        uri: String,
        retry_after_ms: u128,
    },
    #[error("request aborted by hook for {method} {uri}: {reason}")]
    Aborted {
        reason: String,
        method: Method,
        uri: String,
    },
    #[error("request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("{phase} hook failed for {method} {uri}: {source}")]
    Hook {
        phase: HookPhase,
        method: Method,
        uri: String,
        #[source]
        source: crate::hooks::HookError,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUri { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::Serialize { .. }
            | Self::RequestBuild { .. }
            | Self::TransportInit { .. } => ErrorKind::InvalidRequest,
            Self::Transport { .. } => ErrorKind::NetworkError,
            Self::Timeout { .. } | Self::RetryBudgetExceeded { .. } => ErrorKind::Timeout,
            Self::HttpStatus { status, .. } => {
                ErrorKind::from_status(*status).unwrap_or(ErrorKind::InvalidRequest)
            }
            Self::Deserialize { .. } => ErrorKind::ParsingError,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Aborted { .. } | Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Hook { source, .. } => {
                if source.is_validation() {
                    ErrorKind::ValidationError
                } else {
                    ErrorKind::InvalidRequest
                }
            }
        }
    }

    /// Whether the client's retry policy classified the failing attempt as
    /// transient. Budget exhaustion, breaker rejections, aborts and hook
    /// failures are never retryable even though some share a kind with
    /// retryable outcomes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. }
            | Self::Timeout { retryable, .. }
            | Self::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub(crate) fn set_retryable(&mut self, value: bool) {
        if let Self::Transport { retryable, .. }
        | Self::Timeout { retryable, .. }
        | Self::HttpStatus { retryable, .. } = self
        {
            *retryable = value;
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { request_id, .. } | Self::Deserialize { request_id, .. } => {
                request_id.as_deref()
            }
            _ => None,
        }
    }

    /// Number of transport attempts made before this error surfaced.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::Transport { attempts, .. }
            | Self::Timeout { attempts, .. }
            | Self::RetryBudgetExceeded { attempts, .. }
            | Self::HttpStatus { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
