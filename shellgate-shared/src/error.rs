//! Error taxonomy shared by the kernel and the agent
//!
//! Every caller-visible failure carries one `ErrorKind`, so that each
//! boundary layer (gateway API, agent API) can map it to a status code
//! and the gateway can decode errors returned by an agent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyConnected,
    CapacityExceeded,
    Unauthorized,
    RateLimited,
    Unavailable,
    Unhealthy,
    PlatformUnsupported,
    Rejected,
    Timeout,
    ExecutionFailure,
    TransportFailure,
    /// Malformed request (body, identifier)
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// HTTP status used by both REST surfaces for this kind
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyConnected => 409,
            ErrorKind::CapacityExceeded => 503,
            ErrorKind::Unauthorized => 401,
            ErrorKind::RateLimited => 429,
            ErrorKind::Unavailable | ErrorKind::Unhealthy => 503,
            ErrorKind::PlatformUnsupported => 422,
            ErrorKind::Rejected => 403,
            ErrorKind::Timeout => 504,
            // a failed command is a normal report, not a transport fault
            ErrorKind::ExecutionFailure => 200,
            ErrorKind::TransportFailure => 502,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Internal => 500,
        }
    }

    /// Best-effort classification of a bare status code (no JSON body)
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::InvalidRequest,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Rejected,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::AlreadyConnected,
            422 => ErrorKind::PlatformUnsupported,
            429 => ErrorKind::RateLimited,
            503 => ErrorKind::Unavailable,
            504 => ErrorKind::Timeout,
            _ => ErrorKind::TransportFailure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyConnected => "already_connected",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Unhealthy => "unhealthy",
            ErrorKind::PlatformUnsupported => "platform_unsupported",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionFailure => "execution_failure",
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body returned by both REST surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// Partial output captured before a timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: String) -> Self {
        if !output.is_empty() {
            self.output = Some(output);
        }
        self
    }
}
