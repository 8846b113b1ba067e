//! Error Module
//!
//! Defines the infrastructure error type used throughout the proxy and the
//! streaming error taxonomy that every stream request is resolved into before
//! it reaches the HTTP layer.

use hyper::StatusCode;
use thiserror::Error;

/// Infrastructure error type for the streaming proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Response head already sent")]
    HeadersAlreadySent,

    #[error("Mid-stream failure: {0}")]
    MidStream(MidStreamError),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the streaming proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Credential missing, invalid, expired or not allowed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no session credential presented")]
    MissingSession,

    #[error("session credential is not valid")]
    InvalidSession,

    #[error("identity '{0}' is not allowed to use this vault")]
    IdentityNotAllowed(String),

    #[error("no access token available for session")]
    NoAccessToken,

    #[error("access token refresh failed: {0}")]
    Refresh(String),
}

/// Failure resolving object metadata
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("object not found")]
    NotFound,

    #[error("credential rejected by upstream")]
    Unauthorized,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Range header cannot be satisfied against the object size
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("range not satisfiable for object of {total_size} bytes")]
    Unsatisfiable { total_size: u64 },
}

/// Failure opening the upstream byte stream (nothing sent to the client yet)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("object not found")]
    NotFound,

    #[error("credential rejected by upstream")]
    Unauthorized,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Failure after the response head was committed to the client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MidStreamError {
    #[error("upstream stream failed: {0}")]
    Upstream(String),

    #[error("upstream stream stalled for {0:?}")]
    Stalled(std::time::Duration),

    #[error("upstream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("upstream sent more than the expected {expected} bytes")]
    Overrun { expected: u64 },
}

/// Every failure a stream request can end in
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    MidStream(#[from] MidStreamError),
}

impl StreamError {
    /// HTTP status for errors raised before the response head is sent.
    /// Mid-stream errors have none: the connection is aborted instead.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            StreamError::Auth(_) => Some(StatusCode::UNAUTHORIZED),
            StreamError::Metadata(MetadataError::NotFound) => Some(StatusCode::NOT_FOUND),
            StreamError::Metadata(MetadataError::Unauthorized) => Some(StatusCode::UNAUTHORIZED),
            StreamError::Metadata(MetadataError::UpstreamUnavailable(_)) => {
                Some(StatusCode::SERVICE_UNAVAILABLE)
            }
            StreamError::Range(RangeError::Unsatisfiable { .. }) => {
                Some(StatusCode::RANGE_NOT_SATISFIABLE)
            }
            StreamError::Fetch(FetchError::NotFound) => Some(StatusCode::NOT_FOUND),
            StreamError::Fetch(FetchError::Unauthorized) => Some(StatusCode::UNAUTHORIZED),
            StreamError::Fetch(FetchError::UpstreamUnavailable(_)) => Some(StatusCode::BAD_GATEWAY),
            StreamError::MidStream(_) => None,
        }
    }

    /// Stable machine-readable code for JSON error bodies and access logs
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Auth(_) => "Unauthorized",
            StreamError::Metadata(MetadataError::NotFound) | StreamError::Fetch(FetchError::NotFound) => {
                "NotFound"
            }
            StreamError::Metadata(MetadataError::Unauthorized)
            | StreamError::Fetch(FetchError::Unauthorized) => "UpstreamUnauthorized",
            StreamError::Metadata(MetadataError::UpstreamUnavailable(_)) => "UpstreamUnavailable",
            StreamError::Range(_) => "RangeNotSatisfiable",
            StreamError::Fetch(FetchError::UpstreamUnavailable(_)) => "BadGateway",
            StreamError::MidStream(_) => "MidStreamFailure",
        }
    }

    /// Client-facing message; upstream details stay in the logs
    pub fn public_message(&self) -> &'static str {
        match self {
            StreamError::Auth(_) => "Unauthorized",
            StreamError::Metadata(MetadataError::NotFound) | StreamError::Fetch(FetchError::NotFound) => {
                "Track not found"
            }
            StreamError::Metadata(MetadataError::Unauthorized)
            | StreamError::Fetch(FetchError::Unauthorized) => "Storage credential rejected",
            StreamError::Metadata(MetadataError::UpstreamUnavailable(_)) => {
                "Storage temporarily unavailable"
            }
            StreamError::Range(_) => "Requested range not satisfiable",
            StreamError::Fetch(FetchError::UpstreamUnavailable(_)) => "Streaming failed",
            StreamError::MidStream(_) => "Streaming interrupted",
        }
    }
}

impl From<MetadataError> for FetchError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound => FetchError::NotFound,
            MetadataError::Unauthorized => FetchError::Unauthorized,
            MetadataError::UpstreamUnavailable(msg) => FetchError::UpstreamUnavailable(msg),
        }
    }
}
