//! Error types for seam-core
//!
//! Every error that can surface from the dispatch core, with its HTTP
//! mapping. Gateway-synthesized errors carry minimal plain-text bodies;
//! backend errors are passed through verbatim and never pass through here.

use http::StatusCode;
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// First path segment is neither a known service nor a version token
    #[error("unknown service in request path")]
    UnknownService,

    /// Request shape is invalid (e.g. versioned call without a resource type)
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Explicitly targeted provider does not exist or is not enabled for
    /// the requested service
    #[error("service provider '{0}' is not enabled for this service")]
    TargetNotEnabled(String),

    /// This gateway's hostname is already present in the hop-tracking header
    #[error("request has already traversed this gateway")]
    LoopDetected,

    /// Listing sort direction was neither `asc` nor `desc`
    #[error("invalid sort direction: {0}")]
    InvalidSortDirection(String),

    /// Listing pagination parameter could not be parsed
    #[error("invalid pagination parameter: {0}")]
    InvalidPagination(String),

    /// Session could not be resolved for a target
    #[error("session resolution failed: {0}")]
    Session(String),

    /// Extension name in configuration has no registered implementation
    #[error("unknown extension: {0}")]
    UnknownExtension(String),

    /// Directory operation referenced a mapping that does not exist
    #[error("no mapping for ({0}, {1})")]
    MappingNotFound(String, String),

    /// Lifecycle notification could not be decoded
    #[error("malformed lifecycle event: {0}")]
    MalformedEvent(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Directory database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound request failed at the transport layer
    #[error("upstream request error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Notification bus error
    #[error("notification bus error: {0}")]
    Bus(#[from] redis::RedisError),

    /// JSON encoding/decoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The HTTP status a gateway-synthesized response for this error carries.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::UnknownService => StatusCode::NOT_FOUND,
            Error::MalformedRequest(_)
            | Error::TargetNotEnabled(_)
            | Error::InvalidSortDirection(_)
            | Error::InvalidPagination(_) => StatusCode::BAD_REQUEST,
            Error::LoopDetected => StatusCode::LOOP_DETECTED,
            Error::Session(_) => StatusCode::UNAUTHORIZED,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
