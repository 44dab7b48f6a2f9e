//! Response types shared by the executor, aggregator, and extension chain.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// A fully buffered response, either synthesized by the gateway or read
/// back from a backend.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Plain-text gateway-synthesized response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(body.into()),
        }
    }

    /// JSON gateway-synthesized response.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(value.to_string()),
        }
    }
}

/// One backend's answer within a fan-out, tagged with where it came from.
/// Ephemeral, scoped to a single dispatch.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub service_provider: String,
    pub project_id: Option<String>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn into_buffered(self) -> BufferedResponse {
        BufferedResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}
