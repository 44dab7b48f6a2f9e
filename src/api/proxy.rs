//! Catch-all proxy handler
//!
//! Builds the request descriptor, runs the extension chain, plans, and
//! executes. Single-backend responses stream straight through; everything
//! else is buffered by the core before it gets here.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode};
use tracing::{info, warn};

use seam_core::dispatch::filter_headers;
use seam_core::extend::Extension;
use seam_core::request::is_token_header;
use seam_core::{
    plan, BufferedResponse, Error, Outcome, RequestBody, RequestDescriptor,
};

use crate::server::AppState;

const METHODS_ACCEPTED: [Method; 6] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::HEAD,
    Method::PATCH,
];

pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, status = %e.status(), "request failed");
            (e.status(), format!("{e}\n")).into_response()
        }
    }
}

async fn handle(state: &AppState, request: Request) -> seam_core::Result<Response> {
    let (parts, body) = request.into_parts();
    if !METHODS_ACCEPTED.contains(&parts.method) {
        return Ok((StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n").into_response());
    }

    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    // Chunked uploads stream through to the backend; anything else is
    // buffered so fan-outs and extensions can read it.
    let chunked = parts
        .headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let (buffered, streamed) = if chunked {
        (
            Bytes::new(),
            Some(reqwest::Body::wrap_stream(body.into_data_stream())),
        )
    } else {
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::MalformedRequest(format!("unreadable request body: {e}")))?;
        (bytes, None)
    };

    let mut desc = RequestDescriptor::classify(
        parts.method.clone(),
        &path,
        query.as_deref(),
        parts.headers.clone(),
        buffered,
        &state.cfg.server.hostname,
    )?;
    info!(
        method = %desc.method,
        path = %desc.path,
        headers = ?scrubbed_headers(&desc.headers),
        "request to proxy"
    );

    let matched = state.extensions.matched(&desc);
    for extension in &matched {
        if let Some(terminal) = extension.handle_request(&mut desc) {
            info!(extension = %extension.name(), "extension answered request");
            return Ok(buffered_response(apply_response_hooks(&matched, terminal)));
        }
    }

    let mapping = match (&desc.resource_type, &desc.resource_id) {
        (Some(resource_type), Some(resource_id)) => {
            state.directory.find(resource_type, resource_id).await?
        }
        _ => None,
    };

    let dispatch_plan = plan(&desc, mapping.as_ref(), &state.cfg, state.broker.as_ref()).await?;
    let request_body = match streamed {
        Some(stream) => RequestBody::Stream(stream),
        None => RequestBody::Buffered(desc.body.clone()),
    };
    let outcome = state.executor.execute(&desc, dispatch_plan, request_body).await?;

    Ok(match outcome {
        Outcome::Streamed(response) => streamed_response(response),
        Outcome::Buffered(response) => {
            buffered_response(apply_response_hooks(&matched, response))
        }
    })
}

fn apply_response_hooks(
    matched: &[Arc<dyn Extension>],
    response: BufferedResponse,
) -> BufferedResponse {
    matched
        .iter()
        .fold(response, |response, extension| extension.handle_response(response))
}

/// Backend response passed through without buffering the body.
fn streamed_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let headers = filter_headers(response.headers());
    let mut out = Response::new(Body::from_stream(response.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

fn buffered_response(response: BufferedResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = filter_headers(&response.headers);
    out
}

/// Header view safe to log: token values are omitted.
fn scrubbed_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_token_header(name.as_str()) {
                "<token omitted>".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrubbed_headers_hide_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-token", "secret".parse().unwrap());
        headers.insert("x-service-token", "secret2".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());

        let scrubbed = scrubbed_headers(&headers);
        for (name, value) in &scrubbed {
            if name.contains("token") {
                assert_eq!(value, "<token omitted>");
            }
        }
        assert!(scrubbed
            .iter()
            .any(|(name, value)| name == "accept" && value == "application/json"));
    }

    #[test]
    fn test_buffered_response_filters_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("x-auth-token", "leaky".parse().unwrap());
        headers.insert("content-length", "5".parse().unwrap());
        let response = buffered_response(BufferedResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"body!"),
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("content-type"));
        assert!(!response.headers().contains_key("x-auth-token"));
    }
}
