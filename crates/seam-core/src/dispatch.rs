//! Fan-out execution
//!
//! Carries out a dispatch plan: resolves a session per target, forwards
//! the request with retry, and applies the partial-failure semantics of
//! each mode. Single-target modes stream bodies through untouched;
//! fan-out modes buffer because their results must be compared or merged.
//!
//! No end-to-end deadline is imposed on a dispatch; a slow backend can
//! stall an aggregate fan-out. That property is inherited deliberately,
//! not an oversight.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::config::{GatewayConfig, ServiceType, LOCAL_PROVIDER};
use crate::error::{Error, Result};
use crate::plan::DispatchPlan;
use crate::request::{
    is_token_header, RequestDescriptor, TOKEN_HEADER, TRAVERSED_HOSTS_HEADER,
};
use crate::response::{BackendResponse, BufferedResponse};
use crate::session::SessionBroker;
use crate::versions;

/// Statuses that trigger an automatic retry of an outbound call.
const RETRY_STATUSES: [StatusCode; 3] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Total attempts per outbound call, including the first.
const RETRY_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(300);

/// Non-`x-` headers forwarded to backends.
const FORWARDED_HEADERS: [&str; 1] = ["api-version"];

/// Body of the request being forwarded.
pub enum RequestBody {
    Buffered(Bytes),
    /// Chunked transfer, consumable once; only single-target modes can
    /// carry it, and it is never retried.
    Stream(reqwest::Body),
}

/// What a dispatch produced.
pub enum Outcome {
    /// Single-backend response to stream through untouched
    Streamed(reqwest::Response),
    /// Synthesized or merged response
    Buffered(BufferedResponse),
}

/// Executes dispatch plans against the configured providers.
pub struct Executor {
    client: reqwest::Client,
    cfg: Arc<GatewayConfig>,
    broker: Arc<dyn SessionBroker>,
}

impl Executor {
    pub fn new(cfg: Arc<GatewayConfig>, broker: Arc<dyn SessionBroker>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
            broker,
        }
    }

    /// Carry out `plan` for a classified request.
    pub async fn execute(
        &self,
        desc: &RequestDescriptor,
        plan: DispatchPlan,
        body: RequestBody,
    ) -> Result<Outcome> {
        match plan {
            DispatchPlan::ListVersions => {
                let doc =
                    versions::list_versions(desc.service, &self.request_url(desc), &self.cfg);
                Ok(Outcome::Buffered(BufferedResponse::json(StatusCode::OK, &doc)))
            }
            DispatchPlan::LocalOnly => {
                self.forward_single(desc, LOCAL_PROVIDER, None, body).await
            }
            DispatchPlan::Targeted {
                provider,
                project_id,
            } => {
                self.forward_single(desc, &provider, project_id.as_deref(), body)
                    .await
            }
            // If broadcast was turned off between classification and
            // execution, search degrades to a plain local forward.
            DispatchPlan::Search if !self.cfg.search_by_broadcast => {
                self.forward_single(desc, LOCAL_PROVIDER, None, body).await
            }
            DispatchPlan::Search => self.search(desc).await.map(Outcome::Buffered),
            DispatchPlan::Aggregate => self.aggregate(desc).await.map(Outcome::Buffered),
        }
    }

    /// One call, response streamed back verbatim.
    async fn forward_single(
        &self,
        desc: &RequestDescriptor,
        provider: &str,
        project_id: Option<&str>,
        body: RequestBody,
    ) -> Result<Outcome> {
        let response = self.call_backend(desc, provider, project_id, body).await?;
        info!(
            provider = %provider,
            status = %response.status(),
            "forwarded request"
        );
        Ok(Outcome::Streamed(response))
    }

    /// Broadcast until the first 2xx; none means a synthesized 404.
    ///
    /// The home cluster is tried first on its own, preserving its
    /// priority; the remaining provider/project space then races
    /// concurrently and the first observed success wins. In-flight calls
    /// are dropped once a winner is found, which is safe because a search
    /// response is a single backend's answer.
    async fn search(&self, desc: &RequestDescriptor) -> Result<BufferedResponse> {
        if self.cfg.is_enabled(LOCAL_PROVIDER, desc.service) {
            let home = self.buffered_call(desc, LOCAL_PROVIDER, None).await;
            if home.is_success() {
                return Ok(home.into_buffered());
            }
        }

        let candidates = self.remote_candidates(desc).await;
        let mut in_flight: FuturesUnordered<_> = candidates
            .iter()
            .map(|(provider, project)| self.buffered_call(desc, provider, project.as_deref()))
            .collect();
        while let Some(result) = in_flight.next().await {
            if result.is_success() {
                return Ok(result.into_buffered());
            }
        }

        Ok(BufferedResponse::text(
            StatusCode::NOT_FOUND,
            "Resource not found at any service provider.\n",
        ))
    }

    /// Fan out to every candidate, collect everything, and resolve.
    async fn aggregate(&self, desc: &RequestDescriptor) -> Result<BufferedResponse> {
        let mut candidates: Vec<(String, Option<String>)> = Vec::new();
        if self.cfg.is_enabled(LOCAL_PROVIDER, desc.service) {
            candidates.push((LOCAL_PROVIDER.to_string(), None));
        }
        candidates.extend(self.remote_candidates(desc).await);

        let results: Vec<BackendResponse> = futures::future::join_all(
            candidates
                .iter()
                .map(|(provider, project)| self.buffered_call(desc, provider, project.as_deref())),
        )
        .await;

        let (successes, failures): (Vec<_>, Vec<_>) =
            results.into_iter().partition(BackendResponse::is_success);

        if failures.is_empty() {
            let key = desc
                .resource_type
                .as_deref()
                .ok_or_else(|| Error::MalformedRequest("listing without a key".to_string()))?;
            let merged = aggregate::merge(
                &successes,
                key,
                desc.service,
                desc.version.as_deref(),
                &desc.query,
                &self.request_url(desc),
                desc.strip_details,
            )?;
            return Ok(BufferedResponse::json(StatusCode::OK, &merged));
        }

        // Backends that merely do not hold the resource family answer 404;
        // those never outweigh a real failure elsewhere.
        let mut failures = failures;
        if failures.iter().all(|r| r.status == StatusCode::NOT_FOUND) {
            return Ok(failures.remove(0).into_buffered());
        }

        let mut non_404: Vec<BackendResponse> = failures
            .into_iter()
            .filter(|r| r.status != StatusCode::NOT_FOUND)
            .collect();
        let distinct: BTreeSet<StatusCode> = non_404.iter().map(|r| r.status).collect();
        if distinct.len() == 1 {
            return Ok(non_404.remove(0).into_buffered());
        }

        warn!(statuses = ?distinct, "conflicting backend failures during aggregation");
        Ok(BufferedResponse::text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to resolve a consistent backend response.\n",
        ))
    }

    /// Every (provider, project) pair beyond the home cluster the caller
    /// can reach for this service. Discovery failures drop the provider
    /// from the fan-out rather than aborting it.
    async fn remote_candidates(&self, desc: &RequestDescriptor) -> Vec<(String, Option<String>)> {
        let Some(token) = desc.token.as_deref() else {
            return Vec::new();
        };
        let mut candidates = Vec::new();
        for sp in self.cfg.enabled_providers(desc.service) {
            if sp.name == LOCAL_PROVIDER {
                continue;
            }
            match self.broker.projects_at(&sp.name, token).await {
                Ok(projects) => {
                    for project in projects {
                        candidates.push((sp.name.clone(), Some(project)));
                    }
                }
                Err(e) => {
                    warn!(provider = %sp.name, error = %e, "project discovery failed");
                }
            }
        }
        candidates
    }

    /// One buffered call whose failures — session, transport, or HTTP —
    /// are all captured as a failed backend result. Fan-outs must never
    /// abort on a single target.
    async fn buffered_call(
        &self,
        desc: &RequestDescriptor,
        provider: &str,
        project_id: Option<&str>,
    ) -> BackendResponse {
        let body = RequestBody::Buffered(desc.body.clone());
        match self.call_backend(desc, provider, project_id, body).await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await.unwrap_or_default();
                BackendResponse {
                    service_provider: provider.to_string(),
                    project_id: project_id.map(str::to_string),
                    status,
                    headers,
                    body,
                }
            }
            Err(e) => {
                let status = match &e {
                    Error::Session(_) => StatusCode::UNAUTHORIZED,
                    _ => StatusCode::BAD_GATEWAY,
                };
                debug!(provider = %provider, error = %e, "backend call failed");
                BackendResponse {
                    service_provider: provider.to_string(),
                    project_id: project_id.map(str::to_string),
                    status,
                    headers: HeaderMap::new(),
                    body: Bytes::from(e.to_string()),
                }
            }
        }
    }

    /// Resolve the session, build the outbound request, and send it.
    async fn call_backend(
        &self,
        desc: &RequestDescriptor,
        provider: &str,
        project_id: Option<&str>,
        body: RequestBody,
    ) -> Result<reqwest::Response> {
        let session = match desc.token.as_deref() {
            Some(token) => Some(if provider == LOCAL_PROVIDER {
                self.broker.local_session(token).await?
            } else {
                self.broker.federated_session(provider, token, project_id).await?
            }),
            None => None,
        };

        let mut headers = self.outbound_headers(desc);
        let effective_project = match &session {
            Some(session) => {
                if let Ok(value) = HeaderValue::from_str(&session.token) {
                    headers.insert(TOKEN_HEADER, value);
                }
                session.project_id.as_deref().or(project_id)
            }
            None => project_id,
        };

        let url = self.construct_url(provider, desc, effective_project)?;
        let query = self.prepare_query(&desc.query);
        eprintln!("DBG backend url = {} provider={} token_hdr={:?}", url, provider, headers.get(TOKEN_HEADER));
        debug!(method = %desc.method, url = %url, "request to backend");

        match body {
            RequestBody::Buffered(bytes) => {
                self.send_with_retry(desc, &url, headers, &query, bytes).await
            }
            RequestBody::Stream(stream) => {
                let mut request = self
                    .client
                    .request(desc.method.clone(), &url)
                    .headers(headers)
                    .body(stream);
                if !query.is_empty() {
                    request = request.query(&query);
                }
                Ok(request.send().await?)
            }
        }
    }

    /// Retry on connect failures and {500, 502, 504}, up to
    /// [`RETRY_ATTEMPTS`] total with exponential backoff.
    async fn send_with_retry(
        &self,
        desc: &RequestDescriptor,
        url: &str,
        headers: HeaderMap,
        query: &[(String, String)],
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self
                .client
                .request(desc.method.clone(), url)
                .headers(headers.clone())
                .body(body.clone());
            if !query.is_empty() {
                request = request.query(&query);
            }
            let result = request.send().await;

            let retryable = match &result {
                Ok(response) => RETRY_STATUSES.contains(&response.status()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if !retryable || attempt >= RETRY_ATTEMPTS {
                return Ok(result?);
            }

            let backoff = RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1);
            debug!(url = %url, attempt, backoff_ms = %backoff.as_millis(), "retrying backend call");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Full URL for a backend call. The image service addresses resources
    /// directly under the version; the volume service scopes every
    /// versioned path by project. An unversioned forward goes to the
    /// endpoint root, where the backend answers with its own version
    /// document.
    fn construct_url(
        &self,
        provider: &str,
        desc: &RequestDescriptor,
        project_id: Option<&str>,
    ) -> Result<String> {
        let endpoint = self.cfg.endpoint(provider, desc.service)?;
        let endpoint = endpoint.trim_end_matches('/');

        let mut segments: Vec<&str> = Vec::new();
        if let Some(version) = desc.version.as_deref() {
            segments.push(version);
            if desc.service == ServiceType::Volume {
                segments.push(project_id.ok_or_else(|| {
                    Error::Session("no project resolved for volume request".to_string())
                })?);
            }
        }
        segments.extend(desc.action.iter().map(String::as_str));

        Ok(format!("{endpoint}/{}", segments.join("/")))
    }

    /// Headers presented to a backend: the filtered caller headers plus
    /// the hop-tracking trail extended with this gateway.
    fn outbound_headers(&self, desc: &RequestDescriptor) -> HeaderMap {
        let mut headers = filter_headers(&desc.headers);
        let mut hops = desc.traversed_hosts();
        hops.push(self.cfg.server.hostname.clone());
        if let Ok(value) = HeaderValue::from_str(&hops.join(", ")) {
            headers.insert(TRAVERSED_HOSTS_HEADER, value);
        }
        eprintln!("DBG outbound traversed = {:?}", headers.get(TRAVERSED_HOSTS_HEADER));
        headers
    }

    /// Backend-local pagination is meaningless once listings are merged,
    /// so `limit` and `marker` are stripped whenever aggregation is on.
    fn prepare_query(&self, query: &[(String, String)]) -> Vec<(String, String)> {
        if !self.cfg.aggregation {
            return query.to_vec();
        }
        query
            .iter()
            .filter(|(k, _)| k != "limit" && k != "marker")
            .cloned()
            .collect()
    }

    fn request_url(&self, desc: &RequestDescriptor) -> String {
        format!(
            "{}/{}",
            self.cfg.server.public_url.trim_end_matches('/'),
            desc.path
        )
    }
}

/// Keep `Accept`, `Content-Type`, any `x-*` header that is not a token,
/// and the forwarding allowlist. Everything else — auth material,
/// hop-by-hop headers, lengths — is dropped and recomputed.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let key = name.as_str();
        let keep = key == ACCEPT.as_str()
            || key == CONTENT_TYPE.as_str()
            || (key.starts_with("x-") && !is_token_header(key))
            || FORWARDED_HEADERS.contains(&key);
        if keep {
            filtered.insert(name.clone(), value.clone());
        }
    }
    filtered
}
