//! Session brokerage
//!
//! The identity federation itself is an external collaborator; this module
//! consumes only its contract: resolve a session for a given target and
//! discover the projects a caller can reach at a provider. An HTTP-backed
//! implementation talks to each provider's identity service; resolved
//! sessions are held in an explicit bounded, TTL-evicted cache keyed by
//! `(provider, token, project)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::config::{CacheConfig, GatewayConfig, LOCAL_PROVIDER};
use crate::error::{Error, Result};
use crate::request::TOKEN_HEADER;

/// An authenticated context for one target cluster.
#[derive(Debug, Clone)]
pub struct Session {
    /// Token to present to the target's services
    pub token: String,
    /// Project the session is scoped to
    pub project_id: Option<String>,
}

/// Contract with the identity-federation collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Validate the caller's token at the home cluster and return a local
    /// session carrying the caller's own project.
    async fn local_session(&self, token: &str) -> Result<Session>;

    /// Obtain a session at a remote provider, scoped to `project_id` when
    /// given.
    async fn federated_session<'a>(
        &self,
        provider: &str,
        token: &str,
        project_id: Option<&'a str>,
    ) -> Result<Session>;

    /// Projects the caller's identity can reach at `provider`.
    async fn projects_at(&self, provider: &str, token: &str) -> Result<Vec<String>>;
}

/// Broker backed by each provider's identity service.
pub struct HttpSessionBroker {
    client: reqwest::Client,
    cfg: Arc<GatewayConfig>,
}

impl HttpSessionBroker {
    pub fn new(cfg: Arc<GatewayConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }

    fn auth_url(&self, provider: &str) -> Result<&str> {
        self.cfg
            .provider(provider)
            .map(|sp| sp.auth_url.as_str())
            .ok_or_else(|| Error::Config(format!("unknown service provider '{provider}'")))
    }
}

#[async_trait]
impl SessionBroker for HttpSessionBroker {
    async fn local_session(&self, token: &str) -> Result<Session> {
        let url = format!("{}/auth/tokens", self.auth_url(LOCAL_PROVIDER)?);
        debug!(url = %url, "validating caller token");
        let mut request = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .header("x-subject-token", token);
        if let (Some(username), Some(password)) =
            (&self.cfg.auth.username, &self.cfg.auth.password)
        {
            request = request.basic_auth(username, Some(password));
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Session(format!(
                "token validation failed with {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        let project_id = body
            .pointer("/token/project/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Session {
            token: token.to_string(),
            project_id,
        })
    }

    async fn federated_session<'a>(
        &self,
        provider: &str,
        token: &str,
        project_id: Option<&'a str>,
    ) -> Result<Session> {
        if provider == LOCAL_PROVIDER {
            return self.local_session(token).await;
        }
        let url = format!("{}/federation/sessions", self.auth_url(provider)?);
        debug!(provider = %provider, url = %url, "requesting federated session");
        let resp = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, token)
            .json(&serde_json::json!({ "project_id": project_id }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Session(format!(
                "federated session at '{provider}' failed with {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        let token = body
            .pointer("/session/token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Session(format!("no token in session from '{provider}'")))?
            .to_string();
        let project_id = body
            .pointer("/session/project_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| project_id.map(str::to_string));
        Ok(Session { token, project_id })
    }

    async fn projects_at(&self, provider: &str, token: &str) -> Result<Vec<String>> {
        let url = format!("{}/federation/projects", self.auth_url(provider)?);
        let resp = self.client.get(&url).header(TOKEN_HEADER, token).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Session(format!(
                "project discovery at '{provider}' failed with {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        let projects = body
            .get("projects")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|p| p.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(projects)
    }
}

type CacheKey = (String, String, Option<String>);

/// Caching decorator around any [`SessionBroker`].
///
/// Sessions are the only thing cached; project discovery always goes to
/// the identity service. Entries expire after the configured TTL, and the
/// map is pruned back under capacity on insert.
pub struct CachedSessionBroker {
    inner: Arc<dyn SessionBroker>,
    cache: DashMap<CacheKey, (Session, Instant)>,
    ttl: Duration,
    capacity: usize,
    enabled: bool,
}

impl CachedSessionBroker {
    pub fn new(inner: Arc<dyn SessionBroker>, cfg: &CacheConfig) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            ttl: Duration::from_secs(cfg.ttl_secs),
            capacity: cfg.capacity,
            enabled: cfg.enabled,
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Session> {
        if !self.enabled {
            return None;
        }
        let entry = self.cache.get(key)?;
        let (session, stored_at) = entry.value();
        if stored_at.elapsed() < self.ttl {
            Some(session.clone())
        } else {
            None
        }
    }

    fn store(&self, key: CacheKey, session: &Session) {
        if !self.enabled {
            return;
        }
        self.prune();
        self.cache.insert(key, (session.clone(), Instant::now()));
    }

    fn prune(&self) {
        self.cache.retain(|_, (_, stored_at)| stored_at.elapsed() < self.ttl);
        while self.cache.len() >= self.capacity {
            let victim = match self.cache.iter().next() {
                Some(entry) => entry.key().clone(),
                None => break,
            };
            self.cache.remove(&victim);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl SessionBroker for CachedSessionBroker {
    async fn local_session(&self, token: &str) -> Result<Session> {
        let key = (LOCAL_PROVIDER.to_string(), token.to_string(), None);
        if let Some(session) = self.lookup(&key) {
            return Ok(session);
        }
        let session = self.inner.local_session(token).await?;
        self.store(key, &session);
        Ok(session)
    }

    async fn federated_session<'a>(
        &self,
        provider: &str,
        token: &str,
        project_id: Option<&'a str>,
    ) -> Result<Session> {
        let key = (
            provider.to_string(),
            token.to_string(),
            project_id.map(str::to_string),
        );
        if let Some(session) = self.lookup(&key) {
            return Ok(session);
        }
        let session = self.inner.federated_session(provider, token, project_id).await?;
        self.store(key, &session);
        Ok(session)
    }

    async fn projects_at(&self, provider: &str, token: &str) -> Result<Vec<String>> {
        self.inner.projects_at(provider, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broker that counts how often each method is actually reached.
    struct CountingBroker {
        calls: AtomicUsize,
    }

    impl CountingBroker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionBroker for CountingBroker {
        async fn local_session(&self, token: &str) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                token: format!("validated-{token}"),
                project_id: Some("p1".into()),
            })
        }

        async fn federated_session<'a>(
            &self,
            provider: &str,
            _token: &str,
            project_id: Option<&'a str>,
        ) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                token: format!("scoped-at-{provider}"),
                project_id: project_id.map(str::to_string),
            })
        }

        async fn projects_at(&self, _provider: &str, _token: &str) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["p1".into()])
        }
    }

    fn cache_config(ttl_secs: u64, capacity: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl_secs,
            capacity,
        }
    }

    #[tokio::test]
    async fn test_session_cached_within_ttl() {
        let inner = CountingBroker::new();
        let broker = CachedSessionBroker::new(inner.clone(), &cache_config(600, 16));

        let first = broker.local_session("tok").await.unwrap();
        let second = broker.local_session("tok").await.unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // A different token is a different cache key.
        broker.local_session("other").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_federated_sessions_keyed_by_provider_and_project() {
        let inner = CountingBroker::new();
        let broker = CachedSessionBroker::new(inner.clone(), &cache_config(600, 16));

        broker.federated_session("remote1", "tok", Some("p1")).await.unwrap();
        broker.federated_session("remote1", "tok", Some("p1")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        broker.federated_session("remote1", "tok", Some("p2")).await.unwrap();
        broker.federated_session("remote2", "tok", Some("p1")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_expired_entries_refetched() {
        let inner = CountingBroker::new();
        let broker = CachedSessionBroker::new(inner.clone(), &cache_config(0, 16));

        broker.local_session("tok").await.unwrap();
        broker.local_session("tok").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_bounded() {
        let inner = CountingBroker::new();
        let broker = CachedSessionBroker::new(inner.clone(), &cache_config(600, 4));

        for i in 0..32 {
            broker.local_session(&format!("tok-{i}")).await.unwrap();
        }
        assert!(broker.len() <= 4);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_calls_through() {
        let inner = CountingBroker::new();
        let cfg = CacheConfig {
            enabled: false,
            ttl_secs: 600,
            capacity: 16,
        };
        let broker = CachedSessionBroker::new(inner.clone(), &cfg);

        broker.local_session("tok").await.unwrap();
        broker.local_session("tok").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_projects_never_cached() {
        let inner = CountingBroker::new();
        let broker = CachedSessionBroker::new(inner.clone(), &cache_config(600, 16));

        broker.projects_at("remote1", "tok").await.unwrap();
        broker.projects_at("remote1", "tok").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
