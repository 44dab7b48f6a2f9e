//! Gateway configuration types
//!
//! Loaded once at startup from TOML and read-only afterwards. Each service
//! provider is a single typed record; there is no per-provider dynamic
//! schema.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the home cluster in the provider list.
pub const LOCAL_PROVIDER: &str = "default";

/// Services the gateway knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Image,
    Volume,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Image => "image",
            ServiceType::Volume => "volume",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Directory database, e.g. `sqlite:seam.db?mode=rwc`
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Merge bare collection listings across providers
    #[serde(default)]
    pub aggregation: bool,

    /// Broadcast unresolved resource requests to all enabled providers
    #[serde(default)]
    pub search_by_broadcast: bool,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Service account used to validate caller tokens at the home cluster
    #[serde(default)]
    pub auth: AuthConfig,

    /// Supported versions, newest first; the first entry is CURRENT
    #[serde(default = "default_image_api_versions")]
    pub image_api_versions: Vec<String>,

    #[serde(default = "default_volume_api_versions")]
    pub volume_api_versions: Vec<String>,

    /// Extensions to activate, looked up in the registration table by name
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Ordered provider list; the entry named `default` is the home cluster
    #[serde(default)]
    pub service_providers: Vec<ServiceProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database_url: default_database_url(),
            aggregation: false,
            search_by_broadcast: false,
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
            image_api_versions: default_image_api_versions(),
            volume_api_versions: default_volume_api_versions(),
            extensions: Vec::new(),
            service_providers: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ServiceProviderConfig> {
        self.service_providers.iter().find(|sp| sp.name == name)
    }

    /// Providers participating for a service, in configured order.
    pub fn enabled_providers(&self, service: ServiceType) -> Vec<&ServiceProviderConfig> {
        self.service_providers
            .iter()
            .filter(|sp| sp.enabled_services.contains(&service))
            .collect()
    }

    /// Whether `name` is enabled for `service`.
    pub fn is_enabled(&self, name: &str, service: ServiceType) -> bool {
        self.provider(name)
            .map(|sp| sp.enabled_services.contains(&service))
            .unwrap_or(false)
    }

    /// Endpoint URL of `service` at provider `name`.
    pub fn endpoint(&self, name: &str, service: ServiceType) -> Result<&str> {
        let sp = self
            .provider(name)
            .ok_or_else(|| Error::Config(format!("unknown service provider '{name}'")))?;
        let endpoint = match service {
            ServiceType::Image => sp.image_endpoint.as_deref(),
            ServiceType::Volume => sp.volume_endpoint.as_deref(),
        };
        endpoint.ok_or_else(|| {
            Error::Config(format!("provider '{name}' has no {service} endpoint"))
        })
    }

    pub fn supported_versions(&self, service: ServiceType) -> &[String] {
        match service {
            ServiceType::Image => &self.image_api_versions,
            ServiceType::Volume => &self.volume_api_versions,
        }
    }
}

/// One backend cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProviderConfig {
    /// Provider name as registered with the identity federation;
    /// `default` denotes the home cluster
    pub name: String,

    /// Identity service of this provider
    pub auth_url: String,

    #[serde(default)]
    pub image_endpoint: Option<String>,

    #[serde(default)]
    pub volume_endpoint: Option<String>,

    #[serde(default = "default_enabled_services")]
    pub enabled_services: Vec<ServiceType>,

    /// Notification bus address (redis URL); omit to skip listening
    #[serde(default)]
    pub messagebus: Option<String>,
}

/// HTTP surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Externally visible base URL, used when synthesizing pagination and
    /// version links
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Hostname recorded in the hop-tracking header
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            hostname: default_hostname(),
        }
    }
}

/// Session cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

/// Service credentials presented to the home identity service when
/// validating caller tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_database_url() -> String {
    "sqlite:seam.db?mode=rwc".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_public_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "seam".to_string())
}

fn default_enabled_services() -> Vec<ServiceType> {
    vec![ServiceType::Image, ServiceType::Volume]
}

fn default_image_api_versions() -> Vec<String> {
    ["v2.3", "v2.2", "v2.1", "v2.0", "v1.1", "v1.0"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_volume_api_versions() -> Vec<String> {
    ["v3.0", "v2.0", "v1.0"].iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    600
}

fn default_cache_capacity() -> usize {
    1024
}
