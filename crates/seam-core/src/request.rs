//! Request classification
//!
//! Parses the raw path, headers, and query string of an incoming call into
//! a [`RequestDescriptor`]. The descriptor is built exactly once per
//! request; every derived field is computed eagerly at construction and
//! never recomputed. Extension hooks may rewrite it before planning, after
//! which it is treated as immutable.
//!
//! Paths usually look like:
//! `/<service>/<version>/<project_id>/<res_type>/<res_id>` or
//! `/<service>/<version>/<res_type>/<specific action>`.

use bytes::Bytes;
use http::{HeaderMap, Method};
use uuid::Uuid;

use crate::config::ServiceType;
use crate::error::{Error, Result};

/// Header carrying the caller's bearer token.
pub const TOKEN_HEADER: &str = "x-auth-token";

/// Service-to-service token header, scrubbed like the bearer token.
pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// Explicit target provider, set by the caller or by an extension.
pub const TARGET_PROVIDER_HEADER: &str = "seam-service-provider";

/// Explicit target project, only meaningful together with the provider.
pub const TARGET_PROJECT_HEADER: &str = "seam-project-id";

/// Comma-joined list of gateway hostnames the request has traversed.
pub const TRAVERSED_HOSTS_HEADER: &str = "seam-traversed-hosts";

/// Structured view of one incoming request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub service: ServiceType,
    /// API version segment; `None` puts the request in version-listing mode
    pub version: Option<String>,
    /// Project id embedded directly after the version segment
    pub project_id: Option<String>,
    /// Remaining path segments. Still includes the resource type and id.
    pub action: Vec<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Case-insensitive header view of the original request
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
    pub token: Option<String>,
    /// Set when a bare `volumes` listing was rewritten to `volumes/detail`
    pub strip_details: bool,
    /// Original path as received, without a leading slash
    pub path: String,
}

impl RequestDescriptor {
    /// Build the descriptor for one request.
    ///
    /// `own_hostname` is this gateway's name in the hop-tracking header; a
    /// request that already lists it is rejected before any backend call.
    pub fn classify(
        method: Method,
        path: &str,
        query_string: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
        own_hostname: &str,
    ) -> Result<Self> {
        let path = path.trim_matches('/').to_string();
        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        let service = pop_service(&mut segments)?;
        let version = pop_front(&mut segments);
        let project_id = pop_front_if_id(&mut segments);
        let mut action = segments;
        let resource_type = action.first().cloned();
        let resource_id = action.get(1).filter(|s| is_well_formed_id(s)).cloned();

        let hops = traversed_hosts(&headers);
        if hops.iter().any(|h| h == own_hostname) {
            return Err(Error::LoopDetected);
        }

        let token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let query: Vec<(String, String)> = match query_string {
            Some(q) if !q.is_empty() => serde_urlencoded::from_str(q)
                .map_err(|e| Error::MalformedRequest(format!("bad query string: {e}")))?,
            _ => Vec::new(),
        };

        // A bare GET of the volume collection is rewritten to the detail
        // sub-resource so aggregation has sort metadata to work with; the
        // aggregator strips the extra fields back out.
        let strip_details = service == ServiceType::Volume
            && method == Method::GET
            && action.last().map(String::as_str) == Some("volumes");
        if strip_details {
            action.push("detail".to_string());
        }

        Ok(Self {
            method,
            service,
            version,
            project_id,
            action,
            resource_type,
            resource_id,
            headers,
            query,
            body,
            token,
            strip_details,
            path,
        })
    }

    /// Explicit target provider header, if any.
    pub fn target_provider(&self) -> Option<&str> {
        self.headers
            .get(TARGET_PROVIDER_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    /// Explicit target project header, if any.
    pub fn target_project(&self) -> Option<&str> {
        self.headers
            .get(TARGET_PROJECT_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    /// Hosts already recorded in the hop-tracking header.
    pub fn traversed_hosts(&self) -> Vec<String> {
        traversed_hosts(&self.headers)
    }
}

/// Determine the service type from the first path segment.
///
/// Legacy image clients omit the service prefix and start straight at the
/// version segment, so a version-shaped first segment means `image` and is
/// left in place for the version pop that follows.
fn pop_service(segments: &mut Vec<String>) -> Result<ServiceType> {
    match segments.first().map(String::as_str) {
        Some(s) if is_version_token(s) => Ok(ServiceType::Image),
        Some("image") => {
            segments.remove(0);
            Ok(ServiceType::Image)
        }
        Some("volume") => {
            segments.remove(0);
            Ok(ServiceType::Volume)
        }
        _ => Err(Error::UnknownService),
    }
}

fn pop_front(segments: &mut Vec<String>) -> Option<String> {
    if segments.is_empty() {
        None
    } else {
        Some(segments.remove(0))
    }
}

fn pop_front_if_id(segments: &mut Vec<String>) -> Option<String> {
    if segments.first().map(|s| is_well_formed_id(s)) == Some(true) {
        pop_front(segments)
    } else {
        None
    }
}

/// `v<digits>` with an optional dotted minor, e.g. `v2` or `v3.0`.
pub fn is_version_token(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty()
        && rest.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !rest.starts_with('.')
        && !rest.ends_with('.')
}

/// UUID in any accepted textual form; hyphens are optional.
pub fn is_well_formed_id(s: &str) -> bool {
    Uuid::try_parse(s).is_ok()
}

fn traversed_hosts(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(TRAVERSED_HOSTS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// True for headers whose value must never be forwarded or logged.
pub fn is_token_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == TOKEN_HEADER || name == SERVICE_TOKEN_HEADER
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOLUME_ID: &str = "6c4ae06e-14bd-422e-97af-e07223c99e18";
    const PROJECT_ID: &str = "319d8162b38342609f5fafe1404216b9";

    fn classify(method: Method, path: &str) -> Result<RequestDescriptor> {
        RequestDescriptor::classify(
            method,
            path,
            None,
            HeaderMap::new(),
            Bytes::new(),
            "gw1",
        )
    }

    #[test]
    fn test_volume_get_with_project_and_id() {
        let desc = classify(
            Method::GET,
            &format!("/volume/v2/{PROJECT_ID}/volumes/{VOLUME_ID}"),
        )
        .unwrap();
        assert_eq!(desc.service, ServiceType::Volume);
        assert_eq!(desc.version.as_deref(), Some("v2"));
        assert_eq!(desc.project_id.as_deref(), Some(PROJECT_ID));
        assert_eq!(desc.resource_type.as_deref(), Some("volumes"));
        assert_eq!(desc.resource_id.as_deref(), Some(VOLUME_ID));
        assert_eq!(desc.action, vec!["volumes", VOLUME_ID]);
        assert!(!desc.strip_details);
    }

    #[test]
    fn test_legacy_image_path_defaults_service() {
        let desc = classify(Method::GET, "/v2/images").unwrap();
        assert_eq!(desc.service, ServiceType::Image);
        assert_eq!(desc.version.as_deref(), Some("v2"));
        assert_eq!(desc.resource_type.as_deref(), Some("images"));
        assert!(desc.resource_id.is_none());
    }

    #[test]
    fn test_unversioned_call() {
        let desc = classify(Method::GET, "/volume").unwrap();
        assert_eq!(desc.service, ServiceType::Volume);
        assert!(desc.version.is_none());
        assert!(desc.resource_type.is_none());
        assert!(desc.action.is_empty());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let err = classify(Method::GET, "/compute/v2/servers").unwrap_err();
        assert!(matches!(err, Error::UnknownService));

        let err = classify(Method::GET, "/").unwrap_err();
        assert!(matches!(err, Error::UnknownService));
    }

    #[test]
    fn test_bare_volume_listing_rewritten_to_detail() {
        let desc = classify(Method::GET, "/volume/v3/volumes").unwrap();
        assert!(desc.strip_details);
        assert_eq!(desc.action, vec!["volumes", "detail"]);
        assert_eq!(desc.resource_type.as_deref(), Some("volumes"));

        // only GETs are rewritten
        let desc = classify(Method::POST, "/volume/v3/volumes").unwrap();
        assert!(!desc.strip_details);
        assert_eq!(desc.action, vec!["volumes"]);
    }

    #[test]
    fn test_image_listing_not_rewritten() {
        let desc = classify(Method::GET, "/image/v2/images").unwrap();
        assert!(!desc.strip_details);
        assert_eq!(desc.action, vec!["images"]);
    }

    #[test]
    fn test_resource_id_accepts_unhyphenated_uuid() {
        let bare = VOLUME_ID.replace('-', "");
        let desc = classify(Method::GET, &format!("/volume/v2/volumes/{bare}")).unwrap();
        assert_eq!(desc.resource_id.as_deref(), Some(bare.as_str()));
    }

    #[test]
    fn test_token_and_target_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "secret".parse().unwrap());
        headers.insert(TARGET_PROVIDER_HEADER, "remote1".parse().unwrap());
        let desc = RequestDescriptor::classify(
            Method::GET,
            "/volume/v2/volumes",
            None,
            headers,
            Bytes::new(),
            "gw1",
        )
        .unwrap();
        assert_eq!(desc.token.as_deref(), Some("secret"));
        assert_eq!(desc.target_provider(), Some("remote1"));
        assert!(desc.target_project().is_none());
    }

    #[test]
    fn test_query_parsing() {
        let desc = RequestDescriptor::classify(
            Method::GET,
            "/volume/v2/volumes",
            Some("limit=2&sort=size:asc"),
            HeaderMap::new(),
            Bytes::new(),
            "gw1",
        )
        .unwrap();
        assert_eq!(
            desc.query,
            vec![
                ("limit".to_string(), "2".to_string()),
                ("sort".to_string(), "size:asc".to_string())
            ]
        );
    }

    #[test]
    fn test_hop_loop_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(TRAVERSED_HOSTS_HEADER, "gw0, gw1".parse().unwrap());
        let err = RequestDescriptor::classify(
            Method::GET,
            "/volume/v2/volumes",
            None,
            headers,
            Bytes::new(),
            "gw1",
        )
        .unwrap_err();
        assert!(matches!(err, Error::LoopDetected));
    }

    #[test]
    fn test_foreign_hops_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(TRAVERSED_HOSTS_HEADER, "gw0, gw2".parse().unwrap());
        let desc = RequestDescriptor::classify(
            Method::GET,
            "/volume/v2/volumes",
            None,
            headers,
            Bytes::new(),
            "gw1",
        )
        .unwrap();
        assert_eq!(desc.traversed_hosts(), vec!["gw0", "gw2"]);
    }

    #[test]
    fn test_version_token_shapes() {
        assert!(is_version_token("v1"));
        assert!(is_version_token("v3.0"));
        assert!(!is_version_token("volume"));
        assert!(!is_version_token("v"));
        assert!(!is_version_token("v.1"));
        assert!(!is_version_token("1.0"));
    }
}
