//! Name-based routing extension
//!
//! Lets a caller pick the target provider for a create request by suffixing
//! the resource name: `"name": "backup@remote1"` routes the create to
//! `remote1` as if the explicit target header had been set. An already
//! targeted request is left alone.

use http::{HeaderValue, Method};
use serde_json::Value;
use tracing::debug;

use super::{Extension, RouteSpec};
use crate::request::{RequestDescriptor, TARGET_PROVIDER_HEADER};
use crate::response::BufferedResponse;

pub struct NameRouting;

impl NameRouting {
    fn provider_from_body(body: &[u8]) -> Option<String> {
        let body: Value = serde_json::from_slice(body).ok()?;
        let resource = ["volume", "image"]
            .iter()
            .find_map(|key| body.get(*key))?;
        let name = resource.get("name")?.as_str()?;
        let parts: Vec<&str> = name.split('@').collect();
        if parts.len() == 2 {
            Some(parts[1].to_string())
        } else {
            None
        }
    }
}

impl Extension for NameRouting {
    fn name(&self) -> &'static str {
        "name_routing"
    }

    fn routes(&self) -> Vec<RouteSpec> {
        vec![
            RouteSpec::new("/volume/{version}/volumes", Method::POST),
            RouteSpec::new("/volume/{version}/{project_id}/volumes", Method::POST),
            RouteSpec::new("/image/{version}/images", Method::POST),
            RouteSpec::new("/{version}/images", Method::POST),
        ]
    }

    fn handle_request(&self, desc: &mut RequestDescriptor) -> Option<BufferedResponse> {
        if desc.target_provider().is_some() {
            return None;
        }
        if let Some(provider) = Self::provider_from_body(&desc.body) {
            if let Ok(value) = HeaderValue::from_str(&provider) {
                debug!(provider = %provider, "name routing inferred target provider");
                desc.headers.insert(TARGET_PROVIDER_HEADER, value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use serde_json::json;

    fn descriptor(body: Value, headers: HeaderMap) -> RequestDescriptor {
        RequestDescriptor::classify(
            Method::POST,
            "/volume/v2/volumes",
            None,
            headers,
            Bytes::from(body.to_string()),
            "gw1",
        )
        .unwrap()
    }

    #[test]
    fn test_name_suffix_sets_target_provider() {
        let mut desc = descriptor(
            json!({"volume": {"name": "backup@remote1", "size": 1}}),
            HeaderMap::new(),
        );
        assert!(NameRouting.handle_request(&mut desc).is_none());
        assert_eq!(desc.target_provider(), Some("remote1"));
    }

    #[test]
    fn test_plain_name_untouched() {
        let mut desc = descriptor(json!({"volume": {"name": "backup"}}), HeaderMap::new());
        NameRouting.handle_request(&mut desc);
        assert!(desc.target_provider().is_none());
    }

    #[test]
    fn test_multiple_separators_untouched() {
        let mut desc = descriptor(json!({"volume": {"name": "a@b@c"}}), HeaderMap::new());
        NameRouting.handle_request(&mut desc);
        assert!(desc.target_provider().is_none());
    }

    #[test]
    fn test_existing_target_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(TARGET_PROVIDER_HEADER, "remote2".parse().unwrap());
        let mut desc = descriptor(json!({"volume": {"name": "backup@remote1"}}), headers);
        NameRouting.handle_request(&mut desc);
        assert_eq!(desc.target_provider(), Some("remote2"));
    }

    #[test]
    fn test_image_body_key_supported() {
        let mut desc = RequestDescriptor::classify(
            Method::POST,
            "/image/v2/images",
            None,
            HeaderMap::new(),
            Bytes::from(json!({"image": {"name": "cirros@remote1"}}).to_string()),
            "gw1",
        )
        .unwrap();
        NameRouting.handle_request(&mut desc);
        assert_eq!(desc.target_provider(), Some("remote1"));
    }

    #[test]
    fn test_undecodable_body_ignored() {
        let mut desc = RequestDescriptor::classify(
            Method::POST,
            "/volume/v2/volumes",
            None,
            HeaderMap::new(),
            Bytes::from_static(b"not json"),
            "gw1",
        )
        .unwrap();
        assert!(NameRouting.handle_request(&mut desc).is_none());
        assert!(desc.target_provider().is_none());
    }
}
