//! Synthesized version-descriptor documents
//!
//! An unversioned GET on a service never reaches a backend: the gateway
//! answers with the configured supported-version list, first entry
//! CURRENT, the rest SUPPORTED, mirroring the native per-service shapes.

use serde_json::{json, Value};

use crate::config::{GatewayConfig, ServiceType};

const VOLUME_DOC_UPDATED: &str = "2016-02-08T12:20:21Z";

/// Build the version document for `service`, with self links rooted at
/// `base_url` (the caller-facing URL of the unversioned request).
pub fn list_versions(service: ServiceType, base_url: &str, cfg: &GatewayConfig) -> Value {
    let supported = cfg.supported_versions(service);
    let versions: Vec<Value> = supported
        .iter()
        .enumerate()
        .map(|(index, version)| {
            let status = if index == 0 { "CURRENT" } else { "SUPPORTED" };
            let self_link = format!("{}/{}/", base_url, major(version));
            match service {
                ServiceType::Image => json!({
                    "id": version,
                    "status": status,
                    "links": [
                        {"href": self_link, "rel": "self"}
                    ],
                }),
                ServiceType::Volume => json!({
                    "id": version,
                    "status": status,
                    "min_version": if index == 0 { bare(version) } else { "" },
                    "version": if index == 0 { bare(version) } else { "" },
                    "updated": VOLUME_DOC_UPDATED,
                    "links": [
                        {"href": "https://seam-gateway.readthedocs.io/",
                         "type": "text/html", "rel": "describedby"},
                        {"href": self_link, "rel": "self"}
                    ],
                    "media-types": [
                        {"base": "application/json",
                         "type": format!(
                             "application/vnd.seam.volume+json;version={}",
                             major_digits(version)
                         )}
                    ],
                }),
            }
        })
        .collect();

    json!({ "versions": versions })
}

/// `v3.0` -> `v3`
fn major(version: &str) -> &str {
    version.split_once('.').map(|(m, _)| m).unwrap_or(version)
}

/// `v3.0` -> `3.0`
fn bare(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// `v3.0` -> `3`
fn major_digits(version: &str) -> &str {
    bare(major(version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    #[test]
    fn test_first_entry_is_current() {
        let cfg = config();
        let doc = list_versions(ServiceType::Volume, "http://localhost:5001/volume", &cfg);
        let versions = doc["versions"].as_array().unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0]["status"], "CURRENT");
        assert_eq!(versions[0]["id"], cfg.volume_api_versions[0]);
        for entry in &versions[1..] {
            assert_eq!(entry["status"], "SUPPORTED");
        }
    }

    #[test]
    fn test_image_entries_carry_self_links() {
        let doc = list_versions(ServiceType::Image, "http://localhost:5001/image", &config());
        let versions = doc["versions"].as_array().unwrap();
        assert_eq!(versions.len(), 6);
        let first = &versions[0];
        assert_eq!(first["id"], "v2.3");
        assert_eq!(
            first["links"][0]["href"],
            "http://localhost:5001/image/v2/"
        );
        assert_eq!(first["links"][0]["rel"], "self");
        assert!(first.get("media-types").is_none());
    }

    #[test]
    fn test_volume_current_carries_min_version() {
        let doc = list_versions(ServiceType::Volume, "http://localhost:5001/volume", &config());
        let versions = doc["versions"].as_array().unwrap();
        assert_eq!(versions[0]["min_version"], "3.0");
        assert_eq!(versions[0]["version"], "3.0");
        assert_eq!(versions[1]["min_version"], "");
        assert_eq!(
            versions[0]["media-types"][0]["type"],
            "application/vnd.seam.volume+json;version=3"
        );
    }
}
