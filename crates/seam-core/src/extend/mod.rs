//! Extension hook chain
//!
//! Hooks observe or rewrite the request descriptor before planning and the
//! response before it is returned. Each hook declares path-template route
//! matchers with an optional method filter; every hook whose matcher
//! matches is invoked, in registration order, not just the first. A hook
//! may return a terminal response, short-circuiting dispatch entirely.
//!
//! The registry is an explicit name-to-constructor table populated from
//! configuration; there is no dynamic discovery.

pub mod name_routing;

use std::sync::Arc;

use http::Method;
use matchit::Router;

use crate::error::{Error, Result};
use crate::request::RequestDescriptor;
use crate::response::BufferedResponse;

pub use name_routing::NameRouting;

/// One path template a hook wants to see, with an optional method filter.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    /// matchit template, e.g. `/volume/{version}/volumes`
    pub template: String,
    /// `None` matches every method
    pub method: Option<Method>,
}

impl RouteSpec {
    pub fn new(template: impl Into<String>, method: Method) -> Self {
        Self {
            template: template.into(),
            method: Some(method),
        }
    }

    pub fn any_method(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            method: None,
        }
    }
}

/// A request/response interceptor.
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    fn routes(&self) -> Vec<RouteSpec>;

    /// Observe or rewrite the descriptor before planning. Returning a
    /// response ends dispatch and that response goes back to the caller.
    fn handle_request(&self, _desc: &mut RequestDescriptor) -> Option<BufferedResponse> {
        None
    }

    /// Observe or rewrite the response before it is returned.
    fn handle_response(&self, response: BufferedResponse) -> BufferedResponse {
        response
    }
}

struct RegisteredExtension {
    extension: Arc<dyn Extension>,
    router: Router<Option<Method>>,
}

/// Registration table of active extensions, built once at startup.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: Vec<RegisteredExtension>,
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ExtensionRegistry {
    /// Build the registry from configured extension names.
    pub fn from_names(names: &[String]) -> Result<Self> {
        let mut registry = Self::default();
        for name in names {
            let extension: Arc<dyn Extension> = match name.as_str() {
                "name_routing" => Arc::new(NameRouting),
                other => return Err(Error::UnknownExtension(other.to_string())),
            };
            registry.register(extension)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, extension: Arc<dyn Extension>) -> Result<()> {
        let mut router = Router::new();
        for spec in extension.routes() {
            router.insert(spec.template.as_str(), spec.method.clone()).map_err(|e| {
                Error::Config(format!(
                    "extension '{}' route '{}': {e}",
                    extension.name(),
                    spec.template
                ))
            })?;
        }
        self.entries.push(RegisteredExtension { extension, router });
        Ok(())
    }

    /// Every registered extension whose matcher matches this request, in
    /// registration order.
    pub fn matched(&self, desc: &RequestDescriptor) -> Vec<Arc<dyn Extension>> {
        let path = format!("/{}", desc.path);
        self.entries
            .iter()
            .filter(|entry| match entry.router.at(&path) {
                Ok(matched) => matched
                    .value
                    .as_ref()
                    .map(|method| *method == desc.method)
                    .unwrap_or(true),
                Err(_) => false,
            })
            .map(|entry| entry.extension.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;

    struct Flagging;

    impl Extension for Flagging {
        fn name(&self) -> &'static str {
            "flagging"
        }

        fn routes(&self) -> Vec<RouteSpec> {
            vec![
                RouteSpec::new("/volume/{version}/volumes", Method::POST),
                RouteSpec::any_method("/image/{version}/images/{id}"),
            ]
        }
    }

    fn descriptor(method: Method, path: &str) -> RequestDescriptor {
        RequestDescriptor::classify(method, path, None, HeaderMap::new(), Bytes::new(), "gw1")
            .unwrap()
    }

    fn registry() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::default();
        registry.register(Arc::new(Flagging)).unwrap();
        registry
    }

    #[test]
    fn test_template_and_method_must_both_match() {
        let registry = registry();

        let post = descriptor(Method::POST, "/volume/v2/volumes");
        assert_eq!(registry.matched(&post).len(), 1);

        let get = descriptor(Method::GET, "/volume/v2/volumes");
        assert!(registry.matched(&get).is_empty());

        let elsewhere = descriptor(Method::POST, "/volume/v2/snapshots");
        assert!(registry.matched(&elsewhere).is_empty());
    }

    #[test]
    fn test_method_filter_optional() {
        let registry = registry();
        for method in [Method::GET, Method::DELETE] {
            let desc = descriptor(
                method,
                "/image/v2/images/6c4ae06e-14bd-422e-97af-e07223c99e18",
            );
            assert_eq!(registry.matched(&desc).len(), 1);
        }
    }

    #[test]
    fn test_unknown_extension_name_rejected() {
        let err =
            ExtensionRegistry::from_names(&["does_not_exist".to_string()]).unwrap_err();
        assert!(matches!(err, Error::UnknownExtension(_)));
    }

    #[test]
    fn test_from_names_builds_table() {
        let registry = ExtensionRegistry::from_names(&["name_routing".to_string()]).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
