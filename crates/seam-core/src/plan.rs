//! Dispatch planning
//!
//! Decides how a classified request reaches the backends. The precedence
//! below is a hard contract, evaluated top to bottom, first match wins:
//!
//! 1. unversioned        -> ListVersions (LocalOnly without aggregation)
//! 2. no resource type   -> 400
//! 3. explicit target    -> Targeted
//! 4. directory hit      -> Targeted
//! 5. aggregate-eligible -> Aggregate (LocalOnly without aggregation)
//! 6. everything else    -> Search (LocalOnly without broadcast)

use http::Method;

use crate::config::{GatewayConfig, LOCAL_PROVIDER};
use crate::directory::ResourceMapping;
use crate::error::{Error, Result};
use crate::request::RequestDescriptor;
use crate::session::SessionBroker;

/// Resource kinds whose bare collection listing may be merged across
/// providers.
pub const AGGREGATE_RESOURCES: [&str; 3] = ["images", "volumes", "snapshots"];

/// How the executor should carry out one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Synthesize the version-descriptor document locally
    ListVersions,
    /// Single call to the home cluster
    LocalOnly,
    /// Single call to a known (provider, project)
    Targeted {
        provider: String,
        project_id: Option<String>,
    },
    /// Fan out to all enabled providers, merge every success
    Aggregate,
    /// Fan out to all enabled providers, first success wins
    Search,
}

/// Choose the dispatch plan for a classified request.
///
/// `mapping` is the directory lookup result for the request's resource id,
/// if it has one; the caller performs the lookup so planning itself stays
/// free of storage concerns.
pub async fn plan(
    desc: &RequestDescriptor,
    mapping: Option<&ResourceMapping>,
    cfg: &GatewayConfig,
    broker: &dyn SessionBroker,
) -> Result<DispatchPlan> {
    if desc.version.is_none() {
        return Ok(if cfg.aggregation {
            DispatchPlan::ListVersions
        } else {
            DispatchPlan::LocalOnly
        });
    }

    if desc.resource_type.is_none() {
        return Err(Error::MalformedRequest(
            "versioned request without a resource type".to_string(),
        ));
    }

    if let Some(provider) = desc.target_provider() {
        if !cfg.is_enabled(provider, desc.service) {
            return Err(Error::TargetNotEnabled(provider.to_string()));
        }
        let project_id = match desc.target_project() {
            Some(project) => Some(project.to_string()),
            None if provider != LOCAL_PROVIDER => {
                let token = desc.token.as_deref().ok_or_else(|| {
                    Error::Session("project discovery requires a token".to_string())
                })?;
                let project = broker
                    .projects_at(provider, token)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::Session(format!("no accessible projects at '{provider}'"))
                    })?;
                Some(project)
            }
            None => None,
        };
        return Ok(DispatchPlan::Targeted {
            provider: provider.to_string(),
            project_id,
        });
    }

    if let Some(mapping) = mapping {
        return Ok(DispatchPlan::Targeted {
            provider: mapping.service_provider.clone(),
            project_id: Some(mapping.project_id.clone()),
        });
    }

    if is_aggregate_request(desc) {
        return Ok(if cfg.aggregation {
            DispatchPlan::Aggregate
        } else {
            DispatchPlan::LocalOnly
        });
    }

    Ok(if cfg.search_by_broadcast {
        DispatchPlan::Search
    } else {
        DispatchPlan::LocalOnly
    })
}

/// A GET of a bare aggregate-eligible collection.
pub fn is_aggregate_request(desc: &RequestDescriptor) -> bool {
    desc.resource_id.is_none()
        && desc.method == Method::GET
        && desc
            .action
            .first()
            .map(|a| AGGREGATE_RESOURCES.contains(&a.as_str()))
            .unwrap_or(false)
}
