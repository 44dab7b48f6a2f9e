//! seam-core — request dispatch and response aggregation for the Seam
//! federation gateway
//!
//! A request flows through this crate in a fixed order: classification
//! ([`request`]) builds the descriptor, the extension chain ([`extend`])
//! may rewrite or answer it, planning ([`plan`]) picks a dispatch mode
//! using the resource location directory ([`directory`]), and execution
//! ([`dispatch`]) fans out to the backends, merging multi-backend listings
//! through [`aggregate`]. Sessions for remote clusters come from the
//! identity collaborator behind [`session`].

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod extend;
pub mod plan;
pub mod request;
pub mod response;
pub mod session;
pub mod versions;

pub use config::{GatewayConfig, ServiceProviderConfig, ServiceType, LOCAL_PROVIDER};
pub use directory::{Directory, ResourceMapping};
pub use dispatch::{Executor, Outcome, RequestBody};
pub use error::{Error, Result};
pub use extend::ExtensionRegistry;
pub use plan::{plan, DispatchPlan};
pub use request::RequestDescriptor;
pub use response::{BackendResponse, BufferedResponse};
pub use session::{CachedSessionBroker, HttpSessionBroker, Session, SessionBroker};
