//! HTTP surface for the Seam gateway
//!
//! A health endpoint plus a catch-all fallback that hands every other
//! request to the dispatch core.

pub mod health;
pub mod proxy;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::server::AppState;

pub use health::health_routes;

/// Create the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .fallback(proxy::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
