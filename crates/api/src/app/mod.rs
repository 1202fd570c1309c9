//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store/publisher/consumer wiring and shutdown
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router around already-built services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    with_middleware(routes::router(), services)
}

/// Wrap `router` in the request tracing, panic catching and service layers.
pub fn with_middleware(router: Router, services: Arc<AppServices>) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(errors::panic_response))
            .layer(Extension(services)),
    )
}

pub use services::{AppServices, Runtime};
