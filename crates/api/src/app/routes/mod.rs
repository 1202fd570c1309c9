use axum::{
    routing::{get, post},
    Router,
};

pub mod orders;
pub mod system;

/// Router for every endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/stats", get(system::stats))
        .route("/orders", post(orders::create_order))
        .route("/orders/get", get(orders::get_order))
}
