//! HTTP API: server, routing, and request/response mapping.

pub mod app;

pub use app::{build_app, with_middleware, AppServices, Runtime};
