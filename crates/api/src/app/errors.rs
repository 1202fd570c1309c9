use std::any::Any;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use orderflow_core::ValidationErrors;
use orderflow_infra::OrderError;

pub fn order_error_to_response(err: OrderError) -> Response {
    match err {
        OrderError::Validation(errors) => validation_error(&errors),
        OrderError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("order {id} not found")),
        // Store details are logged by the service; callers get a generic message.
        OrderError::Persistence(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "persistence_error",
            "failed to save order",
        ),
        OrderError::StorageUnavailable(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_unavailable",
            "order storage is unavailable",
        ),
    }
}

pub fn validation_error(errors: &ValidationErrors) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({
            "error": "invalid order",
            "code": "validation_error",
            "details": errors,
        })),
    )
        .into_response()
}

/// Body that is not JSON, or JSON of the wrong shape.
pub fn malformed_body(rejection: JsonRejection) -> Response {
    json_error(StatusCode::BAD_REQUEST, "malformed_body", rejection.body_text())
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": message.into(),
            "code": code,
        })),
    )
        .into_response()
}

/// `CatchPanicLayer` hook: a panicking handler becomes a JSON 500.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "request handler panicked");

    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
}
