use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use orderflow_core::{OrderId, ValidationErrors};

use crate::app::dto::{CreateOrderRequest, GetOrderQuery, OrderResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub async fn create_order(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed_body(rejection),
    };

    let idempotency_key = match headers.get(IDEMPOTENCY_KEY_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(key)) => Some(key),
        Some(Err(_)) => {
            let mut invalid = ValidationErrors::new();
            invalid.push("idempotencyKey", "must contain printable ASCII only");
            return errors::validation_error(&invalid);
        }
    };

    let customer_id = body.customer_id();
    match services
        .orders
        .create_order(customer_id, body.into_items(), idempotency_key)
        .await
    {
        Ok(order) => (StatusCode::CREATED, Json(OrderResponse::from(&order))).into_response(),
        Err(err) => errors::order_error_to_response(err),
    }
}

pub async fn get_order(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<GetOrderQuery>,
) -> Response {
    let id: OrderId = match query.id.as_deref().map(str::parse::<OrderId>) {
        Some(Ok(id)) => id,
        Some(Err(_)) | None => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "id must be a positive integer");
        }
    };

    match services.orders.get_order(id).await {
        Ok(order) => Json(OrderResponse::from(&order)).into_response(),
        Err(err) => errors::order_error_to_response(err),
    }
}
