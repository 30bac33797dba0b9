use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use pharmaflow_core::DeliveryId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_deliveries))
        .route("/:id", get(get_delivery))
}

/// Deliveries scheduled between `from` and `to` (inclusive, either optional).
pub async fn list_deliveries(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::DeliveryListQuery>,
) -> Response {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "`from` must not be after `to`",
            );
        }
    }
    let deliveries = services.deliveries.list_by_date(query.from, query.to);
    (StatusCode::OK, Json(deliveries)).into_response()
}

pub async fn get_delivery(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let delivery_id: DeliveryId = match errors::parse_id(&id, "delivery id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.deliveries.get(delivery_id) {
        Some(delivery) => (StatusCode::OK, Json(delivery)).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "delivery not found"),
    }
}
