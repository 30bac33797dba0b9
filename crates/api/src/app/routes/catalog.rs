//! Development seed of the external product catalog.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use pharmaflow_catalog::{ProductCatalog, ProductInfo, ProductStatus};
use pharmaflow_core::ProductId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/products", post(upsert_product))
        .route("/products/:id", get(get_product))
}

pub async fn upsert_product(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::UpsertProductRequest>,
) -> Response {
    let product_id = match ProductId::parse(body.product_id) {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };
    let product = ProductInfo {
        product_id,
        name: body.name,
        price: body.price,
        status: if body.archived {
            ProductStatus::Archived
        } else {
            ProductStatus::Active
        },
    };
    services.catalog.upsert(product.clone());

    (StatusCode::OK, Json(product)).into_response()
}

pub async fn get_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let product_id: ProductId = match errors::parse_id(&id, "product id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.catalog.get_product(&product_id) {
        Some(product) => (StatusCode::OK, Json(product)).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "product not found"),
    }
}
