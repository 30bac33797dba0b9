//! Inventory ledger surface: lot ingest/removal, availability, and the
//! reserve/release/debit endpoints other services call.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};

use pharmaflow_core::{LotId, ProductId};
use pharmaflow_infra::ledger::StockLedger;
use pharmaflow_infra::reservation::ReservationError;
use pharmaflow_infra::reservation::wire::{StockRequest, StockResponse};
use pharmaflow_inventory::{LedgerOutcome, LotView};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/lots", post(receive_lot))
        .route("/lots/:id", delete(remove_lot))
        .route("/products/:id", get(get_availability))
        .route("/reserve", post(reserve))
        .route("/release", post(release))
        .route("/debit", post(debit))
}

pub async fn receive_lot(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ReceiveLotRequest>,
) -> Response {
    let lot = match body.into_lot() {
        Ok(lot) => lot,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };
    let view: LotView = lot.view();

    match services.ledger.receive_lot(lot) {
        Ok(outcome) => {
            let status = match outcome {
                LedgerOutcome::Applied => StatusCode::CREATED,
                LedgerOutcome::AlreadyApplied => StatusCode::OK,
            };
            (
                status,
                Json(serde_json::json!({
                    "lot": view,
                    "outcome": outcome,
                })),
            )
                .into_response()
        }
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn remove_lot(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let lot_id: LotId = match errors::parse_id(&id, "lot id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.ledger.remove_lot(lot_id) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn get_availability(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let product_id: ProductId = match errors::parse_id(&id, "product id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.ledger.get_availability(&product_id) {
        Ok(lots) => (
            StatusCode::OK,
            Json(dto::AvailabilityResponse::new(product_id, lots)),
        )
            .into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

#[derive(Debug, Clone, Copy)]
enum StockOperation {
    Reserve,
    Release,
    Debit,
}

pub async fn reserve(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<StockRequest>,
) -> Response {
    apply_stock_operation(&services, StockOperation::Reserve, body)
}

pub async fn release(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<StockRequest>,
) -> Response {
    apply_stock_operation(&services, StockOperation::Release, body)
}

pub async fn debit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<StockRequest>,
) -> Response {
    apply_stock_operation(&services, StockOperation::Debit, body)
}

/// `200 {success:true}`, `400 {success:false, error, diagnostics}` or `503`.
fn apply_stock_operation(
    services: &AppServices,
    op: StockOperation,
    body: StockRequest,
) -> Response {
    let lines = match dto::stock_lines(&body) {
        Ok(lines) => lines,
        Err(msg) => {
            let response = StockResponse {
                error: Some("validation_error".to_string()),
                ..StockResponse::rejected(msg, Vec::new())
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let result = match op {
        StockOperation::Reserve => services.stock.reserve_lines(body.order_id, &lines),
        StockOperation::Release => services.stock.release_lines(body.order_id, &lines),
        StockOperation::Debit => services.stock.debit_lines(body.order_id, &lines),
    };

    match result {
        Ok(outcomes) => (StatusCode::OK, Json(StockResponse::applied(outcomes))).into_response(),
        Err(ReservationError::Rejected(diagnostics)) => {
            let message = format!("{} line(s) could not be applied", diagnostics.len());
            (
                StatusCode::BAD_REQUEST,
                Json(StockResponse::rejected(message, diagnostics)),
            )
                .into_response()
        }
        Err(ReservationError::Unavailable(msg)) => {
            errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable", msg)
        }
    }
}
