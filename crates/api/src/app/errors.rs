use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use pharmaflow_infra::command_dispatcher::DispatchError;
use pharmaflow_infra::confirmation::ConfirmError;
use pharmaflow_inventory::LedgerError;
use pharmaflow_orders::LineDiagnostic;

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Like [`json_error`], plus one entry per offending order line.
pub fn json_error_with_diagnostics(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    diagnostics: &[LineDiagnostic],
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "diagnostics": diagnostics,
        })),
    )
        .into_response()
}

pub fn dispatch_error_to_response(err: DispatchError) -> Response {
    match err {
        DispatchError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        DispatchError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DispatchError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "order not found"),
        DispatchError::Deserialize(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "deserialize_error", msg)
        }
        DispatchError::Store(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        DispatchError::Publish(msg) => json_error(StatusCode::BAD_GATEWAY, "publish_error", msg),
    }
}

pub fn confirm_error_to_response(err: ConfirmError) -> Response {
    match err {
        ConfirmError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "order not found"),
        ConfirmError::Rejected(reason) => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "confirmation_rejected",
            reason.to_string(),
        ),
        ConfirmError::LinesRejected(diagnostics) => json_error_with_diagnostics(
            StatusCode::UNPROCESSABLE_ENTITY,
            "lines_rejected",
            "one or more lines cannot be confirmed",
            &diagnostics,
        ),
        ConfirmError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "inventory_unavailable", msg)
        }
        ConfirmError::Dispatch(e) => dispatch_error_to_response(e),
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> Response {
    let status = match &err {
        LedgerError::ProductNotFound(_) | LedgerError::LotNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InsufficientStock { .. } | LedgerError::InsufficientReservedStock { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LedgerError::InvalidQuantity => StatusCode::BAD_REQUEST,
        LedgerError::LotHasReservations { .. } | LedgerError::LotAlreadyExists(_) => {
            StatusCode::CONFLICT
        }
        LedgerError::Poisoned => StatusCode::SERVICE_UNAVAILABLE,
    };
    let code = match &err {
        LedgerError::ProductNotFound(_) => "product_not_found",
        LedgerError::LotNotFound(_) => "lot_not_found",
        LedgerError::InsufficientStock { .. } => "insufficient_stock",
        LedgerError::InsufficientReservedStock { .. } => "insufficient_reserved_stock",
        LedgerError::InvalidQuantity => "invalid_quantity",
        LedgerError::LotHasReservations { .. } => "lot_has_reservations",
        LedgerError::LotAlreadyExists(_) => "lot_already_exists",
        LedgerError::Poisoned => "ledger_unavailable",
    };
    json_error(status, code, err.to_string())
}

/// Parse a path or body identifier, answering 400 on failure.
pub fn parse_id<T>(raw: &str, what: &'static str) -> Result<T, Response>
where
    T: std::str::FromStr,
{
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what}")))
}
