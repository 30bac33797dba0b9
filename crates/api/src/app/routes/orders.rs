use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;

use pharmaflow_catalog::ProductCatalog;
use pharmaflow_core::{CustomerId, OrderId, ProductId, SellerId};
use pharmaflow_infra::projections::OrderFilter;
use pharmaflow_orders::{
    AddLine, CancelOrder, CreateOrder, MarkDelivered, MarkInTransit, OrderCommand, OrderStatus,
    RemoveLine, SetCustomer, UpdateLineQuantity,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/customer", post(set_customer))
        .route("/:id/lines", post(add_line))
        .route("/:id/lines/:line_id", put(update_line).delete(remove_line))
        .route("/:id/confirm", post(confirm_order))
        .route("/:id/in-transit", post(mark_in_transit))
        .route("/:id/delivered", post(mark_delivered))
        .route("/:id/cancel", post(cancel_order))
}

pub async fn create_order(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::CreateOrderRequest>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let customer_id = match dto::parse_optional::<CustomerId>(body.customer_id) {
        Ok(v) => v,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    };
    let seller_id = match dto::parse_optional::<SellerId>(body.seller_id) {
        Ok(v) => v,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    };

    let order_id = OrderId::new();
    let cmd = OrderCommand::CreateOrder(CreateOrder {
        order_id,
        customer_id,
        seller_id,
        delivery_address: body.delivery_address,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::CREATED)
}

/// Served from the read model, so it may trail a just-committed command.
pub async fn list_orders(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::OrderListQuery>,
) -> Response {
    let seller_id = match dto::parse_optional::<SellerId>(query.seller_id) {
        Ok(v) => v,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    };
    let status = match dto::parse_optional::<OrderStatus>(query.state) {
        Ok(v) => v,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    let orders = services.orders.list(&OrderFilter { seller_id, status });
    (StatusCode::OK, Json(orders)).into_response()
}

pub async fn get_order(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    current_order(&services, order_id, StatusCode::OK)
}

pub async fn set_customer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::SetCustomerRequest>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let customer_id: CustomerId = match errors::parse_id(&body.customer_id, "customer id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let cmd = OrderCommand::SetCustomer(SetCustomer {
        order_id,
        customer_id,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::OK)
}

/// Name and unit price are copied from the catalog at the time of adding.
pub async fn add_line(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::AddLineRequest>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let product_id: ProductId = match errors::parse_id(&body.product_id, "product id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(product) = services.catalog.get_product(&product_id) else {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "product_not_found",
            format!("product {product_id} is not in the catalog"),
        );
    };

    let cmd = OrderCommand::AddLine(AddLine {
        order_id,
        product_id,
        product_name: product.name,
        quantity: body.quantity,
        unit_price: product.price,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::CREATED)
}

pub async fn update_line(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, line_id)): Path<(String, u32)>,
    Json(body): Json<dto::UpdateLineRequest>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = OrderCommand::UpdateLineQuantity(UpdateLineQuantity {
        order_id,
        line_id,
        quantity: body.quantity,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::OK)
}

pub async fn remove_line(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, line_id)): Path<(String, u32)>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = OrderCommand::RemoveLine(RemoveLine {
        order_id,
        line_id,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::OK)
}

pub async fn confirm_order(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.confirmation.confirm(order_id).await {
        Ok(order) => (StatusCode::OK, Json(dto::OrderResponse::from(&order))).into_response(),
        Err(e) => errors::confirm_error_to_response(e),
    }
}

pub async fn mark_in_transit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = OrderCommand::MarkInTransit(MarkInTransit {
        order_id,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::OK)
}

pub async fn mark_delivered(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = OrderCommand::MarkDelivered(MarkDelivered {
        order_id,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::OK)
}

/// Stock held for a confirmed order is released by the inventory listener
/// once the cancellation reaches it.
pub async fn cancel_order(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match errors::parse_id(&id, "order id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = OrderCommand::CancelOrder(CancelOrder {
        order_id,
        occurred_at: Utc::now(),
    });
    dispatch_and_respond(&services, order_id, cmd, StatusCode::OK)
}

fn dispatch_and_respond(
    services: &AppServices,
    order_id: OrderId,
    cmd: OrderCommand,
    status: StatusCode,
) -> Response {
    if let Err(e) = services.dispatch(order_id, cmd) {
        return errors::dispatch_error_to_response(e);
    }
    current_order(services, order_id, status)
}

fn current_order(services: &AppServices, order_id: OrderId, status: StatusCode) -> Response {
    match services.load_order(order_id) {
        Ok(Some(order)) => (status, Json(dto::OrderResponse::from(&order))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "order not found"),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
