use axum::Router;

pub mod catalog;
pub mod deliveries;
pub mod inventory;
pub mod orders;
pub mod stream;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/catalog", catalog::router())
        .nest("/inventory", inventory::router())
        .nest("/orders", orders::router())
        .nest("/deliveries", deliveries::router())
        .nest("/stream", stream::router())
}
