//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, ledger, broker, choreography handlers, workers
//! - `routes/`: HTTP handlers, one file per area
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::config::AppConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, BackgroundWorkers, ServicesError};

/// The router plus the services behind it. The caller starts the background
/// workers (`services.start_workers()`) after binding its listener.
pub struct App {
    pub router: Router,
    pub services: Arc<AppServices>,
}

pub fn build_app(config: &AppConfig) -> Result<App, ServicesError> {
    let services = Arc::new(services::build_services(config)?);

    let router = Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_logging))
                .layer(Extension(services.clone())),
        );

    Ok(App { router, services })
}
