use anyhow::Context;

use pharmaflow_api::app;
use pharmaflow_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pharmaflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let app = app::build_app(&config).context("failed to wire services")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    // Listeners only start once the socket is bound and the router exists.
    let workers = app
        .services
        .start_workers()
        .context("failed to start background workers")?;

    let served = axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("shutting down background workers");
    tokio::task::spawn_blocking(move || workers.shutdown())
        .await
        .context("worker shutdown panicked")?;

    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
