pub mod api;
pub mod bootstrap;
pub mod health;
pub mod service;
pub mod telemetry;

use std::future::IntoFuture;
use std::time::Duration;

use anyhow::Result;
use procura_core::config::{AppConfig, LoadOptions};

pub use bootstrap::{bootstrap, bootstrap_with_config, Application, BootstrapError};
pub use service::WorkflowService;

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    telemetry::init_logging(&config);

    let app = bootstrap_with_config(config).await?;
    serve(app, shutdown_signal()).await
}

/// Serves `app` until `shutdown` resolves, then drains in-flight calls for at
/// most `server.graceful_shutdown_secs`.
pub async fn serve<F>(app: Application, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let address = app.config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "procura-server listening"
    );

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app.router()).with_graceful_shutdown(async move {
        shutdown.await;
        let _ = drain_tx.send(());
    });

    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            let _ = drain_rx.await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "in-flight calls did not finish before the grace period"
            );
        }
    }

    app.db_pool.close().await;
    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        "procura-server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "shutdown signal received"
    );
}
