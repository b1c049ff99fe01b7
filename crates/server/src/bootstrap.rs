use std::sync::Arc;

use axum::Router;
use procura_core::config::{AppConfig, ConfigError, LoadOptions};
use procura_core::workflow::WorkflowEngine;
use procura_db::{
    connect_with_settings, migrations, DbPool, SqlRequestRepository, SqlUserRepository,
};
use thiserror::Error;
use tracing::info;

use crate::api::{self, ApiState};
use crate::health;
use crate::service::WorkflowService;
use crate::telemetry::TracingAuditSink;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<WorkflowService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

impl Application {
    /// The REST API plus `/health`.
    pub fn router(&self) -> Router {
        api::router(ApiState {
            service: Arc::clone(&self.service),
            api_token: self.config.server.api_token.clone(),
        })
        .merge(health::router(self.db_pool.clone()))
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let policy = config.workflow.policy();
    info!(
        event_name = "system.bootstrap.policy",
        correlation_id = "bootstrap",
        project_routing = ?policy.project_routing,
        accountant_can_reject = policy.accountant_can_reject,
        "workflow policy loaded"
    );

    let service = WorkflowService::new(
        Arc::new(SqlRequestRepository::new(db_pool.clone())),
        Arc::new(SqlUserRepository::new(db_pool.clone())),
        WorkflowEngine::new(policy),
        Arc::new(TracingAuditSink),
    );

    Ok(Application { config, db_pool, service: Arc::new(service) })
}
