use procura_core::audit::{AuditEvent, AuditOutcome, AuditSink};
use procura_core::config::{AppConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Returns `false` when one is already set.
pub fn init_logging(config: &AppConfig) -> bool {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    let installed = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

/// Forwards audit events to the tracing pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        let request_id = event.request_id.map(|id| id.0);
        match event.outcome {
            AuditOutcome::Success => tracing::info!(
                event_name = %event.event_type,
                audit_event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                request_id,
                actor = %event.actor,
                category = ?event.category,
                metadata = %metadata,
                "audit"
            ),
            AuditOutcome::Rejected | AuditOutcome::Conflict | AuditOutcome::Failed => {
                tracing::warn!(
                    event_name = %event.event_type,
                    audit_event_id = %event.event_id,
                    correlation_id = %event.correlation_id,
                    request_id,
                    actor = %event.actor,
                    category = ?event.category,
                    outcome = ?event.outcome,
                    metadata = %metadata,
                    "audit"
                )
            }
        }
    }
}
