use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use procura_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub value: String,
    pub source: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            )
        }
    };

    let entries = effective_entries(&config);
    match serde_json::to_value(&entries) {
        Ok(data) => CommandResult::success_with(
            "config",
            "effective config (source precedence: env > file > default)",
            Some(data),
        ),
        Err(error) => CommandResult::failure("config", "serialization", error.to_string(), 1),
    }
}

/// Every effective setting with where it came from. Secrets are redacted.
pub fn effective_entries(config: &AppConfig) -> Vec<ConfigEntry> {
    let path = detect_config_path();
    let doc = load_config_file_doc(path.as_deref());
    let entry = |key: &'static str, value: String, env_key: &str| ConfigEntry {
        key,
        value,
        source: field_source(key, env_key, doc.as_ref(), path.as_deref()),
    };

    vec![
        entry("database.url", config.database.url.clone(), "PROCURA_DATABASE_URL"),
        entry(
            "database.max_connections",
            config.database.max_connections.to_string(),
            "PROCURA_DATABASE_MAX_CONNECTIONS",
        ),
        entry(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "PROCURA_DATABASE_TIMEOUT_SECS",
        ),
        entry("server.bind_address", config.server.bind_address.clone(), "PROCURA_SERVER_BIND_ADDRESS"),
        entry("server.port", config.server.port.to_string(), "PROCURA_SERVER_PORT"),
        entry(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "PROCURA_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        entry("server.api_token", redact(config.server.api_token.as_ref()), "PROCURA_SERVER_API_TOKEN"),
        entry("backend.base_url", config.backend.base_url.clone(), "PROCURA_BACKEND_BASE_URL"),
        entry(
            "backend.api_token",
            redact(config.backend.api_token.as_ref()),
            "PROCURA_BACKEND_API_TOKEN",
        ),
        entry(
            "backend.timeout_secs",
            config.backend.timeout_secs.to_string(),
            "PROCURA_BACKEND_TIMEOUT_SECS",
        ),
        entry(
            "workflow.project_routing",
            format!("{:?}", config.workflow.project_routing).to_lowercase(),
            "PROCURA_WORKFLOW_PROJECT_ROUTING",
        ),
        entry(
            "workflow.accountant_can_reject",
            config.workflow.accountant_can_reject.to_string(),
            "PROCURA_WORKFLOW_ACCOUNTANT_CAN_REJECT",
        ),
        entry("logging.level", config.logging.level.clone(), "PROCURA_LOGGING_LEVEL"),
        entry(
            "logging.format",
            format!("{:?}", config.logging.format).to_lowercase(),
            "PROCURA_LOGGING_FORMAT",
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["procura.toml", "config/procura.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact(secret: Option<&SecretString>) -> String {
    match secret {
        None => "<unset>".to_string(),
        Some(secret) if secret.expose_secret().trim().is_empty() => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
