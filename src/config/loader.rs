//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { var: &'static str, value: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { var, value } => {
                write!(f, "Invalid value for {}: '{}'", var, value)
            }
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load, override from the process environment, and validate.
///
/// Without a path the defaults are used as the base. A `.env` file in the
/// working directory is read first if present.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    if let Ok(env_file) = dotenvy::dotenv() {
        tracing::debug!(path = ?env_file, "Loaded .env file");
    }

    let mut config = match path {
        Some(path) => parse_file(path)?,
        None => GatewayConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Parse a TOML file without overrides or validation.
pub fn parse_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Apply environment overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("GATEWAY_BIND_ADDRESS") {
        config.server.bind_address = addr;
    }
    if let Some(port) = lookup("PORT") {
        let port: u16 = parse_var("PORT", port)?;
        let host = config
            .server
            .bind_address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        config.server.bind_address = format!("{}:{}", host, port);
    }
    if let Some(level) = lookup("LOG_LEVEL") {
        config.observability.log_level = level;
    }

    if let Some((_, url)) = lookup_any(&lookup, &["BROKER_URL", "RABBITMQ_URL"]) {
        config.broker.url = url;
    }
    if let Some((var, heartbeat)) =
        lookup_any(&lookup, &["BROKER_HEARTBEAT_SECS", "RABBITMQ_HEARTBEAT"])
    {
        config.broker.heartbeat_secs = parse_var(var, heartbeat)?;
    }
    if let Some((var, enabled)) = lookup_any(&lookup, &["BROKER_TLS_ENABLED", "TLS_ENABLED"]) {
        config.broker.tls.enabled = parse_bool(var, enabled)?;
    }
    if let Some((_, path)) = lookup_any(&lookup, &["BROKER_TLS_CA_PATH", "TLS_CA_PATH"]) {
        config.broker.tls.ca_path = Some(path);
    }
    if let Some((_, path)) = lookup_any(&lookup, &["BROKER_TLS_CERT_PATH", "TLS_CERT_PATH"]) {
        config.broker.tls.cert_path = Some(path);
    }
    if let Some((_, path)) = lookup_any(&lookup, &["BROKER_TLS_KEY_PATH", "TLS_KEY_PATH"]) {
        config.broker.tls.key_path = Some(path);
    }

    if let Some((var, attempts)) = lookup_any(&lookup, &["RETRY_MAX_ATTEMPTS", "MAX_RETRIES"]) {
        config.retries.max_attempts = parse_var(var, attempts)?;
    }
    if let Some((var, delay)) =
        lookup_any(&lookup, &["RETRY_INITIAL_DELAY_MS", "INITIAL_RETRY_DELAY"])
    {
        config.retries.initial_delay_ms = parse_var(var, delay)?;
    }
    if let Some((var, delay)) = lookup_any(&lookup, &["RETRY_MAX_DELAY_MS", "MAX_RETRY_DELAY"]) {
        config.retries.max_delay_ms = parse_var(var, delay)?;
    }

    Ok(())
}

/// First variable in `names` that is set. Later names are legacy aliases.
fn lookup_any<F>(lookup: &F, names: &[&'static str]) -> Option<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    names
        .iter()
        .find_map(|name| lookup(name).map(|value| (*name, value)))
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigError::Env { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_minimal_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        fs::write(&path, "[broker]\nurl = \"memory://local\"\n").unwrap();

        let config = parse_file(&path).unwrap();
        assert_eq!(config.broker.url, "memory://local");
        assert_eq!(config.broker.heartbeat_secs, 60);
        assert_eq!(config.retries.max_attempts, 5);
        assert_eq!(config.topology.exchanges.len(), 4);
    }

    #[test]
    fn test_parse_topology_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        fs::write(
            &path,
            r#"
[[topology.exchanges]]
name = "orders"
type = "topic"

[[topology.queues]]
name = "orders.eu"
dead_letter_exchange = "orders"
auto_delete = true

[[topology.bindings]]
queue = "orders.eu"
exchange = "orders"
routing_key = "orders.eu.*"
"#,
        )
        .unwrap();

        let config = parse_file(&path).unwrap();
        assert_eq!(config.topology.exchanges.len(), 1);
        assert!(config.topology.exchanges[0].durable);
        let queue = &config.topology.queues[0];
        assert_eq!(queue.options.dead_letter_exchange.as_deref(), Some("orders"));
        assert_eq!(queue.options.auto_delete, Some(true));
        assert_eq!(queue.options.durable, None);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        fs::write(&path, "[retries]\nmax_attempts = \"five\"\n").unwrap();

        assert!(matches!(parse_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            lookup(&[
                ("PORT", "8081"),
                ("LOG_LEVEL", "debug"),
                ("BROKER_URL", "amqps://user:pw@broker:5671/%2f"),
                ("BROKER_TLS_ENABLED", "true"),
                ("BROKER_TLS_CA_PATH", "/certs/ca.pem"),
                ("RETRY_MAX_ATTEMPTS", "8"),
                ("RETRY_MAX_DELAY_MS", "120000"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.bind_address, "0.0.0.0:8081");
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.broker.url, "amqps://user:pw@broker:5671/%2f");
        assert!(config.broker.tls.enabled);
        assert_eq!(config.broker.tls.ca_path.as_deref(), Some("/certs/ca.pem"));
        assert_eq!(config.retries.max_attempts, 8);
        assert_eq!(config.retries.max_delay_ms, 120_000);
        assert_eq!(config.retries.initial_delay_ms, 1000);
    }

    #[test]
    fn test_legacy_env_names_are_accepted() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            lookup(&[
                ("RABBITMQ_URL", "amqp://legacy:5672"),
                ("RABBITMQ_HEARTBEAT", "15"),
                ("MAX_RETRIES", "3"),
                ("INITIAL_RETRY_DELAY", "500"),
                ("MAX_RETRY_DELAY", "5000"),
                ("TLS_ENABLED", "true"),
                ("TLS_CA_PATH", "/legacy/ca.pem"),
                ("TLS_CERT_PATH", "/legacy/cert.pem"),
                ("TLS_KEY_PATH", "/legacy/key.pem"),
            ]),
        )
        .unwrap();

        assert_eq!(config.broker.url, "amqp://legacy:5672");
        assert_eq!(config.broker.heartbeat_secs, 15);
        assert_eq!(config.retries.max_attempts, 3);
        assert_eq!(config.retries.initial_delay_ms, 500);
        assert_eq!(config.retries.max_delay_ms, 5000);
        assert!(config.broker.tls.enabled);
        assert_eq!(config.broker.tls.ca_path.as_deref(), Some("/legacy/ca.pem"));
        assert_eq!(config.broker.tls.cert_path.as_deref(), Some("/legacy/cert.pem"));
        assert_eq!(config.broker.tls.key_path.as_deref(), Some("/legacy/key.pem"));
    }

    #[test]
    fn test_new_env_name_wins_over_legacy() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            lookup(&[
                ("BROKER_URL", "amqp://current:5672"),
                ("RABBITMQ_URL", "amqp://legacy:5672"),
            ]),
        )
        .unwrap();
        assert_eq!(config.broker.url, "amqp://current:5672");

        let err = apply_env_overrides(&mut config, lookup(&[("MAX_RETRIES", "many")])).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for MAX_RETRIES: 'many'");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for PORT: 'http'");
    }
}
