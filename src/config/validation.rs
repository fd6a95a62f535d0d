//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (bindings reference declared exchanges and queues)
//! - Validate value ranges (delays > 0, addresses parse, broker URL scheme)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// A single semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_address",
            format!("'{}' is not a socket address", config.server.bind_address),
        ));
    }
    if config.server.request_timeout_secs == 0 {
        errors.push(ValidationError::new("server.request_timeout_secs", "must be > 0"));
    }
    if config.server.body_limit_bytes == 0 {
        errors.push(ValidationError::new("server.body_limit_bytes", "must be > 0"));
    }

    match url::Url::parse(&config.broker.url) {
        Ok(url) if matches!(url.scheme(), "amqp" | "amqps" | "memory") => {}
        Ok(url) => errors.push(ValidationError::new(
            "broker.url",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new("broker.url", e.to_string())),
    }

    let tls = &config.broker.tls;
    if tls.enabled {
        for (field, value) in [
            ("broker.tls.ca_path", &tls.ca_path),
            ("broker.tls.cert_path", &tls.cert_path),
            ("broker.tls.key_path", &tls.key_path),
        ] {
            if value.as_deref().map_or(true, str::is_empty) {
                errors.push(ValidationError::new(field, "required when TLS is enabled"));
            }
        }
    }

    let retries = &config.retries;
    if retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be > 0"));
    }
    if retries.initial_delay_ms == 0 {
        errors.push(ValidationError::new("retries.initial_delay_ms", "must be > 0"));
    }
    if retries.max_delay_ms < retries.initial_delay_ms {
        errors.push(ValidationError::new(
            "retries.max_delay_ms",
            "must be >= retries.initial_delay_ms",
        ));
    }

    if config.publish.max_drain_waits == 0 {
        errors.push(ValidationError::new("publish.max_drain_waits", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!(
                "'{}' is not a socket address",
                config.observability.metrics_address
            ),
        ));
    }

    validate_topology(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_topology(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let topology = &config.topology;
    let mut exchanges = HashSet::new();
    for (i, exchange) in topology.exchanges.iter().enumerate() {
        if exchange.name.is_empty() {
            errors.push(ValidationError::new(
                format!("topology.exchanges[{}].name", i),
                "must not be empty",
            ));
        } else if !exchanges.insert(exchange.name.as_str()) {
            errors.push(ValidationError::new(
                format!("topology.exchanges[{}].name", i),
                format!("duplicate exchange '{}'", exchange.name),
            ));
        }
    }

    let mut queues = HashSet::new();
    for (i, queue) in topology.queues.iter().enumerate() {
        if queue.name.is_empty() {
            errors.push(ValidationError::new(
                format!("topology.queues[{}].name", i),
                "must not be empty",
            ));
        } else if !queues.insert(queue.name.as_str()) {
            errors.push(ValidationError::new(
                format!("topology.queues[{}].name", i),
                format!("duplicate queue '{}'", queue.name),
            ));
        }
        if let Some(dlx) = &queue.options.dead_letter_exchange {
            if !exchanges.contains(dlx.as_str()) {
                errors.push(ValidationError::new(
                    format!("topology.queues[{}].dead_letter_exchange", i),
                    format!("unknown exchange '{}'", dlx),
                ));
            }
        }
    }

    for (i, binding) in topology.bindings.iter().enumerate() {
        if !queues.contains(binding.queue.as_str()) {
            errors.push(ValidationError::new(
                format!("topology.bindings[{}].queue", i),
                format!("unknown queue '{}'", binding.queue),
            ));
        }
        if !exchanges.contains(binding.exchange.as_str()) {
            errors.push(ValidationError::new(
                format!("topology.bindings[{}].exchange", i),
                format!("unknown exchange '{}'", binding.exchange),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BindingConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&GatewayConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = GatewayConfig::default();
        config.server.bind_address = "nowhere".to_string();
        config.broker.url = "kafka://localhost".to_string();
        config.retries.max_attempts = 0;
        config.retries.max_delay_ms = 10;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "server.bind_address",
                "broker.url",
                "retries.max_attempts",
                "retries.max_delay_ms",
            ]
        );
    }

    #[test]
    fn test_tls_requires_paths() {
        let mut config = GatewayConfig::default();
        config.broker.tls.enabled = true;
        config.broker.tls.ca_path = Some("/etc/ca.pem".to_string());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "broker.tls.cert_path");
        assert_eq!(errors[1].field, "broker.tls.key_path");
    }

    #[test]
    fn test_binding_to_unknown_exchange() {
        let mut config = GatewayConfig::default();
        config.topology.bindings.push(BindingConfig {
            queue: "dlq".to_string(),
            exchange: "missing".to_string(),
            routing_key: "#".to_string(),
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "topology.bindings[2].exchange: unknown exchange 'missing'");
    }
}
