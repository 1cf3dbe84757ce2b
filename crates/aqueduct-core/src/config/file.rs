//! File-backed connection configuration
//!
//! Everything in [`ConnectionOptions`] except the credential and the
//! scheduler can be loaded from TOML and overridden from `AQUEDUCT_*`
//! environment variables.

use super::options::{
    AmqpTransportType, ClientMetadata, ConnectionOptionsBuilder, ProxyOptions, SslVerifyMode,
};
use crate::credential::{CbsAuthorizationType, TokenCredential};
use crate::reliability::{AmqpRetryOptions, RetryMode};
use crate::{AmqpError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "AQUEDUCT_";

/// Retry section of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff mode
    pub mode: RetryMode,
    /// Maximum retries after the first attempt
    pub max_retries: u32,
    /// Base delay in milliseconds
    pub delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Per-attempt timeout in milliseconds
    pub try_timeout_ms: u64,
    /// Jitter band
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = AmqpRetryOptions::default();
        Self {
            mode: defaults.mode,
            max_retries: defaults.max_retries,
            delay_ms: defaults.delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            try_timeout_ms: defaults.try_timeout.as_millis() as u64,
            jitter: defaults.jitter,
        }
    }
}

impl From<&RetryConfig> for AmqpRetryOptions {
    fn from(config: &RetryConfig) -> Self {
        AmqpRetryOptions {
            mode: config.mode,
            max_retries: config.max_retries,
            delay: Duration::from_millis(config.delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            try_timeout: Duration::from_millis(config.try_timeout_ms),
            jitter: config.jitter,
        }
    }
}

/// Serializable connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Fully qualified namespace
    pub fully_qualified_namespace: String,
    /// Port override
    #[serde(default)]
    pub port: Option<u16>,
    /// Custom endpoint `host[:port]`
    #[serde(default)]
    pub custom_endpoint_address: Option<String>,
    /// Authorization type
    pub authorization_type: CbsAuthorizationType,
    /// Authorization scope
    pub authorization_scope: String,
    /// Transport type
    #[serde(default = "default_transport_type")]
    pub transport_type: AmqpTransportType,
    /// TLS verification
    #[serde(default)]
    pub verify_mode: SslVerifyMode,
    /// Idle timeout in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Shutdown timeout in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Retry section
    #[serde(default)]
    pub retry: RetryConfig,
    /// Proxy section
    #[serde(default)]
    pub proxy: ProxyOptions,
    /// Client identification
    #[serde(default)]
    pub client: ClientMetadata,
}

fn default_transport_type() -> AmqpTransportType {
    AmqpTransportType::Amqp
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

impl ConnectionConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| AmqpError::configuration(format!("Invalid TOML: {e}")))
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AmqpError::configuration(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `AQUEDUCT_*` overrides from the process environment
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from an explicit set of variables
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "FULLY_QUALIFIED_NAMESPACE" => self.fully_qualified_namespace = value,
                "AUTHORIZATION_SCOPE" => self.authorization_scope = value,
                "CUSTOM_ENDPOINT_ADDRESS" => self.custom_endpoint_address = Some(value),
                "PORT" => self.port = Some(parse_env(&key, &value)?),
                "IDLE_TIMEOUT_MS" => self.idle_timeout_ms = parse_env(&key, &value)?,
                "SHUTDOWN_TIMEOUT_MS" => self.shutdown_timeout_ms = parse_env(&key, &value)?,
                "RETRY_MAX_RETRIES" => self.retry.max_retries = parse_env(&key, &value)?,
                "RETRY_DELAY_MS" => self.retry.delay_ms = parse_env(&key, &value)?,
                "RETRY_MAX_DELAY_MS" => self.retry.max_delay_ms = parse_env(&key, &value)?,
                "RETRY_TRY_TIMEOUT_MS" => self.retry.try_timeout_ms = parse_env(&key, &value)?,
                _ => {
                    tracing::debug!(
                        variable = %key,
                        "Ignoring unrecognised configuration override"
                    );
                }
            }
        }
        Ok(())
    }

    /// Turn the configuration into a builder; the credential is never part of a file.
    pub fn into_builder(self, credential: Arc<dyn TokenCredential>) -> ConnectionOptionsBuilder {
        let mut builder = ConnectionOptionsBuilder::default()
            .fully_qualified_namespace(self.fully_qualified_namespace)
            .credential(credential)
            .authorization_type(self.authorization_type)
            .authorization_scope(self.authorization_scope)
            .transport_type(self.transport_type)
            .verify_mode(self.verify_mode)
            .idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
            .retry_options(AmqpRetryOptions::from(&self.retry))
            .proxy_options(self.proxy)
            .client_metadata(self.client);

        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(address) = self.custom_endpoint_address {
            builder = builder.custom_endpoint_address(address);
        }
        builder
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AmqpError::configuration(format!("{key} has invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
fully_qualified_namespace = "contoso.servicebus.windows.net"
authorization_type = "json_web_token"
authorization_scope = "https://servicebus.azure.net/.default"
transport_type = "amqp_web_sockets"

[retry]
mode = "fixed"
max_retries = 5
delay_ms = 250

[client]
product = "azsdk-rust-messaging"
version = "1.2.0"
"#;

    #[test]
    fn test_parse_sample() {
        let config = ConnectionConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.transport_type, AmqpTransportType::AmqpWebSockets);
        assert_eq!(config.retry.mode, RetryMode::Fixed);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.try_timeout_ms, 60_000);
        assert_eq!(config.client.product, "azsdk-rust-messaging");
        assert_eq!(config.idle_timeout_ms, 60_000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConnectionConfig::from_toml_str(SAMPLE).unwrap();
        config
            .merge_with_vars(vec![
                ("AQUEDUCT_PORT".to_string(), "15671".to_string()),
                ("AQUEDUCT_RETRY_MAX_RETRIES".to_string(), "1".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();

        assert_eq!(config.port, Some(15671));
        assert_eq!(config.retry.max_retries, 1);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = ConnectionConfig::from_toml_str(SAMPLE).unwrap();
        let result =
            config.merge_with_vars(vec![("AQUEDUCT_PORT".to_string(), "many".to_string())]);
        assert!(matches!(result, Err(AmqpError::Configuration { .. })));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(ConnectionConfig::from_toml_str("authorization_type = 3").is_err());
    }
}
