//! Connection option construction, validation and client identification

#![allow(clippy::unwrap_used, clippy::expect_used)]

use aqueduct_core::config::{ConnectionConfig, UNKNOWN};
use aqueduct_core::{
    AccessToken, AmqpError, AmqpRetryOptions, AmqpTransportType, CbsAuthorizationType,
    ClientMetadata, ConnectionOptions, ProxyOptions, TokenCredential,
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

struct FixedCredential;

#[async_trait]
impl TokenCredential for FixedCredential {
    async fn get_token(&self, _scopes: &[String]) -> aqueduct_core::Result<AccessToken> {
        Ok(AccessToken::new("token", OffsetDateTime::now_utc()))
    }
}

fn credential() -> Arc<dyn TokenCredential> {
    Arc::new(FixedCredential)
}

fn complete_builder() -> aqueduct_core::ConnectionOptionsBuilder {
    ConnectionOptions::builder()
        .fully_qualified_namespace("contoso.servicebus.windows.net")
        .credential(credential())
        .authorization_type(CbsAuthorizationType::SharedAccessSignature)
        .authorization_scope("https://servicebus.azure.net/.default")
}

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn port_follows_transport_type_unless_overridden() {
    let amqp = complete_builder().build().unwrap();
    assert_eq!(amqp.port(), 5671);

    let websockets = complete_builder()
        .transport_type(AmqpTransportType::AmqpWebSockets)
        .build()
        .unwrap();
    assert_eq!(websockets.port(), 443);

    let custom = complete_builder().port(15671).build().unwrap();
    assert_eq!(custom.port(), 15671);
}

#[test]
fn missing_required_arguments_fail_fast() {
    let no_host = ConnectionOptions::builder()
        .credential(credential())
        .authorization_type(CbsAuthorizationType::JsonWebToken)
        .authorization_scope("scope")
        .build();
    assert_matches!(
        no_host,
        Err(AmqpError::Configuration { ref message })
            if message.contains("fully_qualified_namespace")
    );

    let no_credential = ConnectionOptions::builder()
        .fully_qualified_namespace("contoso.servicebus.windows.net")
        .authorization_type(CbsAuthorizationType::JsonWebToken)
        .authorization_scope("scope")
        .build();
    assert_matches!(
        no_credential,
        Err(AmqpError::Configuration { ref message }) if message.contains("credential")
    );

    let no_auth_type = ConnectionOptions::builder()
        .fully_qualified_namespace("contoso.servicebus.windows.net")
        .credential(credential())
        .authorization_scope("scope")
        .build();
    assert_matches!(
        no_auth_type,
        Err(AmqpError::Configuration { ref message }) if message.contains("authorization_type")
    );

    let no_scope = ConnectionOptions::builder()
        .fully_qualified_namespace("contoso.servicebus.windows.net")
        .credential(credential())
        .authorization_type(CbsAuthorizationType::JsonWebToken)
        .build();
    assert_matches!(
        no_scope,
        Err(AmqpError::Configuration { ref message }) if message.contains("authorization_scope")
    );

    let blank_host = complete_builder().fully_qualified_namespace("  ").build();
    assert_matches!(blank_host, Err(AmqpError::Configuration { .. }));
}

#[test]
fn invalid_retry_and_proxy_options_are_rejected() {
    let retry = complete_builder()
        .retry_options(AmqpRetryOptions::fixed(Duration::ZERO, 3))
        .build();
    assert_matches!(
        retry,
        Err(AmqpError::Configuration { ref message }) if message.contains("retry_options")
    );

    let proxy = complete_builder()
        .proxy_options(ProxyOptions {
            address: Some("proxy.local:8888".to_string()),
            authentication: aqueduct_core::config::ProxyAuthenticationType::Basic,
            username: Some("user".to_string()),
            password: None,
        })
        .build();
    assert_matches!(proxy, Err(AmqpError::Configuration { .. }));
}

#[test]
fn client_identity_from_recognised_headers() {
    let metadata = ClientMetadata::from_headers(&headers(&[
        ("name", "azsdk-rust-servicebus"),
        ("version", "7.1.0"),
    ]));
    let options = complete_builder().client_metadata(metadata).build().unwrap();

    assert_eq!(options.product(), "azsdk-rust-servicebus");
    assert_eq!(options.client_version(), "7.1.0");
}

#[test]
fn client_identity_defaults_to_unknown() {
    let empty = complete_builder().client_headers(&HashMap::new()).build().unwrap();
    assert_eq!(empty.product(), UNKNOWN);
    assert_eq!(empty.client_version(), UNKNOWN);

    let mismatched = complete_builder()
        .client_headers(&headers(&[("Name", "x"), ("client-version", "1.0")]))
        .build()
        .unwrap();
    assert_eq!(mismatched.product(), UNKNOWN);
    assert_eq!(mismatched.client_version(), UNKNOWN);

    let partial = complete_builder()
        .client_headers(&headers(&[("name", "only-name")]))
        .build()
        .unwrap();
    assert_eq!(partial.product(), "only-name");
    assert_eq!(partial.client_version(), UNKNOWN);

    let unset = complete_builder().build().unwrap();
    assert_eq!(unset.product(), UNKNOWN);
}

#[test]
fn user_agent_includes_application_id() {
    let metadata = ClientMetadata::from_headers(&headers(&[("name", "sdk"), ("version", "1.0")]))
        .with_application_id("billing");
    assert_eq!(metadata.user_agent(), "billing sdk/1.0");
}

#[test]
fn config_file_round_trips_into_options() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
fully_qualified_namespace = "contoso.servicebus.windows.net"
authorization_type = "shared_access_signature"
authorization_scope = "amqp://contoso.servicebus.windows.net"
idle_timeout_ms = 20000

[retry]
mode = "exponential"
max_retries = 2
delay_ms = 100
max_delay_ms = 1000
"#
    )
    .unwrap();

    let config = ConnectionConfig::load_from_file(file.path()).unwrap();
    let options = config.into_builder(credential()).build().unwrap();

    assert_eq!(options.idle_timeout(), Duration::from_secs(20));
    assert_eq!(options.retry_options().max_retries, 2);
    assert_eq!(options.retry_options().max_delay, Duration::from_secs(1));
    assert_eq!(
        options.authorization_type(),
        CbsAuthorizationType::SharedAccessSignature
    );
    assert_eq!(options.port(), 5671);
}

#[test]
fn missing_config_file_is_a_configuration_error() {
    let result =
        ConnectionConfig::load_from_file(std::path::Path::new("/nonexistent/aqueduct.toml"));
    assert_matches!(result, Err(AmqpError::Configuration { .. }));
}
