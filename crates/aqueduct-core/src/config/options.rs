//! Immutable per-connection options
//!
//! `ConnectionOptions` is assembled once through [`ConnectionOptionsBuilder`],
//! validated eagerly, and shared read-only by the pump, the CBS token
//! manager and every link created on the connection.

use super::validation::ConfigValidator;
use crate::credential::{CbsAuthorizationType, TokenCredential};
use crate::reliability::AmqpRetryOptions;
use crate::{AmqpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Sentinel used for client name and version when metadata does not supply them
pub const UNKNOWN: &str = "UNKNOWN";

/// Header key carrying the client library name
pub const NAME_KEY: &str = "name";

/// Header key carrying the client library version
pub const VERSION_KEY: &str = "version";

/// Wire transport for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmqpTransportType {
    /// AMQP over TLS on the standard port
    Amqp,
    /// AMQP tunnelled through a secure WebSocket
    AmqpWebSockets,
}

impl AmqpTransportType {
    /// Port used when the options do not override it
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Amqp => 5671,
            Self::AmqpWebSockets => 443,
        }
    }
}

/// TLS peer verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslVerifyMode {
    /// Verify the certificate chain and that the peer name matches the host
    #[default]
    VerifyPeerName,
    /// Verify the certificate chain only
    VerifyPeer,
    /// Accept any peer certificate
    AnonymousPeer,
}

/// Proxy authentication scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyAuthenticationType {
    /// No proxy authentication
    #[default]
    None,
    /// HTTP basic authentication
    Basic,
    /// HTTP digest authentication
    Digest,
}

/// Proxy configuration handed to the engine adapter
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// `host:port` of the proxy; `None` connects directly
    pub address: Option<String>,
    /// Authentication scheme
    pub authentication: ProxyAuthenticationType,
    /// Proxy user name
    pub username: Option<String>,
    /// Proxy password
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl ProxyOptions {
    /// Whether a proxy is configured
    pub fn is_proxy_address_configured(&self) -> bool {
        self.address.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.authentication != ProxyAuthenticationType::None
            && (self.username.is_none() || self.password.is_none())
        {
            return Err(AmqpError::configuration(
                "proxy authentication requires both username and password",
            ));
        }
        if self.address.is_none() && self.authentication != ProxyAuthenticationType::None {
            return Err(AmqpError::configuration(
                "proxy authentication configured without a proxy address",
            ));
        }
        Ok(())
    }
}

/// Client identification advertised in the connection's open properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientMetadata {
    /// Client library name
    pub product: String,
    /// Client library version
    pub version: String,
    /// Application identifier prepended to the user agent
    pub application_id: Option<String>,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            product: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
            application_id: None,
        }
    }
}

impl ClientMetadata {
    /// Derive product name and version from header metadata.
    ///
    /// Only the exact `name` and `version` keys are recognised; anything
    /// else leaves the [`UNKNOWN`] sentinel in place.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let lookup = |key: &str| {
            headers
                .get(key)
                .filter(|value| !value.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| UNKNOWN.to_string())
        };

        Self {
            product: lookup(NAME_KEY),
            version: lookup(VERSION_KEY),
            application_id: None,
        }
    }

    /// Attach an application id
    pub fn with_application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    /// User agent string: `[application_id ]product/version`
    pub fn user_agent(&self) -> String {
        match &self.application_id {
            Some(app) => format!("{app} {}/{}", self.product, self.version),
            None => format!("{}/{}", self.product, self.version),
        }
    }
}

/// Immutable configuration for one connection
#[derive(Clone)]
pub struct ConnectionOptions {
    connection_id: String,
    fully_qualified_namespace: String,
    port: u16,
    custom_endpoint_address: Option<String>,
    credential: Arc<dyn TokenCredential>,
    authorization_type: CbsAuthorizationType,
    authorization_scope: String,
    transport_type: AmqpTransportType,
    retry_options: AmqpRetryOptions,
    proxy_options: ProxyOptions,
    scheduler: Option<Handle>,
    client_metadata: ClientMetadata,
    verify_mode: SslVerifyMode,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ConnectionOptions {
    /// Start building options
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::default()
    }

    /// Identifier used in logs and as the AMQP container id
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Fully qualified namespace, e.g. `contoso.servicebus.windows.net`
    pub fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    /// Host name used for CBS resource strings and the open frame
    pub fn hostname(&self) -> &str {
        &self.fully_qualified_namespace
    }

    /// Port the engine connects to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Alternative `host[:port]` the engine connects to instead of the namespace
    pub fn custom_endpoint_address(&self) -> Option<&str> {
        self.custom_endpoint_address.as_deref()
    }

    /// Credential used for CBS authorization
    pub fn credential(&self) -> &Arc<dyn TokenCredential> {
        &self.credential
    }

    /// Authorization type
    pub fn authorization_type(&self) -> CbsAuthorizationType {
        self.authorization_type
    }

    /// Authorization scope (audience for JSON web tokens)
    pub fn authorization_scope(&self) -> &str {
        &self.authorization_scope
    }

    /// Transport type
    pub fn transport_type(&self) -> AmqpTransportType {
        self.transport_type
    }

    /// Retry options
    pub fn retry_options(&self) -> &AmqpRetryOptions {
        &self.retry_options
    }

    /// Proxy options
    pub fn proxy_options(&self) -> &ProxyOptions {
        &self.proxy_options
    }

    /// Runtime handle the pump and renewal timers are spawned on
    pub fn scheduler(&self) -> Option<&Handle> {
        self.scheduler.as_ref()
    }

    /// Client identification
    pub fn client_metadata(&self) -> &ClientMetadata {
        &self.client_metadata
    }

    /// Client library name, `UNKNOWN` when not supplied
    pub fn product(&self) -> &str {
        &self.client_metadata.product
    }

    /// Client library version, `UNKNOWN` when not supplied
    pub fn client_version(&self) -> &str {
        &self.client_metadata.version
    }

    /// TLS verification mode
    pub fn verify_mode(&self) -> SslVerifyMode {
        self.verify_mode
    }

    /// Local idle timeout advertised to the peer
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// How long a graceful close waits for sessions and links to acknowledge
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("connection_id", &self.connection_id)
            .field("fully_qualified_namespace", &self.fully_qualified_namespace)
            .field("port", &self.port)
            .field("custom_endpoint_address", &self.custom_endpoint_address)
            .field("authorization_type", &self.authorization_type)
            .field("authorization_scope", &self.authorization_scope)
            .field("transport_type", &self.transport_type)
            .field("retry_options", &self.retry_options)
            .field("proxy_options", &self.proxy_options)
            .field("client_metadata", &self.client_metadata)
            .field("verify_mode", &self.verify_mode)
            .field("idle_timeout", &self.idle_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConnectionOptions`]
#[derive(Default)]
pub struct ConnectionOptionsBuilder {
    connection_id: Option<String>,
    fully_qualified_namespace: Option<String>,
    port: Option<u16>,
    custom_endpoint_address: Option<String>,
    credential: Option<Arc<dyn TokenCredential>>,
    authorization_type: Option<CbsAuthorizationType>,
    authorization_scope: Option<String>,
    transport_type: Option<AmqpTransportType>,
    retry_options: Option<AmqpRetryOptions>,
    proxy_options: Option<ProxyOptions>,
    scheduler: Option<Handle>,
    client_metadata: Option<ClientMetadata>,
    verify_mode: Option<SslVerifyMode>,
    idle_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
}

impl ConnectionOptionsBuilder {
    /// Connection id (a random UUID when not set)
    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Fully qualified namespace host name (required)
    pub fn fully_qualified_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.fully_qualified_namespace = Some(namespace.into());
        self
    }

    /// Override the transport's default port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Connect to `host[:port]` instead of the namespace
    pub fn custom_endpoint_address(mut self, address: impl Into<String>) -> Self {
        self.custom_endpoint_address = Some(address.into());
        self
    }

    /// Token credential (required)
    pub fn credential(mut self, credential: Arc<dyn TokenCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Authorization type (required)
    pub fn authorization_type(mut self, authorization_type: CbsAuthorizationType) -> Self {
        self.authorization_type = Some(authorization_type);
        self
    }

    /// Authorization scope (required)
    pub fn authorization_scope(mut self, scope: impl Into<String>) -> Self {
        self.authorization_scope = Some(scope.into());
        self
    }

    /// Transport type (defaults to [`AmqpTransportType::Amqp`])
    pub fn transport_type(mut self, transport_type: AmqpTransportType) -> Self {
        self.transport_type = Some(transport_type);
        self
    }

    /// Retry options (defaults to exponential)
    pub fn retry_options(mut self, retry_options: AmqpRetryOptions) -> Self {
        self.retry_options = Some(retry_options);
        self
    }

    /// Proxy options
    pub fn proxy_options(mut self, proxy_options: ProxyOptions) -> Self {
        self.proxy_options = Some(proxy_options);
        self
    }

    /// Runtime handle for the pump and timers
    pub fn scheduler(mut self, scheduler: Handle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Client identification
    pub fn client_metadata(mut self, client_metadata: ClientMetadata) -> Self {
        self.client_metadata = Some(client_metadata);
        self
    }

    /// Client identification derived from header metadata
    pub fn client_headers(mut self, headers: &HashMap<String, String>) -> Self {
        self.client_metadata = Some(ClientMetadata::from_headers(headers));
        self
    }

    /// TLS verification mode
    pub fn verify_mode(mut self, verify_mode: SslVerifyMode) -> Self {
        self.verify_mode = Some(verify_mode);
        self
    }

    /// Local idle timeout
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Graceful shutdown timeout
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = Some(shutdown_timeout);
        self
    }

    /// Validate and build the options.
    ///
    /// Fails with [`AmqpError::Configuration`] naming every missing or
    /// invalid argument.
    pub fn build(self) -> Result<ConnectionOptions> {
        let mut validator = ConfigValidator::new();
        validator
            .non_empty(
                "fully_qualified_namespace",
                self.fully_qualified_namespace.as_deref(),
            )
            .required("credential", &self.credential)
            .required("authorization_type", &self.authorization_type)
            .non_empty("authorization_scope", self.authorization_scope.as_deref());

        if let Some(namespace) = self.fully_qualified_namespace.as_deref() {
            if !namespace.trim().is_empty() {
                validator.hostname("fully_qualified_namespace", namespace);
            }
        }

        let retry_options = self.retry_options.unwrap_or_default();
        validator.check("retry_options", retry_options.validate());

        let proxy_options = self.proxy_options.unwrap_or_default();
        validator.check("proxy_options", proxy_options.validate());

        let idle_timeout = self.idle_timeout.unwrap_or(Duration::from_secs(60));
        validator.custom(
            "idle_timeout",
            &idle_timeout,
            |timeout| !timeout.is_zero(),
            "must be greater than zero",
        );

        validator.finish()?;

        let (
            Some(fully_qualified_namespace),
            Some(credential),
            Some(authorization_type),
            Some(authorization_scope),
        ) = (
            self.fully_qualified_namespace,
            self.credential,
            self.authorization_type,
            self.authorization_scope,
        )
        else {
            return Err(AmqpError::configuration("required connection options missing"));
        };

        let transport_type = self.transport_type.unwrap_or(AmqpTransportType::Amqp);

        Ok(ConnectionOptions {
            connection_id: self
                .connection_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            fully_qualified_namespace,
            port: self.port.unwrap_or_else(|| transport_type.default_port()),
            custom_endpoint_address: self.custom_endpoint_address,
            credential,
            authorization_type,
            authorization_scope,
            transport_type,
            retry_options,
            proxy_options,
            scheduler: self.scheduler,
            client_metadata: self.client_metadata.unwrap_or_default(),
            verify_mode: self.verify_mode.unwrap_or_default(),
            idle_timeout,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(Duration::from_secs(60)),
        })
    }
}
