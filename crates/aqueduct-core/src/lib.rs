//! Aqueduct core
//!
//! Shared foundation for the AMQP transport crates: the unified
//! [`AmqpError`] type, the retry policy engine, immutable connection
//! options with their file-backed configuration, and the credential
//! vocabulary used by claims-based security.

pub mod config;
pub mod credential;
pub mod errors;
pub mod reliability;

pub use config::{
    AmqpTransportType, ClientMetadata, ConnectionConfig, ConnectionOptions,
    ConnectionOptionsBuilder, ProxyOptions, SslVerifyMode,
};
pub use credential::{AccessToken, CbsAuthorizationType, TokenCredential};
pub use errors::{AmqpError, ErrorCondition, Result};
pub use reliability::{
    with_retry, with_retry_stream, AmqpRetryOptions, RetryMode, RetryPolicy,
};
