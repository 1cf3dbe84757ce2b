//! Connection configuration
//!
//! Options are built in code through [`ConnectionOptionsBuilder`] or loaded
//! from TOML through [`ConnectionConfig`]; both paths run the same eager
//! validation.

pub mod file;
pub mod options;
pub mod validation;

pub use file::{ConnectionConfig, RetryConfig};
pub use options::{
    AmqpTransportType, ClientMetadata, ConnectionOptions, ConnectionOptionsBuilder,
    ProxyAuthenticationType, ProxyOptions, SslVerifyMode, NAME_KEY, UNKNOWN, VERSION_KEY,
};
pub use validation::{ConfigValidator, ValidationError};
