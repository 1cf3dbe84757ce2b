//! Unified error system for the AMQP core
//!
//! A single error type covers every failure surfaced by connections,
//! sessions, links, the CBS token manager, request-response channels and the
//! transaction coordinator. Each variant knows whether the retry policy
//! engine may recover from it locally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// AMQP error conditions reported by a peer on detach, end, close or
/// rejected dispositions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCondition {
    /// `amqp:internal-error`
    InternalError,
    /// `amqp:not-found`
    NotFound,
    /// `amqp:unauthorized-access`
    UnauthorizedAccess,
    /// `amqp:resource-limit-exceeded`
    ResourceLimitExceeded,
    /// `amqp:not-allowed`
    NotAllowed,
    /// `amqp:not-implemented`
    NotImplemented,
    /// `amqp:connection:forced`
    ConnectionForced,
    /// `amqp:connection:framing-error`
    FramingError,
    /// `amqp:link:detach-forced`
    LinkDetachForced,
    /// `amqp:link:stolen`
    LinkStolen,
    /// `amqp:transaction:unknown-id`
    TransactionUnknownId,
    /// `amqp:transaction:rollback`
    TransactionRollback,
    /// `amqp:transaction:timeout`
    TransactionTimeout,
    /// `com.microsoft:server-busy`
    ServerBusy,
    /// `com.microsoft:timeout`
    Timeout,
    /// Any condition symbol not listed above
    Other(String),
}

impl ErrorCondition {
    /// Parse a condition symbol as carried on the wire.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "amqp:internal-error" => Self::InternalError,
            "amqp:not-found" => Self::NotFound,
            "amqp:unauthorized-access" => Self::UnauthorizedAccess,
            "amqp:resource-limit-exceeded" => Self::ResourceLimitExceeded,
            "amqp:not-allowed" => Self::NotAllowed,
            "amqp:not-implemented" => Self::NotImplemented,
            "amqp:connection:forced" => Self::ConnectionForced,
            "amqp:connection:framing-error" => Self::FramingError,
            "amqp:link:detach-forced" => Self::LinkDetachForced,
            "amqp:link:stolen" => Self::LinkStolen,
            "amqp:transaction:unknown-id" => Self::TransactionUnknownId,
            "amqp:transaction:rollback" => Self::TransactionRollback,
            "amqp:transaction:timeout" => Self::TransactionTimeout,
            "com.microsoft:server-busy" => Self::ServerBusy,
            "com.microsoft:timeout" => Self::Timeout,
            other => Self::Other(other.to_string()),
        }
    }

    /// The condition symbol.
    pub fn as_str(&self) -> &str {
        match self {
            Self::InternalError => "amqp:internal-error",
            Self::NotFound => "amqp:not-found",
            Self::UnauthorizedAccess => "amqp:unauthorized-access",
            Self::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            Self::NotAllowed => "amqp:not-allowed",
            Self::NotImplemented => "amqp:not-implemented",
            Self::ConnectionForced => "amqp:connection:forced",
            Self::FramingError => "amqp:connection:framing-error",
            Self::LinkDetachForced => "amqp:link:detach-forced",
            Self::LinkStolen => "amqp:link:stolen",
            Self::TransactionUnknownId => "amqp:transaction:unknown-id",
            Self::TransactionRollback => "amqp:transaction:rollback",
            Self::TransactionTimeout => "amqp:transaction:timeout",
            Self::ServerBusy => "com.microsoft:server-busy",
            Self::Timeout => "com.microsoft:timeout",
            Self::Other(symbol) => symbol,
        }
    }

    /// Whether a peer reporting this condition may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::InternalError
                | Self::ConnectionForced
                | Self::LinkDetachForced
                | Self::ServerBusy
                | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all AMQP core operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum AmqpError {
    /// Invalid or missing construction arguments
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the offending argument
        message: String,
    },

    /// Connection-level failure
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure
        message: String,
    },

    /// A link could not be created on its session
    #[error("Link creation failed: {message}")]
    LinkCreation {
        /// Reason the attach was refused locally
        message: String,
    },

    /// Attach or detach failure scoped to one link
    #[error("Link error [{condition}]: {message}")]
    Link {
        /// Condition reported by the peer
        condition: ErrorCondition,
        /// Description reported by the peer
        message: String,
    },

    /// CBS put-token rejected or unanswered
    #[error("Authorization of '{audience}' failed (status {status}): {message}")]
    Authorization {
        /// Audience the token was put for
        audience: String,
        /// Status code returned by the CBS node, -1 when no response arrived
        status: i32,
        /// Status description or local reason
        message: String,
    },

    /// No response within the deadline
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    RequestTimeout {
        /// Name of the operation that timed out
        operation: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Declare or discharge rejected, or reuse of a completed transaction
    #[error("Transaction error: {message}")]
    Transaction {
        /// Description of the transactional failure
        message: String,
    },

    /// All attempts failed
    #[error("Operation failed after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Total number of attempts made
        attempts: u32,
        /// Failure observed on the final attempt
        last: Box<AmqpError>,
    },

    /// The pending operation was abandoned because its owner went away
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Why the operation was abandoned
        message: String,
    },
}

impl AmqpError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a link creation error
    pub fn link_creation(message: impl Into<String>) -> Self {
        Self::LinkCreation {
            message: message.into(),
        }
    }

    /// Create a link error from a peer-reported condition
    pub fn link(condition: ErrorCondition, message: impl Into<String>) -> Self {
        Self::Link {
            condition,
            message: message.into(),
        }
    }

    /// Create an authorization error
    pub fn authorization(
        audience: impl Into<String>,
        status: i32,
        message: impl Into<String>,
    ) -> Self {
        Self::Authorization {
            audience: audience.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a request timeout error
    pub fn request_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Wrap the last failure after the retry budget is spent
    pub fn retry_exhausted(attempts: u32, last: AmqpError) -> Self {
        Self::RetryExhausted {
            attempts,
            last: Box::new(last),
        }
    }

    /// Whether the retry policy engine may recover from this error locally.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Authorization { .. } | Self::RequestTimeout { .. } => {
                true
            }
            Self::Link { condition, .. } => condition.is_transient(),
            Self::Configuration { .. }
            | Self::LinkCreation { .. }
            | Self::Transaction { .. }
            | Self::RetryExhausted { .. }
            | Self::Cancelled { .. } => false,
        }
    }

    /// The innermost cause, looking through `RetryExhausted`.
    pub fn root_cause(&self) -> &AmqpError {
        match self {
            Self::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

/// Standard Result type for AMQP core operations
pub type Result<T> = std::result::Result<T, AmqpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AmqpError::configuration("hostname is required");
        assert!(matches!(err, AmqpError::Configuration { .. }));
        assert_eq!(
            err.to_string(),
            "Configuration error: hostname is required"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AmqpError::transport("reset").is_transient());
        assert!(AmqpError::authorization("amqp://h/q", 401, "nope").is_transient());
        assert!(AmqpError::request_timeout("put-token", Duration::from_secs(1)).is_transient());
        assert!(AmqpError::link(ErrorCondition::ServerBusy, "busy").is_transient());
        assert!(!AmqpError::link(ErrorCondition::NotFound, "gone").is_transient());
        assert!(!AmqpError::transaction("already discharged").is_transient());
        assert!(!AmqpError::configuration("bad").is_transient());
    }

    #[test]
    fn test_condition_symbols() {
        for symbol in [
            "amqp:internal-error",
            "amqp:link:detach-forced",
            "com.microsoft:server-busy",
            "vendor:custom",
        ] {
            assert_eq!(ErrorCondition::from_symbol(symbol).as_str(), symbol);
        }
    }

    #[test]
    fn test_root_cause() {
        let err = AmqpError::retry_exhausted(3, AmqpError::transport("reset"));
        assert!(matches!(err.root_cause(), AmqpError::Transport { .. }));
        assert!(!err.is_transient());
    }
}
