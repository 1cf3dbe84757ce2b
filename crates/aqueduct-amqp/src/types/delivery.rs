//! Delivery vocabulary: tags, outcomes, payloads and link addressing

use super::message::AmqpMessage;
use aqueduct_core::ErrorCondition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery tag; unique among the unsettled deliveries of a link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub Vec<u8>);

impl DeliveryTag {
    /// Tag derived from a per-link counter
    pub fn from_counter(counter: u64) -> Self {
        Self(counter.to_be_bytes().to_vec())
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Terminal state of a delivery as reported by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed successfully
    Accepted,
    /// Refused; not to be redelivered
    Rejected {
        /// Condition reported by the peer
        condition: ErrorCondition,
        /// Optional description
        description: Option<String>,
    },
    /// Not processed; may be redelivered
    Released,
    /// Not processed; annotations changed
    Modified {
        /// Whether the delivery counts as failed
        delivery_failed: bool,
    },
    /// Coordinator response to a declare
    Declared {
        /// Transaction id allocated by the coordinator
        txn_id: Vec<u8>,
    },
}

/// Transactional state attached to a transfer enlisted in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionalState {
    /// Id of the enclosing transaction
    pub txn_id: Vec<u8>,
}

/// Content of a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Application or management message
    Message(AmqpMessage),
    /// Coordinator `declare`
    Declare,
    /// Coordinator `discharge`
    Discharge {
        /// Transaction being discharged
        txn_id: Vec<u8>,
        /// `true` rolls back, `false` commits
        fail: bool,
    },
    /// Pre-encoded bytes
    Raw(Vec<u8>),
}

/// Link role from the local point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Local end sends transfers
    Sender,
    /// Local end receives transfers
    Receiver,
}

/// Sender settlement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SenderSettleMode {
    /// Transfers are settled before they are sent
    Settled,
    /// Transfers wait for the peer's disposition
    #[default]
    Unsettled,
}

/// Terminus a link attaches to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Node address
    Address(String),
    /// The transaction coordinator
    Coordinator,
}

impl Target {
    /// Node address, if this is not the coordinator
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Address(address) => Some(address),
            Self::Coordinator => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => f.write_str(address),
            Self::Coordinator => f.write_str("amqp:coordinator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_distinct_and_printable() {
        let first = DeliveryTag::from_counter(1);
        let second = DeliveryTag::from_counter(2);
        assert_ne!(first, second);
        assert_eq!(first.to_string(), "0000000000000001");
    }
}
