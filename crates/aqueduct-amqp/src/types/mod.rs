//! Protocol-level value types shared by the engine boundary and the handles

pub mod delivery;
pub mod ids;
pub mod message;

pub use delivery::{
    DeliveryOutcome, DeliveryTag, Payload, Role, SenderSettleMode, Target, TransactionalState,
};
pub use ids::{LinkHandle, SessionId};
pub use message::{AmqpBody, AmqpMessage, AmqpValue, MessageProperties};
