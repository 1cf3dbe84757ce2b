//! Aqueduct AMQP
//!
//! Reactive AMQP 1.0 client transport core. A single event pump task per
//! connection owns a [`ProtocolEngine`] and the sans-IO
//! [`ConnectionCore`](state::ConnectionCore); every other type here is a
//! cheap handle that talks to the pump through message passing.
//!
//! Layers, bottom-up:
//!
//! - [`engine`]: the performative-level boundary to a wire implementation,
//!   plus an in-memory broker for tests
//! - [`state`]: connection, session and link state machines
//! - [`AmqpConnection`], [`AmqpSession`], [`AmqpSendLink`],
//!   [`AmqpReceiveLink`]: caller handles
//! - [`RequestResponseChannel`], [`ClaimsBasedSecurityChannel`],
//!   [`TokenManagerRegistry`] and [`TransactionCoordinator`] built on top

pub mod cbs;
pub mod connection;
pub mod engine;
pub mod link;
pub mod request_response;
pub mod session;
pub mod state;
pub mod transaction;
pub mod types;

mod pump;

pub use cbs::{
    AuthorizationStatus, CbsAuthorizer, ClaimsBasedSecurityChannel, TokenLease, TokenManager,
    TokenManagerProvider, TokenManagerRegistry, TokenRefreshOptions,
};
pub use connection::AmqpConnection;
pub use engine::{
    EngineEvent, Endpoint, Frame, MemoryEngine, MemoryPeer, PeerBehavior, PeerReply, ProtocolEngine,
};
pub use link::{AmqpReceiveLink, AmqpSendLink, LinkOptions};
pub use request_response::{
    status_code, status_description, AmqpResponseCode, RequestResponseChannel,
    RequestResponseOptions, UNDEFINED_STATUS_CODE, UNDEFINED_STATUS_DESCRIPTION,
};
pub use session::AmqpSession;
pub use state::{ConnectionInfo, ConnectionState, LinkInfo, LinkState, SessionInfo, SessionState};
pub use transaction::{AmqpTransaction, DeliverySender, TransactionCoordinator, TransactionState};
pub use types::{AmqpBody, AmqpMessage, AmqpValue, DeliveryOutcome, MessageProperties};
