//! Protocol engine adapter boundary
//!
//! The event pump never touches wire bytes. It hands performative-level
//! [`Frame`]s to a [`ProtocolEngine`] and receives [`EngineEvent`]s back;
//! encoding, TLS, sockets and proxies live behind this trait.

pub mod memory;

use crate::types::{
    AmqpMessage, DeliveryOutcome, DeliveryTag, LinkHandle, Payload, Role, SenderSettleMode,
    SessionId, Target, TransactionalState,
};
use aqueduct_core::{
    AmqpError, AmqpTransportType, ConnectionOptions, ErrorCondition, ProxyOptions, Result,
    SslVerifyMode,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

pub use memory::{MemoryEngine, MemoryPeer, PeerBehavior, PeerReply};

/// Where and how the engine connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
    /// Transport type
    pub transport: AmqpTransportType,
    /// TLS verification
    pub verify_mode: SslVerifyMode,
    /// Proxy configuration
    pub proxy: ProxyOptions,
    /// `host[:port]` to dial instead of `host`, keeping `host` for TLS and the open frame
    pub custom_endpoint: Option<String>,
}

impl Endpoint {
    /// Endpoint described by connection options
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            host: options.hostname().to_string(),
            port: options.port(),
            transport: options.transport_type(),
            verify_mode: options.verify_mode(),
            proxy: options.proxy_options().clone(),
            custom_endpoint: options.custom_endpoint_address().map(str::to_string),
        }
    }
}

/// Outgoing performative
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Connection open
    Open {
        /// Local container id
        container_id: String,
        /// Virtual host name
        hostname: String,
        /// Local idle timeout advertised to the peer
        idle_timeout: Duration,
        /// Client identification properties
        properties: BTreeMap<String, String>,
    },
    /// Session begin
    Begin {
        /// Local channel
        channel: SessionId,
    },
    /// Link attach
    Attach {
        /// Owning session
        channel: SessionId,
        /// Local handle
        handle: LinkHandle,
        /// Link name
        name: String,
        /// Local role
        role: Role,
        /// Source address
        source: Option<String>,
        /// Target terminus
        target: Option<Target>,
        /// Sender settlement mode
        settle_mode: SenderSettleMode,
    },
    /// Link flow
    Flow {
        /// Owning session
        channel: SessionId,
        /// Link handle
        handle: LinkHandle,
        /// Transfers counted so far
        delivery_count: u32,
        /// Credit granted to the peer
        link_credit: u32,
    },
    /// Transfer on a sending link
    Transfer {
        /// Owning session
        channel: SessionId,
        /// Link handle
        handle: LinkHandle,
        /// Delivery tag
        tag: DeliveryTag,
        /// Whether the transfer is pre-settled
        settled: bool,
        /// Content
        payload: Payload,
        /// Transactional enlistment
        state: Option<TransactionalState>,
    },
    /// Link detach
    Detach {
        /// Owning session
        channel: SessionId,
        /// Link handle
        handle: LinkHandle,
        /// Whether the link is closed rather than suspended
        closed: bool,
        /// Error condition, when refusing or failing
        error: Option<ErrorCondition>,
    },
    /// Session end
    End {
        /// Local channel
        channel: SessionId,
    },
    /// Connection close
    Close,
    /// Keep-alive frame without a performative
    Empty,
}

/// Something the engine observed from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Peer answered the open
    Opened {
        /// Idle timeout advertised by the peer
        remote_idle_timeout: Option<Duration>,
    },
    /// Peer answered a begin
    Begun {
        /// Local channel
        channel: SessionId,
    },
    /// Peer answered an attach
    Attached {
        /// Local handle
        handle: LinkHandle,
    },
    /// Peer initiated an attach on one of our sessions
    IncomingAttach {
        /// Session the attach arrived on
        channel: SessionId,
        /// Link name chosen by the peer
        name: String,
        /// Peer role
        role: Role,
    },
    /// Peer updated credit for one of our sending links
    Flow {
        /// Local handle
        handle: LinkHandle,
        /// Credit now available to us
        link_credit: u32,
    },
    /// Transfer arrived on one of our receiving links
    Transfer {
        /// Local handle
        handle: LinkHandle,
        /// Message
        message: AmqpMessage,
    },
    /// Peer settled one of our deliveries
    Disposition {
        /// Local handle
        handle: LinkHandle,
        /// Tag of the settled delivery
        tag: DeliveryTag,
        /// Outcome
        outcome: DeliveryOutcome,
    },
    /// Peer detached a link
    Detached {
        /// Local handle
        handle: LinkHandle,
        /// Condition and description when the peer detached with an error
        error: Option<(ErrorCondition, String)>,
    },
    /// Peer ended a session
    Ended {
        /// Local channel
        channel: SessionId,
        /// Condition and description when the peer ended with an error
        error: Option<(ErrorCondition, String)>,
    },
    /// Peer closed the connection
    Closed {
        /// Condition and description when the peer closed with an error
        error: Option<(ErrorCondition, String)>,
    },
    /// Frame without a performative
    Heartbeat,
    /// Unrecoverable I/O failure
    TransportError {
        /// Description of the failure
        message: String,
    },
}

/// Contract between the event pump and an AMQP codec/transport implementation
#[async_trait]
pub trait ProtocolEngine: Send + 'static {
    /// Establish the underlying transport; the pump sends the open frame afterwards.
    async fn open(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Queue a performative for transmission.
    fn submit(&mut self, frame: Frame) -> Result<()>;

    /// Transmit `length` bytes of `bytes` starting at `offset` as one transfer.
    fn send(
        &mut self,
        channel: SessionId,
        handle: LinkHandle,
        tag: DeliveryTag,
        bytes: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                AmqpError::transport(format!(
                    "transfer range {offset}+{length} exceeds buffer of {} bytes",
                    bytes.len()
                ))
            })?;
        self.submit(Frame::Transfer {
            channel,
            handle,
            tag,
            settled: false,
            payload: Payload::Raw(bytes[offset..end].to_vec()),
            state: None,
        })
    }

    /// Wait until events are available.
    ///
    /// Must be cancel-safe: the pump races it against commands and timers.
    async fn ready(&mut self) -> Result<()>;

    /// Take every event observed since the last call.
    fn pump_once(&mut self) -> Vec<EngineEvent>;

    /// Tear down the transport.
    async fn close(&mut self) -> Result<()>;
}
