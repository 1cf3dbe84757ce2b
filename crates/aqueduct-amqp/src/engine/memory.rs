//! In-memory protocol engine
//!
//! [`MemoryEngine`] answers performatives the way a well-behaved broker
//! would, without any I/O. The paired [`MemoryPeer`] lets tests inspect the
//! frames the pump emitted, inject events, grant credit, deliver messages and
//! switch the peer into misbehaving modes (stalled open, silent heartbeats,
//! ignored detaches, refused transports).

use super::{Endpoint, EngineEvent, Frame, ProtocolEngine};
use crate::types::{AmqpMessage, DeliveryOutcome, LinkHandle, Payload, Role, SessionId, Target};
use aqueduct_core::{AmqpError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// What the simulated peer does with a message transferred to it
#[derive(Debug, Clone, PartialEq)]
pub struct PeerReply {
    /// Disposition returned for unsettled transfers
    pub outcome: DeliveryOutcome,
    /// Messages sent back, routed to the receiving link attached to the
    /// request's `reply_to` address
    pub replies: Vec<AmqpMessage>,
}

impl Default for PeerReply {
    fn default() -> Self {
        Self {
            outcome: DeliveryOutcome::Accepted,
            replies: Vec::new(),
        }
    }
}

impl PeerReply {
    /// Accept and answer with one message
    pub fn respond(reply: AmqpMessage) -> Self {
        Self {
            outcome: DeliveryOutcome::Accepted,
            replies: vec![reply],
        }
    }
}

/// Peer-side message handler.
///
/// Invoked with the peer's lock held; implementations must not call back
/// into the [`MemoryPeer`].
pub trait PeerBehavior: Send + Sync {
    /// Handle a message sent to `address`
    fn on_message(&self, address: &str, message: &AmqpMessage) -> PeerReply;
}

impl<F> PeerBehavior for F
where
    F: Fn(&str, &AmqpMessage) -> PeerReply + Send + Sync,
{
    fn on_message(&self, address: &str, message: &AmqpMessage) -> PeerReply {
        self(address, message)
    }
}

#[derive(Debug)]
struct PeerLink {
    name: String,
    role: Role,
    source: Option<String>,
    target: Option<Target>,
    credit: u32,
    backlog: VecDeque<AmqpMessage>,
    detached: bool,
}

struct PeerState {
    frames: Vec<Frame>,
    inbound: VecDeque<EngineEvent>,
    links: HashMap<LinkHandle, PeerLink>,
    behavior: Option<Arc<dyn PeerBehavior>>,
    endpoint: Option<Endpoint>,
    opens: usize,
    next_txn: u64,
    remote_idle_timeout: Option<Duration>,
    sender_credit: u32,
    stall_open: bool,
    answer_heartbeats: bool,
    ignore_detach: bool,
    refused_opens: u32,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            inbound: VecDeque::new(),
            links: HashMap::new(),
            behavior: None,
            endpoint: None,
            opens: 0,
            next_txn: 0,
            remote_idle_timeout: Some(Duration::from_secs(30)),
            sender_credit: 100,
            stall_open: false,
            answer_heartbeats: true,
            ignore_detach: false,
            refused_opens: 0,
        }
    }
}

impl PeerState {
    fn handle_frame(&mut self, frame: Frame) {
        self.frames.push(frame.clone());
        match frame {
            Frame::Open { .. } => {
                if !self.stall_open {
                    self.inbound.push_back(EngineEvent::Opened {
                        remote_idle_timeout: self.remote_idle_timeout,
                    });
                }
            }
            Frame::Begin { channel } => self.inbound.push_back(EngineEvent::Begun { channel }),
            Frame::Attach {
                handle,
                name,
                role,
                source,
                target,
                ..
            } => {
                self.links.insert(
                    handle,
                    PeerLink {
                        name,
                        role,
                        source,
                        target,
                        credit: 0,
                        backlog: VecDeque::new(),
                        detached: false,
                    },
                );
                self.inbound.push_back(EngineEvent::Attached { handle });
                if role == Role::Sender && self.sender_credit > 0 {
                    self.inbound.push_back(EngineEvent::Flow {
                        handle,
                        link_credit: self.sender_credit,
                    });
                }
            }
            Frame::Flow {
                handle,
                link_credit,
                ..
            } => {
                if let Some(link) = self.links.get_mut(&handle) {
                    link.credit = link_credit;
                }
                self.drain_backlog(handle);
            }
            Frame::Transfer {
                handle,
                tag,
                settled,
                payload,
                ..
            } => self.handle_transfer(handle, tag, settled, payload),
            Frame::Detach { handle, .. } => {
                let Some(link) = self.links.get_mut(&handle) else {
                    return;
                };
                link.detached = true;
                if !self.ignore_detach {
                    self.inbound
                        .push_back(EngineEvent::Detached { handle, error: None });
                }
            }
            Frame::End { channel } => {
                if !self.ignore_detach {
                    self.inbound
                        .push_back(EngineEvent::Ended { channel, error: None });
                }
            }
            Frame::Close => self.inbound.push_back(EngineEvent::Closed { error: None }),
            Frame::Empty => {
                if self.answer_heartbeats {
                    self.inbound.push_back(EngineEvent::Heartbeat);
                }
            }
        }
    }

    fn handle_transfer(
        &mut self,
        handle: LinkHandle,
        tag: crate::types::DeliveryTag,
        settled: bool,
        payload: Payload,
    ) {
        let Some(link) = self.links.get(&handle) else {
            debug!(%handle, "Peer ignoring transfer on unknown link");
            return;
        };

        let mut replies = Vec::new();
        let mut reply_to = None;
        let outcome = match (&link.target, payload) {
            (Some(Target::Coordinator), Payload::Declare) => {
                self.next_txn += 1;
                DeliveryOutcome::Declared {
                    txn_id: self.next_txn.to_string().into_bytes(),
                }
            }
            (_, Payload::Message(message)) => {
                let address = link
                    .target
                    .as_ref()
                    .and_then(Target::address)
                    .unwrap_or_default();
                let reply = match &self.behavior {
                    Some(behavior) => behavior.on_message(address, &message),
                    None => PeerReply::default(),
                };
                replies = reply.replies;
                reply_to = message.properties.reply_to.clone();
                reply.outcome
            }
            _ => DeliveryOutcome::Accepted,
        };

        if !settled {
            self.inbound.push_back(EngineEvent::Disposition {
                handle,
                tag,
                outcome,
            });
        }

        for reply in replies {
            let address = reply_to.clone().or_else(|| reply.properties.to.clone());
            let receiver = address.and_then(|address| {
                self.find_link(|link| {
                    link.role == Role::Receiver
                        && link.target.as_ref().and_then(Target::address) == Some(address.as_str())
                })
            });
            match receiver {
                Some(receiver) => self.deliver_to(receiver, reply),
                None => debug!("Peer dropping reply with no attached reply-to link"),
            }
        }
    }

    fn find_link(&self, predicate: impl Fn(&PeerLink) -> bool) -> Option<LinkHandle> {
        self.links
            .iter()
            .filter(|(_, link)| !link.detached && predicate(link))
            .map(|(handle, _)| *handle)
            .min()
    }

    fn deliver_to(&mut self, handle: LinkHandle, message: AmqpMessage) {
        if let Some(link) = self.links.get_mut(&handle) {
            link.backlog.push_back(message);
        }
        self.drain_backlog(handle);
    }

    fn drain_backlog(&mut self, handle: LinkHandle) {
        let Some(link) = self.links.get_mut(&handle) else {
            return;
        };
        if link.role != Role::Receiver || link.detached {
            return;
        }
        while link.credit > 0 {
            let Some(message) = link.backlog.pop_front() else {
                break;
            };
            link.credit -= 1;
            self.inbound
                .push_back(EngineEvent::Transfer { handle, message });
        }
    }
}

struct PeerShared {
    state: Mutex<PeerState>,
    notify: Notify,
}

impl PeerShared {
    fn with_state<R>(&self, f: impl FnOnce(&mut PeerState) -> R) -> R {
        let (result, wake) = {
            let mut state = self.state.lock();
            let before = state.inbound.len();
            let result = f(&mut state);
            (result, state.inbound.len() > before)
        };
        if wake {
            self.notify.notify_one();
        }
        result
    }
}

/// Engine half of an in-memory connection
pub struct MemoryEngine {
    shared: Arc<PeerShared>,
    closed: bool,
}

impl MemoryEngine {
    /// Create an engine and the peer handle controlling it
    pub fn pair() -> (Self, MemoryPeer) {
        let peer = MemoryPeer::new();
        (peer.engine(), peer)
    }
}

#[async_trait]
impl ProtocolEngine for MemoryEngine {
    async fn open(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.shared.with_state(|state| {
            if state.refused_opens > 0 {
                state.refused_opens -= 1;
                return Err(AmqpError::transport(format!(
                    "connection to {}:{} refused",
                    endpoint.host, endpoint.port
                )));
            }
            state.endpoint = Some(endpoint.clone());
            state.opens += 1;
            Ok(())
        })
    }

    fn submit(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(AmqpError::transport("engine is closed"));
        }
        self.shared.with_state(|state| state.handle_frame(frame));
        Ok(())
    }

    async fn ready(&mut self) -> Result<()> {
        loop {
            let notified = self.shared.notify.notified();
            if !self.shared.state.lock().inbound.is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    fn pump_once(&mut self) -> Vec<EngineEvent> {
        self.shared.state.lock().inbound.drain(..).collect()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Test-side control of a [`MemoryEngine`]
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
}

impl Default for MemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPeer {
    /// Create a peer with broker-like defaults
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PeerShared {
                state: Mutex::new(PeerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// New engine talking to this peer; used by reconnect factories
    pub fn engine(&self) -> MemoryEngine {
        MemoryEngine {
            shared: self.shared.clone(),
            closed: false,
        }
    }

    /// Idle timeout the peer advertises in its open
    pub fn set_remote_idle_timeout(&self, timeout: Option<Duration>) {
        self.shared.with_state(|state| state.remote_idle_timeout = timeout);
    }

    /// Credit granted to every sending link on attach
    pub fn set_sender_credit(&self, credit: u32) {
        self.shared.with_state(|state| state.sender_credit = credit);
    }

    /// Never answer the open frame
    pub fn stall_open(&self, stall: bool) {
        self.shared.with_state(|state| state.stall_open = stall);
    }

    /// Answer empty frames with heartbeats
    pub fn answer_heartbeats(&self, answer: bool) {
        self.shared.with_state(|state| state.answer_heartbeats = answer);
    }

    /// Never acknowledge detach or end
    pub fn ignore_detach(&self, ignore: bool) {
        self.shared.with_state(|state| state.ignore_detach = ignore);
    }

    /// Refuse the next `count` transport opens
    pub fn refuse_opens(&self, count: u32) {
        self.shared.with_state(|state| state.refused_opens = count);
    }

    /// Install the message handler
    pub fn set_behavior(&self, behavior: impl PeerBehavior + 'static) {
        self.shared
            .with_state(|state| state.behavior = Some(Arc::new(behavior)));
    }

    /// Every frame submitted so far
    pub fn frames(&self) -> Vec<Frame> {
        self.shared.state.lock().frames.clone()
    }

    /// Number of submitted frames matching `predicate`
    pub fn count_frames(&self, predicate: impl Fn(&Frame) -> bool) -> usize {
        self.shared
            .state
            .lock()
            .frames
            .iter()
            .filter(|frame| predicate(frame))
            .count()
    }

    /// Endpoint of the last successful transport open
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.state.lock().endpoint.clone()
    }

    /// Number of successful transport opens
    pub fn opens(&self) -> usize {
        self.shared.state.lock().opens
    }

    /// Handle of the attached link called `name`
    pub fn link_handle(&self, name: &str) -> Option<LinkHandle> {
        self.shared
            .state
            .lock()
            .find_link(|link| link.name == name)
    }

    /// Push an arbitrary event to the pump
    pub fn inject(&self, event: EngineEvent) {
        self.shared.with_state(|state| state.inbound.push_back(event));
    }

    /// Simulate an I/O failure
    pub fn fail(&self, message: impl Into<String>) {
        self.inject(EngineEvent::TransportError {
            message: message.into(),
        });
    }

    /// Grant `credit` to the sending link called `name`
    pub fn grant_credit(&self, name: &str, credit: u32) -> bool {
        self.shared.with_state(|state| {
            let Some(handle) =
                state.find_link(|link| link.name == name && link.role == Role::Sender)
            else {
                return false;
            };
            state.inbound.push_back(EngineEvent::Flow {
                handle,
                link_credit: credit,
            });
            true
        })
    }

    /// Deliver `message` to the receiving link whose source is `address`,
    /// respecting the credit that link has issued
    pub fn deliver(&self, address: &str, message: AmqpMessage) -> bool {
        self.shared.with_state(|state| {
            let Some(handle) = state.find_link(|link| {
                link.role == Role::Receiver && link.source.as_deref() == Some(address)
            }) else {
                return false;
            };
            state.deliver_to(handle, message);
            true
        })
    }

    /// Messages waiting for credit on the receiving link whose source is `address`
    pub fn backlog(&self, address: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .links
            .values()
            .filter(|link| link.role == Role::Receiver && link.source.as_deref() == Some(address))
            .map(|link| link.backlog.len())
            .sum()
    }

    /// Open an unsolicited link on `channel`
    pub fn attach_incoming(&self, channel: SessionId, name: impl Into<String>) {
        self.inject(EngineEvent::IncomingAttach {
            channel,
            name: name.into(),
            role: Role::Sender,
        });
    }
}
