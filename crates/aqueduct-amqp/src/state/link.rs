//! Link state machine: credit, delivery tags and settlement

use super::{complete, Completion};
use crate::engine::Frame;
use crate::types::{
    AmqpMessage, DeliveryOutcome, DeliveryTag, LinkHandle, Payload, Role, SenderSettleMode,
    SessionId, Target, TransactionalState,
};
use aqueduct_core::{AmqpError, ErrorCondition, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Not attached
    Detached,
    /// Attach sent, waiting for the peer
    AttachSent,
    /// Attached on both ends
    Attached,
    /// Detach sent, waiting for the peer
    DetachSent,
    /// Detached and closed
    Closed,
    /// Failed with the session or connection
    Failed,
}

impl LinkState {
    /// Whether the link can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Parameters of a link the caller wants attached
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    /// Link name, unique within its session
    pub name: String,
    /// Local role
    pub role: Role,
    /// Source address
    pub source: Option<String>,
    /// Target terminus
    pub target: Option<Target>,
    /// Sender settlement mode
    pub settle_mode: SenderSettleMode,
    /// Credit window kept open on receiving links; zero means manual credit
    pub prefetch: u32,
}

/// Result of a completed attach
#[derive(Debug)]
pub struct LinkAttached {
    /// Local handle
    pub handle: LinkHandle,
    /// Transfers arriving on a receiving link
    pub deliveries: Option<mpsc::UnboundedReceiver<AmqpMessage>>,
}

/// Diagnostic snapshot of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    /// Link name
    pub name: String,
    /// Local handle
    pub handle: LinkHandle,
    /// Owning session
    pub session: SessionId,
    /// Local role
    pub role: Role,
    /// Current state
    pub state: LinkState,
    /// Available credit
    pub credit: u32,
    /// Transfers sent or received
    pub delivery_count: u32,
    /// Sends waiting for credit
    pub pending: usize,
    /// Sends waiting for a disposition
    pub unsettled: usize,
}

struct PendingSend {
    payload: Payload,
    state: Option<TransactionalState>,
    reply: Completion<DeliveryOutcome>,
}

pub(crate) struct LinkEntry {
    pub(crate) handle: LinkHandle,
    pub(crate) session: SessionId,
    pub(crate) spec: LinkSpec,
    pub(crate) state: LinkState,
    credit: u32,
    delivery_count: u32,
    buffered: u32,
    next_tag: u64,
    pending: VecDeque<PendingSend>,
    unsettled: HashMap<DeliveryTag, Completion<DeliveryOutcome>>,
    attach_waiter: Option<Completion<LinkAttached>>,
    detach_waiters: Vec<Completion<()>>,
    deliveries: Option<mpsc::UnboundedSender<AmqpMessage>>,
    deliveries_rx: Option<mpsc::UnboundedReceiver<AmqpMessage>>,
    failure: Option<AmqpError>,
}

impl LinkEntry {
    pub(crate) fn new(handle: LinkHandle, session: SessionId, spec: LinkSpec) -> Self {
        let (deliveries, deliveries_rx) = if spec.role == Role::Receiver {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Self {
            handle,
            session,
            spec,
            state: LinkState::Detached,
            credit: 0,
            delivery_count: 0,
            buffered: 0,
            next_tag: 0,
            pending: VecDeque::new(),
            unsettled: HashMap::new(),
            attach_waiter: None,
            detach_waiters: Vec::new(),
            deliveries,
            deliveries_rx,
            failure: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.spec.name
    }

    pub(crate) fn begin_attach(&mut self, waiter: Completion<LinkAttached>, out: &mut Vec<Frame>) {
        self.state = LinkState::AttachSent;
        self.attach_waiter = Some(waiter);
        out.push(Frame::Attach {
            channel: self.session,
            handle: self.handle,
            name: self.spec.name.clone(),
            role: self.spec.role,
            source: self.spec.source.clone(),
            target: self.spec.target.clone(),
            settle_mode: self.spec.settle_mode,
        });
    }

    pub(crate) fn on_attached(&mut self, out: &mut Vec<Frame>) {
        if self.state != LinkState::AttachSent {
            debug!(link = %self.spec.name, state = ?self.state, "Ignoring unexpected attach");
            return;
        }
        self.state = LinkState::Attached;

        if self.spec.role == Role::Receiver && self.spec.prefetch > 0 {
            self.credit = self.spec.prefetch;
            out.push(self.flow_frame());
        }

        if let Some(waiter) = self.attach_waiter.take() {
            complete(
                waiter,
                Ok(LinkAttached {
                    handle: self.handle,
                    deliveries: self.deliveries_rx.take(),
                }),
            );
        }
    }

    fn flow_frame(&self) -> Frame {
        Frame::Flow {
            channel: self.session,
            handle: self.handle,
            delivery_count: self.delivery_count,
            link_credit: self.credit,
        }
    }

    fn unavailable(&self) -> AmqpError {
        match &self.failure {
            Some(failure) => failure.clone(),
            None => AmqpError::link(
                ErrorCondition::NotAllowed,
                format!("link '{}' is not attached ({:?})", self.spec.name, self.state),
            ),
        }
    }

    pub(crate) fn enqueue_send(
        &mut self,
        payload: Payload,
        state: Option<TransactionalState>,
        reply: Completion<DeliveryOutcome>,
        out: &mut Vec<Frame>,
    ) {
        if self.spec.role != Role::Sender {
            complete(
                reply,
                Err(AmqpError::link(
                    ErrorCondition::NotAllowed,
                    format!("link '{}' is a receiving link", self.spec.name),
                )),
            );
            return;
        }
        if self.state != LinkState::Attached {
            complete(reply, Err(self.unavailable()));
            return;
        }

        self.pending.push_back(PendingSend {
            payload,
            state,
            reply,
        });
        self.flush(out);
    }

    /// Transmit queued sends while credit lasts, in submission order.
    pub(crate) fn flush(&mut self, out: &mut Vec<Frame>) {
        while self.credit > 0 {
            let Some(send) = self.pending.pop_front() else {
                break;
            };
            if send.reply.is_closed() {
                debug!(link = %self.spec.name, "Dropping send abandoned before transmission");
                continue;
            }

            let tag = DeliveryTag::from_counter(self.next_tag);
            self.next_tag += 1;
            self.credit -= 1;
            self.delivery_count = self.delivery_count.wrapping_add(1);

            let settled = self.spec.settle_mode == SenderSettleMode::Settled;
            out.push(Frame::Transfer {
                channel: self.session,
                handle: self.handle,
                tag: tag.clone(),
                settled,
                payload: send.payload,
                state: send.state,
            });

            if settled {
                complete(send.reply, Ok(DeliveryOutcome::Accepted));
            } else {
                self.unsettled.insert(tag, send.reply);
            }
        }
    }

    pub(crate) fn on_flow(&mut self, link_credit: u32, out: &mut Vec<Frame>) {
        if self.spec.role != Role::Sender || self.state != LinkState::Attached {
            return;
        }
        self.credit = link_credit;
        self.flush(out);
    }

    pub(crate) fn on_disposition(&mut self, tag: &DeliveryTag, outcome: DeliveryOutcome) {
        match self.unsettled.remove(tag) {
            Some(reply) => complete(reply, Ok(outcome)),
            None => debug!(link = %self.spec.name, %tag, "Disposition for unknown delivery"),
        }
    }

    pub(crate) fn on_transfer(&mut self, message: AmqpMessage) {
        if self.spec.role != Role::Receiver || self.state != LinkState::Attached {
            debug!(link = %self.spec.name, "Dropping transfer on link that cannot receive");
            return;
        }
        if self.credit == 0 {
            warn!(link = %self.spec.name, "Peer sent a transfer without credit");
        }
        self.credit = self.credit.saturating_sub(1);
        self.delivery_count = self.delivery_count.wrapping_add(1);
        self.buffered += 1;

        let delivered = self
            .deliveries
            .as_ref()
            .map(|deliveries| deliveries.send(message).is_ok())
            .unwrap_or(false);
        if !delivered {
            self.buffered -= 1;
            debug!(link = %self.spec.name, "Receiver dropped; discarding transfer");
        }
    }

    /// The consumer took one buffered message; reopen the window once at
    /// least half of it is used.
    pub(crate) fn on_consumed(&mut self, out: &mut Vec<Frame>) {
        self.buffered = self.buffered.saturating_sub(1);
        let prefetch = self.spec.prefetch;
        if prefetch == 0 || self.state != LinkState::Attached {
            return;
        }

        let outstanding = self.buffered + self.credit;
        let threshold = (prefetch / 2).max(1);
        if prefetch.saturating_sub(outstanding) >= threshold {
            self.credit = prefetch.saturating_sub(self.buffered);
            out.push(self.flow_frame());
        }
    }

    pub(crate) fn add_credit(&mut self, credit: u32, out: &mut Vec<Frame>) {
        if self.spec.role != Role::Receiver || self.state != LinkState::Attached {
            return;
        }
        self.credit = self.credit.saturating_add(credit);
        out.push(self.flow_frame());
    }

    pub(crate) fn begin_detach(&mut self, waiter: Option<Completion<()>>, out: &mut Vec<Frame>) {
        match self.state {
            LinkState::AttachSent | LinkState::Attached => {
                self.state = LinkState::DetachSent;
                out.push(Frame::Detach {
                    channel: self.session,
                    handle: self.handle,
                    closed: true,
                    error: None,
                });
                self.detach_waiters.extend(waiter);
            }
            LinkState::DetachSent => self.detach_waiters.extend(waiter),
            LinkState::Detached => {
                self.state = LinkState::Closed;
                if let Some(waiter) = waiter {
                    complete(waiter, Ok(()));
                }
            }
            LinkState::Closed | LinkState::Failed => {
                if let Some(waiter) = waiter {
                    complete(waiter, Ok(()));
                }
            }
        }
    }

    pub(crate) fn on_detached(
        &mut self,
        error: Option<(ErrorCondition, String)>,
        out: &mut Vec<Frame>,
    ) {
        if self.state.is_terminal() {
            return;
        }
        if self.state == LinkState::Attached {
            // peer-initiated: answer before tearing down
            out.push(Frame::Detach {
                channel: self.session,
                handle: self.handle,
                closed: true,
                error: None,
            });
        }

        let failed = error.is_some() || self.state == LinkState::AttachSent;
        let cause = match error {
            Some((condition, description)) => {
                warn!(
                    link = %self.spec.name,
                    %condition,
                    %description,
                    "Link detached by peer with error"
                );
                AmqpError::link(condition, description)
            }
            None => AmqpError::link(
                ErrorCondition::LinkDetachForced,
                format!("link '{}' was detached", self.spec.name),
            ),
        };

        self.abandon(&cause);
        self.state = if failed {
            LinkState::Failed
        } else {
            LinkState::Closed
        };
        if failed {
            self.failure = Some(cause);
        }
        for waiter in self.detach_waiters.drain(..) {
            complete(waiter, Ok(()));
        }
    }

    /// Fail every outstanding operation and end the consumer stream.
    fn abandon(&mut self, cause: &AmqpError) {
        if let Some(waiter) = self.attach_waiter.take() {
            complete(waiter, Err(cause.clone()));
        }
        for send in self.pending.drain(..) {
            complete(send.reply, Err(cause.clone()));
        }
        for (_, reply) in self.unsettled.drain() {
            complete(reply, Err(cause.clone()));
        }
        self.deliveries = None;
        self.deliveries_rx = None;
    }

    pub(crate) fn fail(&mut self, cause: &AmqpError) {
        if self.state.is_terminal() {
            return;
        }
        self.abandon(cause);
        for waiter in self.detach_waiters.drain(..) {
            complete(waiter, Err(cause.clone()));
        }
        self.state = LinkState::Failed;
        self.failure = Some(cause.clone());
    }

    pub(crate) fn force_close(&mut self, cause: &AmqpError) {
        if self.state.is_terminal() {
            return;
        }
        self.abandon(cause);
        for waiter in self.detach_waiters.drain(..) {
            complete(waiter, Ok(()));
        }
        self.state = LinkState::Closed;
    }

    pub(crate) fn info(&self) -> LinkInfo {
        LinkInfo {
            name: self.spec.name.clone(),
            handle: self.handle,
            session: self.session,
            role: self.spec.role,
            state: self.state,
            credit: self.credit,
            delivery_count: self.delivery_count,
            pending: self
                .pending
                .iter()
                .filter(|send| !send.reply.is_closed())
                .count(),
            unsettled: self.unsettled.len(),
        }
    }
}

/// Unwrap a peer outcome for callers that only care about acceptance.
pub(crate) fn outcome_to_result(link: &str, outcome: DeliveryOutcome) -> Result<()> {
    match outcome {
        DeliveryOutcome::Accepted | DeliveryOutcome::Declared { .. } => Ok(()),
        DeliveryOutcome::Rejected {
            condition,
            description,
        } => Err(AmqpError::link(
            condition,
            description.unwrap_or_else(|| format!("delivery rejected on link '{link}'")),
        )),
        DeliveryOutcome::Released => Err(AmqpError::link(
            ErrorCondition::Other("amqp:released".to_string()),
            format!("delivery released on link '{link}'"),
        )),
        DeliveryOutcome::Modified { delivery_failed } => Err(AmqpError::link(
            ErrorCondition::Other("amqp:modified".to_string()),
            format!("delivery modified on link '{link}' (failed: {delivery_failed})"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::oneshot;

    fn spec(role: Role, prefetch: u32) -> LinkSpec {
        LinkSpec {
            name: "link".to_string(),
            role,
            source: Some("queue".to_string()),
            target: Some(Target::Address("queue".to_string())),
            settle_mode: SenderSettleMode::Unsettled,
            prefetch,
        }
    }

    fn attached(role: Role, prefetch: u32) -> (LinkEntry, Vec<Frame>, LinkAttached) {
        let mut link = LinkEntry::new(LinkHandle(0), SessionId(0), spec(role, prefetch));
        let mut out = Vec::new();
        let (tx, mut rx) = oneshot::channel();
        link.begin_attach(tx, &mut out);
        link.on_attached(&mut out);
        let attached = rx.try_recv().unwrap().unwrap();
        (link, out, attached)
    }

    #[test]
    fn test_sends_queue_without_credit() {
        let (mut link, _, _) = attached(Role::Sender, 0);
        let mut out = Vec::new();
        let (tx, mut rx) = oneshot::channel();
        link.enqueue_send(Payload::Raw(vec![1]), None, tx, &mut out);

        assert!(out.is_empty());
        assert_eq!(link.info().pending, 1);
        assert!(rx.try_recv().is_err());

        link.on_flow(1, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(link.info().unsettled, 1);

        link.on_disposition(&DeliveryTag::from_counter(0), DeliveryOutcome::Accepted);
        assert_eq!(rx.try_recv().unwrap().unwrap(), DeliveryOutcome::Accepted);
    }

    #[test]
    fn test_abandoned_send_is_not_transmitted() {
        let (mut link, _, _) = attached(Role::Sender, 0);
        let mut out = Vec::new();
        let (tx, rx) = oneshot::channel();
        link.enqueue_send(Payload::Raw(vec![1]), None, tx, &mut out);
        drop(rx);

        link.on_flow(5, &mut out);
        assert!(out.is_empty());
        assert_eq!(link.info().credit, 5);
    }

    #[test]
    fn test_receiver_issues_prefetch_on_attach() {
        let (link, out, _) = attached(Role::Receiver, 10);
        assert_eq!(
            out.last(),
            Some(&Frame::Flow {
                channel: SessionId(0),
                handle: LinkHandle(0),
                delivery_count: 0,
                link_credit: 10
            })
        );
        assert_eq!(link.info().credit, 10);
    }

    #[test]
    fn test_peer_detach_with_error_fails_pending_work() {
        let (mut link, _, _) = attached(Role::Sender, 0);
        let mut out = Vec::new();
        let (tx, mut rx) = oneshot::channel();
        link.enqueue_send(Payload::Raw(vec![1]), None, tx, &mut out);

        link.on_detached(
            Some((ErrorCondition::NotFound, "entity deleted".to_string())),
            &mut out,
        );

        assert_eq!(link.state, LinkState::Failed);
        assert!(matches!(out.last(), Some(Frame::Detach { .. })));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(AmqpError::Link {
                condition: ErrorCondition::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_rejected_outcome_maps_to_link_error() {
        let result = outcome_to_result(
            "sender",
            DeliveryOutcome::Rejected {
                condition: ErrorCondition::ResourceLimitExceeded,
                description: None,
            },
        );
        assert!(matches!(
            result,
            Err(AmqpError::Link {
                condition: ErrorCondition::ResourceLimitExceeded,
                ..
            })
        ));
    }

    proptest! {
        #[test]
        fn receive_window_never_starves_or_overflows(
            prefetch in 1u32..64,
            steps in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let (mut link, _, attached) = attached(Role::Receiver, prefetch);
            let mut consumer = attached.deliveries;
            let mut out = Vec::new();

            for deliver in steps {
                if deliver && link.credit > 0 {
                    link.on_transfer(AmqpMessage::new());
                } else if link.buffered > 0 {
                    if let Some(rx) = consumer.as_mut() {
                        let _ = rx.try_recv();
                    }
                    link.on_consumed(&mut out);
                }

                let outstanding = link.credit + link.buffered;
                prop_assert!(outstanding <= prefetch);
                prop_assert!(outstanding > 0);
            }
        }
    }
}
