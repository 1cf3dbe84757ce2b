//! Send and receive link handles

use crate::cbs::TokenLease;
use crate::connection::bounded;
use crate::pump::{PumpCommand, PumpHandle};
use crate::state::link::outcome_to_result;
use crate::transaction::{AmqpTransaction, DeliverySender};
use crate::types::{
    AmqpMessage, DeliveryOutcome, LinkHandle, Payload, SenderSettleMode, TransactionalState,
};
use aqueduct_core::{AmqpError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Options for [`AmqpSession::create_send_link`](crate::AmqpSession::create_send_link)
/// and [`AmqpSession::create_receive_link`](crate::AmqpSession::create_receive_link)
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Settlement mode of a sending link
    pub settle_mode: SenderSettleMode,
    /// Credit window of a receiving link; zero means manual credit
    pub prefetch: u32,
    /// Authorize the entity through CBS before attaching
    pub authorize: bool,
    /// Target address; defaults to the entity path for sending links
    pub target_address: Option<String>,
}

impl LinkOptions {
    /// Set the settlement mode
    pub fn settle_mode(mut self, settle_mode: SenderSettleMode) -> Self {
        self.settle_mode = settle_mode;
        self
    }

    /// Set the receive credit window
    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Authorize the entity before attaching
    pub fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = authorize;
        self
    }

    /// Set the target address
    pub fn target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = Some(address.into());
        self
    }
}

struct SendLinkInner {
    name: String,
    entity_path: String,
    handle: LinkHandle,
    pump: PumpHandle,
    try_timeout: Duration,
    lease: Mutex<Option<TokenLease>>,
}

/// Handle to an attached sending link
#[derive(Clone)]
pub struct AmqpSendLink {
    inner: Arc<SendLinkInner>,
}

impl std::fmt::Debug for AmqpSendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSendLink")
            .field("name", &self.inner.name)
            .field("entity_path", &self.inner.entity_path)
            .field("handle", &self.inner.handle)
            .finish()
    }
}

impl AmqpSendLink {
    pub(crate) fn new(
        name: String,
        entity_path: String,
        handle: LinkHandle,
        pump: PumpHandle,
        try_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SendLinkInner {
                name,
                entity_path,
                handle,
                pump,
                try_timeout,
                lease: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn with_lease(self, lease: Option<TokenLease>) -> Self {
        *self.inner.lease.lock() = lease;
        self
    }

    /// Link name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Entity the link sends to; empty for the coordinator link
    pub fn entity_path(&self) -> &str {
        &self.inner.entity_path
    }

    /// Local handle
    pub fn handle(&self) -> LinkHandle {
        self.inner.handle
    }

    /// Send `message` and wait until the peer accepts it.
    ///
    /// Without credit the send queues behind earlier sends on this link.
    /// Dropping the future before transmission removes it from the queue.
    pub async fn send(&self, message: AmqpMessage) -> Result<()> {
        let outcome = self.send_payload(Payload::Message(message), None).await?;
        outcome_to_result(&self.inner.name, outcome)
    }

    /// Send `message` as part of `transaction`.
    pub async fn send_in_transaction(
        &self,
        message: AmqpMessage,
        transaction: &AmqpTransaction,
    ) -> Result<()> {
        if !transaction.is_active() {
            return Err(AmqpError::transaction(format!(
                "transaction {} is {:?}, not active",
                transaction.id_string(),
                transaction.state()
            )));
        }
        let state = TransactionalState {
            txn_id: transaction.id(),
        };
        let outcome = self
            .send_payload(Payload::Message(message), Some(state))
            .await?;
        outcome_to_result(&self.inner.name, outcome)
    }

    /// Detach the link and release its authorization.
    pub async fn close(&self) -> Result<()> {
        self.inner.lease.lock().take();
        let handle = self.inner.handle;
        self.inner
            .pump
            .request(|reply| PumpCommand::DetachLink { handle, reply })
            .await
    }
}

#[async_trait]
impl DeliverySender for AmqpSendLink {
    async fn send_payload(
        &self,
        payload: Payload,
        state: Option<TransactionalState>,
    ) -> Result<DeliveryOutcome> {
        let handle = self.inner.handle;
        bounded(
            format!("send on link '{}'", self.inner.name),
            self.inner.try_timeout,
            self.inner.pump.request(|reply| PumpCommand::Send {
                handle,
                payload,
                state,
                reply,
            }),
        )
        .await
    }
}

/// Handle to an attached receiving link
pub struct AmqpReceiveLink {
    name: String,
    entity_path: String,
    handle: LinkHandle,
    pump: PumpHandle,
    deliveries: tokio::sync::Mutex<mpsc::UnboundedReceiver<AmqpMessage>>,
    lease: Mutex<Option<TokenLease>>,
}

impl std::fmt::Debug for AmqpReceiveLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpReceiveLink")
            .field("name", &self.name)
            .field("entity_path", &self.entity_path)
            .field("handle", &self.handle)
            .finish()
    }
}

impl AmqpReceiveLink {
    pub(crate) fn new(
        name: String,
        entity_path: String,
        handle: LinkHandle,
        pump: PumpHandle,
        deliveries: mpsc::UnboundedReceiver<AmqpMessage>,
    ) -> Self {
        Self {
            name,
            entity_path,
            handle,
            pump,
            deliveries: tokio::sync::Mutex::new(deliveries),
            lease: Mutex::new(None),
        }
    }

    pub(crate) fn with_lease(self, lease: Option<TokenLease>) -> Self {
        *self.lease.lock() = lease;
        self
    }

    /// Link name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity the link receives from
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Local handle
    pub fn handle(&self) -> LinkHandle {
        self.handle
    }

    /// Next message, or `None` once the link has ended.
    ///
    /// Taking a message frees a slot in the credit window.
    pub async fn recv(&self) -> Option<AmqpMessage> {
        let message = self.deliveries.lock().await.recv().await?;
        let _ = self.pump.notify(PumpCommand::Consumed {
            handle: self.handle,
        });
        Some(message)
    }

    /// Grant `credit` more transfers; used with a zero prefetch.
    pub fn add_credit(&self, credit: u32) -> Result<()> {
        self.pump.notify(PumpCommand::AddCredit {
            handle: self.handle,
            credit,
        })
    }

    /// Detach the link and release its authorization.
    pub async fn close(&self) -> Result<()> {
        self.lease.lock().take();
        let handle = self.handle;
        self.pump
            .request(|reply| PumpCommand::DetachLink { handle, reply })
            .await
    }

    /// Stream of incoming messages ending with the link
    pub fn into_stream(self) -> BoxStream<'static, AmqpMessage> {
        Box::pin(stream::unfold(self, |link| async move {
            let message = link.recv().await?;
            Some((message, link))
        }))
    }
}
