//! Session handle

use crate::cbs::TokenLease;
use crate::connection::{bounded, ConnectionInner};
use crate::link::{AmqpReceiveLink, AmqpSendLink, LinkOptions};
use crate::pump::{PumpCommand, PumpHandle};
use crate::request_response::{RequestResponseChannel, RequestResponseOptions};
use crate::state::{LinkAttached, LinkSpec};
use crate::transaction::TransactionCoordinator;
use crate::types::{Role, SenderSettleMode, SessionId, Target};
use aqueduct_core::{AmqpError, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Name of the link that carries transaction control messages
pub const COORDINATOR_LINK_NAME: &str = "coordinator";

struct SessionInner {
    name: String,
    channel: SessionId,
    pump: PumpHandle,
    connection: Weak<ConnectionInner>,
    try_timeout: Duration,
}

/// Handle to a mapped session
#[derive(Clone)]
pub struct AmqpSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for AmqpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSession")
            .field("name", &self.inner.name)
            .field("channel", &self.inner.channel)
            .finish()
    }
}

impl AmqpSession {
    pub(crate) fn new(
        name: String,
        channel: SessionId,
        pump: PumpHandle,
        connection: Weak<ConnectionInner>,
        try_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                name,
                channel,
                pump,
                connection,
                try_timeout,
            }),
        }
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Local channel
    pub fn channel(&self) -> SessionId {
        self.inner.channel
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.inner
            .connection
            .upgrade()
            .ok_or_else(|| AmqpError::transport("connection has been dropped"))
    }

    async fn lease(&self, entity_path: &str) -> Result<TokenLease> {
        let registry = self.connection()?.token_registry().await?;
        registry.acquire(entity_path).await
    }

    async fn attach(&self, spec: LinkSpec) -> Result<LinkAttached> {
        let channel = self.inner.channel;
        let operation = format!("attach link '{}' on session '{}'", spec.name, self.inner.name);
        bounded(
            operation,
            self.inner.try_timeout,
            self.inner.pump.request(|reply| PumpCommand::AttachLink {
                channel,
                spec,
                reply,
            }),
        )
        .await
    }

    /// Attach a sending link without authorization.
    pub(crate) async fn attach_sender(
        &self,
        name: &str,
        target: Target,
        settle_mode: SenderSettleMode,
    ) -> Result<AmqpSendLink> {
        let entity_path = target.address().unwrap_or_default().to_string();
        let attached = self
            .attach(LinkSpec {
                name: name.to_string(),
                role: Role::Sender,
                source: None,
                target: Some(target),
                settle_mode,
                prefetch: 0,
            })
            .await?;
        Ok(AmqpSendLink::new(
            name.to_string(),
            entity_path,
            attached.handle,
            self.inner.pump.clone(),
            self.inner.try_timeout,
        ))
    }

    /// Attach a receiving link without authorization.
    pub(crate) async fn attach_receiver(
        &self,
        name: &str,
        source: &str,
        target: Option<String>,
        prefetch: u32,
    ) -> Result<AmqpReceiveLink> {
        let attached = self
            .attach(LinkSpec {
                name: name.to_string(),
                role: Role::Receiver,
                source: Some(source.to_string()),
                target: target.map(Target::Address),
                settle_mode: SenderSettleMode::Unsettled,
                prefetch,
            })
            .await?;
        let deliveries = attached.deliveries.ok_or_else(|| {
            AmqpError::link_creation(format!("receive link '{name}' has no delivery channel"))
        })?;
        Ok(AmqpReceiveLink::new(
            name.to_string(),
            source.to_string(),
            attached.handle,
            self.inner.pump.clone(),
            deliveries,
        ))
    }

    /// Attach a sending link to `entity_path`.
    ///
    /// With [`LinkOptions::authorize`] set, the entity is authorized through
    /// the connection's token manager registry before the attach and stays
    /// authorized until the link is closed or dropped.
    pub async fn create_send_link(
        &self,
        name: &str,
        entity_path: &str,
        options: LinkOptions,
    ) -> Result<AmqpSendLink> {
        let lease = if options.authorize {
            Some(self.lease(entity_path).await?)
        } else {
            None
        };
        let target = Target::Address(
            options
                .target_address
                .clone()
                .unwrap_or_else(|| entity_path.to_string()),
        );
        let link = self.attach_sender(name, target, options.settle_mode).await?;
        debug!(session = %self.inner.name, link = name, entity_path, "Send link attached");
        Ok(link.with_lease(lease))
    }

    /// Attach a receiving link whose source is `entity_path`.
    pub async fn create_receive_link(
        &self,
        name: &str,
        entity_path: &str,
        options: LinkOptions,
    ) -> Result<AmqpReceiveLink> {
        let lease = if options.authorize {
            Some(self.lease(entity_path).await?)
        } else {
            None
        };
        let link = self
            .attach_receiver(
                name,
                entity_path,
                options.target_address.clone(),
                options.prefetch,
            )
            .await?;
        debug!(session = %self.inner.name, link = name, entity_path, "Receive link attached");
        Ok(link.with_lease(lease))
    }

    /// Create a request-response channel to `address` with default options.
    pub async fn create_request_response_channel(
        &self,
        name: &str,
        address: &str,
    ) -> Result<RequestResponseChannel> {
        let options = RequestResponseOptions::new(self.inner.try_timeout);
        RequestResponseChannel::create(self, name, address, options).await
    }

    /// Attach the transaction coordinator link.
    pub async fn create_transaction_coordinator(
        &self,
    ) -> Result<TransactionCoordinator<AmqpSendLink>> {
        let link = self
            .attach_sender(
                COORDINATOR_LINK_NAME,
                Target::Coordinator,
                SenderSettleMode::Unsettled,
            )
            .await?;
        Ok(TransactionCoordinator::new(link, self.inner.try_timeout))
    }

    /// End the session after detaching its links.
    pub async fn close(&self) -> Result<()> {
        let channel = self.inner.channel;
        self.inner
            .pump
            .request(|reply| PumpCommand::EndSession { channel, reply })
            .await
    }
}
