//! Connection handle
//!
//! [`AmqpConnection`] spawns the event pump for one engine and hands out
//! sessions. The CBS node and the token manager registry hang off the
//! connection and are created lazily on first use.

use crate::cbs::{
    ClaimsBasedSecurityChannel, TokenManagerProvider, TokenManagerRegistry, TokenRefreshOptions,
};
use crate::engine::{Endpoint, ProtocolEngine};
use crate::pump::{EventPump, PumpCommand, PumpHandle};
use crate::session::AmqpSession;
use crate::state::{ConnectionCore, ConnectionInfo, ConnectionState};
use aqueduct_core::{with_retry, AmqpError, ConnectionOptions, Result, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Session that carries the CBS request-response links
pub const CBS_SESSION_NAME: &str = "cbs-session";

/// Name of the CBS request-response channel
pub const CBS_LINK_NAME: &str = "cbs";

/// Address of the claims-based security node
pub const CBS_ADDRESS: &str = "$cbs";

/// Await `operation`, failing with [`AmqpError::RequestTimeout`] after `timeout`.
pub(crate) async fn bounded<T>(
    operation: impl Into<String>,
    timeout: Duration,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(AmqpError::request_timeout(operation, timeout)),
    }
}

pub(crate) struct ConnectionInner {
    options: Arc<ConnectionOptions>,
    pump: PumpHandle,
    retry_policy: RetryPolicy,
    token_refresh: TokenRefreshOptions,
    cbs: OnceCell<Arc<ClaimsBasedSecurityChannel>>,
    registry: OnceCell<TokenManagerRegistry>,
    pump_task: JoinHandle<()>,
}

impl ConnectionInner {
    pub(crate) async fn create_session(self: &Arc<Self>, name: &str) -> Result<AmqpSession> {
        let try_timeout = self.retry_policy.try_timeout();
        let session_name = name.to_string();
        let channel = bounded(
            format!("begin session '{name}'"),
            try_timeout,
            self.pump.request(|reply| PumpCommand::CreateSession {
                name: session_name,
                reply,
            }),
        )
        .await?;

        debug!(
            connection_id = %self.pump.connection_id(),
            session = name,
            %channel,
            "Session ready"
        );
        Ok(AmqpSession::new(
            name.to_string(),
            channel,
            self.pump.clone(),
            Arc::downgrade(self),
            try_timeout,
        ))
    }

    pub(crate) async fn cbs_node(self: &Arc<Self>) -> Result<Arc<ClaimsBasedSecurityChannel>> {
        self.cbs
            .get_or_try_init(|| async {
                let session = self.create_session(CBS_SESSION_NAME).await?;
                let channel = session
                    .create_request_response_channel(CBS_LINK_NAME, CBS_ADDRESS)
                    .await?;
                info!(connection_id = %self.pump.connection_id(), "CBS node ready");
                Ok::<_, AmqpError>(Arc::new(ClaimsBasedSecurityChannel::new(
                    channel,
                    self.options.credential().clone(),
                    self.options.authorization_type(),
                )))
            })
            .await
            .map(Arc::clone)
    }

    pub(crate) async fn token_registry(self: &Arc<Self>) -> Result<TokenManagerRegistry> {
        self.registry
            .get_or_try_init(|| async {
                let provider = TokenManagerProvider::new(
                    self.options.authorization_type(),
                    self.options.hostname(),
                    self.options.authorization_scope(),
                )?;
                let cbs = self.cbs_node().await?;
                Ok::<_, AmqpError>(TokenManagerRegistry::new(
                    cbs,
                    provider,
                    self.retry_policy.clone(),
                    self.token_refresh.clone(),
                ))
            })
            .await
            .cloned()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.get() {
            registry.shutdown();
        }
        self.pump_task.abort();
    }
}

/// Handle to one AMQP connection
///
/// Clones share the same connection. When the last clone is dropped the
/// pump task is aborted; call [`close`](Self::close) first for an orderly
/// shutdown.
#[derive(Clone)]
pub struct AmqpConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("connection_id", &self.connection_id())
            .field("state", &self.state())
            .finish()
    }
}

impl AmqpConnection {
    /// Open a connection over `engine` with default token refresh settings.
    pub async fn open<E: ProtocolEngine>(options: ConnectionOptions, engine: E) -> Result<Self> {
        Self::open_with_refresh_options(options, engine, TokenRefreshOptions::default()).await
    }

    /// Open a connection over `engine`.
    ///
    /// The pump is spawned on the configured scheduler, or on the ambient
    /// runtime when none is set. The open handshake is bounded by the retry
    /// policy's try timeout.
    pub async fn open_with_refresh_options<E: ProtocolEngine>(
        options: ConnectionOptions,
        engine: E,
        token_refresh: TokenRefreshOptions,
    ) -> Result<Self> {
        let options = Arc::new(options);
        let retry_policy = RetryPolicy::from_options(options.retry_options().clone())?;
        let endpoint = Endpoint::from_options(&options);
        let core = ConnectionCore::new(options.clone(), Instant::now());
        let (pump, handle) = EventPump::new(engine, endpoint, core);

        let pump_task = match options.scheduler() {
            Some(scheduler) => scheduler.spawn(pump.run()),
            None => tokio::spawn(pump.run()),
        };

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                options,
                pump: handle,
                retry_policy,
                token_refresh,
                cbs: OnceCell::new(),
                registry: OnceCell::new(),
                pump_task,
            }),
        };

        let try_timeout = connection.inner.retry_policy.try_timeout();
        bounded(
            "open connection",
            try_timeout,
            connection
                .inner
                .pump
                .request(|reply| PumpCommand::Open { reply }),
        )
        .await?;
        Ok(connection)
    }

    /// Open a connection, retrying with the policy from `options`.
    ///
    /// `factory` builds a fresh engine for every attempt.
    pub async fn connect_with_retry<E, F>(
        options: ConnectionOptions,
        mut factory: F,
    ) -> Result<Self>
    where
        E: ProtocolEngine,
        F: FnMut() -> E,
    {
        let policy = RetryPolicy::from_options(options.retry_options().clone())?;
        with_retry(&policy, "open connection", || {
            Self::open(options.clone(), factory())
        })
        .await
    }

    /// Connection id
    pub fn connection_id(&self) -> &str {
        self.inner.pump.connection_id()
    }

    /// Options this connection was opened with
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.pump.state()
    }

    /// Receiver notified on every state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.pump.subscribe()
    }

    /// Diagnostic snapshot of the connection and its children
    pub async fn info(&self) -> Result<ConnectionInfo> {
        self.inner.pump.info().await
    }

    /// Begin a session called `name`, or return the existing one.
    pub async fn create_session(&self, name: &str) -> Result<AmqpSession> {
        self.inner.create_session(name).await
    }

    /// The connection's CBS node, created on first use
    pub async fn claims_based_security_node(&self) -> Result<Arc<ClaimsBasedSecurityChannel>> {
        self.inner.cbs_node().await
    }

    /// The connection's token manager registry, created on first use
    pub async fn token_manager_registry(&self) -> Result<TokenManagerRegistry> {
        self.inner.token_registry().await
    }

    /// Close the connection, cascading to every session and link.
    ///
    /// Token renewal stops first. Completes once the peer acknowledged the
    /// close or the shutdown timeout forced it.
    pub async fn close(&self) -> Result<()> {
        if let Some(registry) = self.inner.registry.get() {
            registry.shutdown();
        }
        self.inner
            .pump
            .request(|reply| PumpCommand::Close { reply })
            .await
    }
}
