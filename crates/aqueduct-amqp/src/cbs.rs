//! Claims-based security
//!
//! Entities are authorized by putting a token to the connection's `$cbs`
//! node. [`TokenManagerRegistry`] keeps one [`TokenManager`] per entity path
//! alive for as long as a [`TokenLease`] on it exists; each manager renews
//! its token ahead of expiry on its own task, so a failing entity never
//! holds up the others.

use crate::request_response::{
    status_code, status_description, AmqpResponseCode, RequestResponseChannel,
    UNDEFINED_STATUS_CODE,
};
use crate::types::AmqpMessage;
use aqueduct_core::{
    with_retry, AmqpError, CbsAuthorizationType, Result, RetryPolicy, TokenCredential,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// CBS operation property key
pub const OPERATION_KEY: &str = "operation";

/// CBS operation that installs a token
pub const PUT_TOKEN_OPERATION: &str = "put-token";

/// CBS token type property key
pub const TYPE_KEY: &str = "type";

/// CBS audience property key
pub const AUDIENCE_KEY: &str = "name";

/// CBS token expiry property key
pub const EXPIRATION_KEY: &str = "expiration";

/// Shapes CBS audiences and credential scopes for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenManagerProvider {
    authorization_type: CbsAuthorizationType,
    hostname: String,
    scope: String,
}

impl TokenManagerProvider {
    /// Create a provider; `hostname` and `scope` must not be blank.
    pub fn new(
        authorization_type: CbsAuthorizationType,
        hostname: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self> {
        let hostname = hostname.into();
        let scope = scope.into();
        if hostname.trim().is_empty() {
            return Err(AmqpError::configuration(
                "hostname is required for token management",
            ));
        }
        if scope.trim().is_empty() {
            return Err(AmqpError::configuration(
                "authorization_scope is required for token management",
            ));
        }
        Ok(Self {
            authorization_type,
            hostname,
            scope,
        })
    }

    /// Authorization type
    pub fn authorization_type(&self) -> CbsAuthorizationType {
        self.authorization_type
    }

    /// Audience a token for `entity_path` is put for
    pub fn resource_string(&self, entity_path: &str) -> String {
        match self.authorization_type {
            CbsAuthorizationType::SharedAccessSignature => {
                format!("amqp://{}/{entity_path}", self.hostname)
            }
            CbsAuthorizationType::JsonWebToken => self.scope.clone(),
        }
    }

    /// Credential scopes requested for `entity_path`
    pub fn scopes_for(&self, entity_path: &str) -> Vec<String> {
        vec![self.resource_string(entity_path)]
    }
}

/// Anything that can authorize an audience and report the token expiry
#[async_trait]
pub trait CbsAuthorizer: Send + Sync {
    /// Authorize `audience` with a token for `scopes`; returns its expiry.
    async fn authorize(&self, audience: &str, scopes: &[String]) -> Result<OffsetDateTime>;
}

/// Client of a connection's `$cbs` node
pub struct ClaimsBasedSecurityChannel {
    channel: RequestResponseChannel,
    credential: Arc<dyn TokenCredential>,
    authorization_type: CbsAuthorizationType,
}

impl std::fmt::Debug for ClaimsBasedSecurityChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsBasedSecurityChannel")
            .field("channel", &self.channel)
            .field("authorization_type", &self.authorization_type)
            .finish()
    }
}

impl ClaimsBasedSecurityChannel {
    /// Wrap a request-response channel attached to `$cbs`
    pub fn new(
        channel: RequestResponseChannel,
        credential: Arc<dyn TokenCredential>,
        authorization_type: CbsAuthorizationType,
    ) -> Self {
        Self {
            channel,
            credential,
            authorization_type,
        }
    }

    /// Underlying request-response channel
    pub fn channel(&self) -> &RequestResponseChannel {
        &self.channel
    }
}

#[async_trait]
impl CbsAuthorizer for ClaimsBasedSecurityChannel {
    async fn authorize(&self, audience: &str, scopes: &[String]) -> Result<OffsetDateTime> {
        let token = self.credential.get_token(scopes).await?;
        let request = AmqpMessage::with_value(token.token.clone())
            .application_property(OPERATION_KEY, PUT_TOKEN_OPERATION)
            .application_property(TYPE_KEY, self.authorization_type.token_type())
            .application_property(AUDIENCE_KEY, audience)
            .application_property(EXPIRATION_KEY, token.expires_on);

        let response = match self.channel.send_request(request).await {
            Ok(response) => response,
            Err(AmqpError::RequestTimeout { timeout, .. }) => {
                return Err(AmqpError::authorization(
                    audience,
                    UNDEFINED_STATUS_CODE,
                    format!("no put-token response within {timeout:?}"),
                ));
            }
            Err(err) => return Err(err),
        };

        let status = status_code(&response);
        match AmqpResponseCode::from_code(status) {
            AmqpResponseCode::Ok | AmqpResponseCode::Accepted => {
                debug!(audience, status, expires_on = %token.expires_on, "Put-token accepted");
                Ok(token.expires_on)
            }
            _ => Err(AmqpError::authorization(
                audience,
                status,
                status_description(&response),
            )),
        }
    }
}

/// When tokens are renewed relative to their expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRefreshOptions {
    /// How long before expiry a token is renewed
    pub refresh_margin: Duration,
    /// Lower bound on the wait between renewals
    pub min_refresh_interval: Duration,
}

impl Default for TokenRefreshOptions {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(5 * 60),
            min_refresh_interval: Duration::from_secs(30),
        }
    }
}

impl TokenRefreshOptions {
    /// Wait from `now` until a token expiring at `expires_on` is renewed
    pub fn refresh_delay(&self, expires_on: OffsetDateTime, now: OffsetDateTime) -> Duration {
        let remaining = expires_on - now - self.refresh_margin;
        Duration::try_from(remaining)
            .unwrap_or(Duration::ZERO)
            .max(self.min_refresh_interval)
    }
}

/// Authorization state of one entity
#[derive(Debug, Clone)]
pub enum AuthorizationStatus {
    /// Token accepted; valid until `expires_on`
    Authorized {
        /// Expiry of the current token
        expires_on: OffsetDateTime,
    },
    /// Renewal gave up; the entity is no longer authorized
    Failed {
        /// Last renewal failure
        error: AmqpError,
    },
}

impl AuthorizationStatus {
    /// Whether the current token was accepted
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }
}

/// Keeps one entity authorized
pub struct TokenManager {
    entity_path: String,
    audience: String,
    status: watch::Receiver<AuthorizationStatus>,
    renewal: JoinHandle<()>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("entity_path", &self.entity_path)
            .field("audience", &self.audience)
            .finish()
    }
}

impl TokenManager {
    /// Authorize `entity_path` and start renewing its token.
    pub async fn start(
        authorizer: Arc<dyn CbsAuthorizer>,
        provider: &TokenManagerProvider,
        entity_path: &str,
        retry_policy: RetryPolicy,
        refresh: TokenRefreshOptions,
    ) -> Result<Self> {
        let audience = provider.resource_string(entity_path);
        let scopes = provider.scopes_for(entity_path);
        let expires_on = with_retry(&retry_policy, "authorize", || {
            authorizer.authorize(&audience, &scopes)
        })
        .await?;
        info!(entity_path, audience = %audience, expires_on = %expires_on, "Entity authorized");

        let (status_tx, status) = watch::channel(AuthorizationStatus::Authorized { expires_on });
        let renewal = tokio::spawn(renew(Renewal {
            authorizer,
            entity_path: entity_path.to_string(),
            audience: audience.clone(),
            scopes,
            retry_policy,
            refresh,
            expires_on,
            status: status_tx,
        }));

        Ok(Self {
            entity_path: entity_path.to_string(),
            audience,
            status,
            renewal,
        })
    }

    /// Entity path
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Audience the token is put for
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Current status
    pub fn status(&self) -> AuthorizationStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every renewal
    pub fn subscribe(&self) -> watch::Receiver<AuthorizationStatus> {
        self.status.clone()
    }

    /// Stop renewing.
    pub fn stop(&self) {
        self.renewal.abort();
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

struct Renewal {
    authorizer: Arc<dyn CbsAuthorizer>,
    entity_path: String,
    audience: String,
    scopes: Vec<String>,
    retry_policy: RetryPolicy,
    refresh: TokenRefreshOptions,
    expires_on: OffsetDateTime,
    status: watch::Sender<AuthorizationStatus>,
}

async fn renew(mut renewal: Renewal) {
    loop {
        let delay = renewal
            .refresh
            .refresh_delay(renewal.expires_on, OffsetDateTime::now_utc());
        debug!(
            entity_path = %renewal.entity_path,
            delay_ms = delay.as_millis() as u64,
            "Token renewal scheduled"
        );
        tokio::time::sleep(delay).await;

        let authorizer = &renewal.authorizer;
        let audience = &renewal.audience;
        let scopes = &renewal.scopes;
        let result = with_retry(&renewal.retry_policy, "renew token", || {
            authorizer.authorize(audience, scopes)
        })
        .await;

        match result {
            Ok(expires_on) => {
                debug!(
                    entity_path = %renewal.entity_path,
                    expires_on = %expires_on,
                    "Token renewed"
                );
                renewal.expires_on = expires_on;
                renewal
                    .status
                    .send_replace(AuthorizationStatus::Authorized { expires_on });
            }
            Err(error) => {
                warn!(
                    entity_path = %renewal.entity_path,
                    error = %error,
                    "Token renewal failed, entity is no longer authorized"
                );
                renewal
                    .status
                    .send_replace(AuthorizationStatus::Failed { error });
                return;
            }
        }
    }
}

struct RegistryEntry {
    manager: Arc<OnceCell<TokenManager>>,
    leases: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    shut_down: bool,
}

struct RegistryInner {
    authorizer: Arc<dyn CbsAuthorizer>,
    provider: TokenManagerProvider,
    retry_policy: RetryPolicy,
    refresh: TokenRefreshOptions,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn release(&self, entity_path: &str) {
        let removed = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(entity_path) else {
                return;
            };
            entry.leases = entry.leases.saturating_sub(1);
            if entry.leases > 0 {
                return;
            }
            state.entries.remove(entity_path)
        };
        if let Some(entry) = removed {
            if let Some(manager) = entry.manager.get() {
                manager.stop();
            }
            debug!(entity_path, "Last lease released, token renewal stopped");
        }
    }
}

/// Per-connection map of entity path to token manager
#[derive(Clone)]
pub struct TokenManagerRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for TokenManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManagerRegistry")
            .field("provider", &self.inner.provider)
            .field("entities", &self.inner.state.lock().entries.len())
            .finish()
    }
}

impl TokenManagerRegistry {
    /// Create an empty registry
    pub fn new(
        authorizer: Arc<dyn CbsAuthorizer>,
        provider: TokenManagerProvider,
        retry_policy: RetryPolicy,
        refresh: TokenRefreshOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                authorizer,
                provider,
                retry_policy,
                refresh,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Lease the token manager for `entity_path`, authorizing it on first use.
    ///
    /// Concurrent first leases share one authorization.
    pub async fn acquire(&self, entity_path: &str) -> Result<TokenLease> {
        let manager = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(AmqpError::cancelled("token manager registry is shut down"));
            }
            let entry = state
                .entries
                .entry(entity_path.to_string())
                .or_insert_with(|| RegistryEntry {
                    manager: Arc::new(OnceCell::new()),
                    leases: 0,
                });
            entry.leases += 1;
            entry.manager.clone()
        };
        let lease = TokenLease {
            registry: Arc::downgrade(&self.inner),
            entity_path: entity_path.to_string(),
            manager,
        };

        lease
            .manager
            .get_or_try_init(|| {
                TokenManager::start(
                    self.inner.authorizer.clone(),
                    &self.inner.provider,
                    entity_path,
                    self.inner.retry_policy.clone(),
                    self.inner.refresh.clone(),
                )
            })
            .await?;
        Ok(lease)
    }

    /// Outstanding leases on `entity_path`
    pub fn lease_count(&self, entity_path: &str) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .get(entity_path)
            .map_or(0, |entry| entry.leases)
    }

    /// Whether `entity_path` has a live token manager
    pub fn contains(&self, entity_path: &str) -> bool {
        self.inner.state.lock().entries.contains_key(entity_path)
    }

    /// Status of `entity_path`, if it is managed
    pub fn status(&self, entity_path: &str) -> Option<AuthorizationStatus> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(entity_path)
            .and_then(|entry| entry.manager.get())
            .map(TokenManager::status)
    }

    /// Stop every renewal and refuse further leases.
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            std::mem::take(&mut state.entries)
        };
        if entries.is_empty() {
            return;
        }
        info!(entities = entries.len(), "Stopping token renewal");
        for entry in entries.values() {
            if let Some(manager) = entry.manager.get() {
                manager.stop();
            }
        }
    }
}

/// Keeps an entity authorized while held
pub struct TokenLease {
    registry: Weak<RegistryInner>,
    entity_path: String,
    manager: Arc<OnceCell<TokenManager>>,
}

impl std::fmt::Debug for TokenLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLease")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

impl TokenLease {
    /// Leased entity path
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Current status of the leased entity
    pub fn status(&self) -> Option<AuthorizationStatus> {
        self.manager.get().map(TokenManager::status)
    }
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.entity_path);
        }
    }
}
