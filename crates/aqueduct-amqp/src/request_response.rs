//! Request-response channel
//!
//! A pair of links to one management address: a pre-settled sender for
//! requests and a receiver whose target is the channel's reply-to address.
//! A router task matches responses to waiting requests by correlation id.

use crate::link::{AmqpReceiveLink, AmqpSendLink};
use crate::session::AmqpSession;
use crate::types::{AmqpMessage, AmqpValue, SenderSettleMode, Target};
use aqueduct_core::{AmqpError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Status code reported when a response carries none
pub const UNDEFINED_STATUS_CODE: i32 = -1;

/// Status description reported when a response carries none
pub const UNDEFINED_STATUS_DESCRIPTION: &str = "";

const STATUS_CODE_KEYS: [&str; 2] = ["statusCode", "status-code"];
const STATUS_DESCRIPTION_KEYS: [&str; 2] = ["statusDescription", "status-description"];

/// Credit window of the response link
pub const DEFAULT_RESPONSE_PREFETCH: u32 = 100;

/// Status code of a management response, in either key spelling
pub fn status_code(message: &AmqpMessage) -> i32 {
    STATUS_CODE_KEYS
        .iter()
        .find_map(|key| message.get_application_property(key))
        .and_then(AmqpValue::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(UNDEFINED_STATUS_CODE)
}

/// Status description of a management response, in either key spelling
pub fn status_description(message: &AmqpMessage) -> &str {
    STATUS_DESCRIPTION_KEYS
        .iter()
        .find_map(|key| message.get_application_property(key))
        .and_then(AmqpValue::as_str)
        .unwrap_or(UNDEFINED_STATUS_DESCRIPTION)
}

/// Well-known management status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmqpResponseCode {
    /// 200
    Ok,
    /// 201
    Created,
    /// 202
    Accepted,
    /// 204
    NoContent,
    /// 400
    BadRequest,
    /// 401
    Unauthorized,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed,
    /// 409
    Conflict,
    /// 410
    Gone,
    /// 500
    InternalServerError,
    /// 503
    ServiceUnavailable,
    /// Any other code
    Other(i32),
}

impl AmqpResponseCode {
    /// Map a raw status code
    pub fn from_code(code: i32) -> Self {
        match code {
            200 => Self::Ok,
            201 => Self::Created,
            202 => Self::Accepted,
            204 => Self::NoContent,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            409 => Self::Conflict,
            410 => Self::Gone,
            500 => Self::InternalServerError,
            503 => Self::ServiceUnavailable,
            other => Self::Other(other),
        }
    }

    /// Raw status code
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NoContent => 204,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::Other(code) => *code,
        }
    }

    /// Whether the code is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }
}

/// Settings for a [`RequestResponseChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResponseOptions {
    /// Bound on one request from send to matched response
    pub request_timeout: Duration,
    /// Credit window of the response link
    pub prefetch: u32,
}

impl RequestResponseOptions {
    /// Options with the given request timeout
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            prefetch: DEFAULT_RESPONSE_PREFETCH,
        }
    }
}

impl Default for RequestResponseOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[derive(Default)]
struct PendingRequests {
    slots: HashMap<String, oneshot::Sender<Result<AmqpMessage>>>,
    closed: Option<AmqpError>,
}

type SharedPending = Arc<Mutex<PendingRequests>>;

/// Removes a request's slot when the request finishes or is dropped.
struct SlotGuard<'a> {
    pending: &'a SharedPending,
    message_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().slots.remove(self.message_id);
    }
}

/// Correlated request-response exchange over a link pair
pub struct RequestResponseChannel {
    name: String,
    address: String,
    reply_to: String,
    sender: AmqpSendLink,
    receiver: Arc<AmqpReceiveLink>,
    pending: SharedPending,
    next_id: AtomicU64,
    request_timeout: Duration,
    router: JoinHandle<()>,
}

impl std::fmt::Debug for RequestResponseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseChannel")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

impl RequestResponseChannel {
    /// Attach the link pair for `address` on `session` and start routing
    /// responses.
    pub async fn create(
        session: &AmqpSession,
        name: &str,
        address: &str,
        options: RequestResponseOptions,
    ) -> Result<Self> {
        let reply_to = format!("{name}-reply-to");
        let sender = session
            .attach_sender(
                &format!("{name}:sender"),
                Target::Address(address.to_string()),
                SenderSettleMode::Settled,
            )
            .await?;
        let receiver = session
            .attach_receiver(
                &format!("{name}:receiver"),
                address,
                Some(reply_to.clone()),
                options.prefetch,
            )
            .await?;

        let receiver = Arc::new(receiver);
        let pending = SharedPending::default();
        let router = tokio::spawn(route_responses(
            receiver.clone(),
            pending.clone(),
            name.to_string(),
        ));
        debug!(channel = name, address, reply_to = %reply_to, "Request-response channel ready");

        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
            reply_to,
            sender,
            receiver,
            pending,
            next_id: AtomicU64::new(0),
            request_timeout: options.request_timeout,
            router,
        })
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Management address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address responses are sent to
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().slots.len()
    }

    /// Send `message` and wait for the response correlated to it.
    ///
    /// The message id and reply-to address are overwritten. Fails with
    /// [`AmqpError::RequestTimeout`] when no response arrives within the
    /// request timeout.
    pub async fn send_request(&self, mut message: AmqpMessage) -> Result<AmqpMessage> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        message.properties.message_id = Some(message_id.clone());
        message.properties.reply_to = Some(self.reply_to.clone());

        let (slot, response) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if let Some(cause) = &pending.closed {
                return Err(cause.clone());
            }
            pending.slots.insert(message_id.clone(), slot);
        }
        let _guard = SlotGuard {
            pending: &self.pending,
            message_id: &message_id,
        };

        let exchange = async {
            self.sender.send(message).await?;
            response.await.map_err(|_| {
                AmqpError::transport(format!("channel '{}' dropped the request", self.name))
            })?
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(channel = %self.name, message_id = %message_id, "Request timed out");
                Err(AmqpError::request_timeout(
                    format!("request {message_id} on channel '{}'", self.name),
                    self.request_timeout,
                ))
            }
        }
    }

    /// Detach both links; pending requests fail.
    pub async fn close(&self) -> Result<()> {
        let sender = self.sender.close().await;
        let receiver = self.receiver.close().await;
        sender.and(receiver)
    }
}

impl Drop for RequestResponseChannel {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_responses(link: Arc<AmqpReceiveLink>, pending: SharedPending, channel: String) {
    while let Some(message) = link.recv().await {
        let Some(correlation_id) = message.properties.correlation_id.clone() else {
            debug!(channel = %channel, "Dropping response without a correlation id");
            continue;
        };
        let slot = pending.lock().slots.remove(&correlation_id);
        match slot {
            Some(slot) => {
                let _ = slot.send(Ok(message));
            }
            None => debug!(
                channel = %channel,
                correlation_id = %correlation_id,
                "Dropping response with unknown correlation id"
            ),
        }
    }

    let cause = AmqpError::transport(format!("response link of channel '{channel}' ended"));
    let slots = {
        let mut pending = pending.lock();
        pending.closed = Some(cause.clone());
        std::mem::take(&mut pending.slots)
    };
    if !slots.is_empty() {
        warn!(channel = %channel, pending = slots.len(), "Failing requests of ended channel");
    }
    for (_, slot) in slots {
        let _ = slot.send(Err(cause.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_in_either_spelling() {
        let camel = AmqpMessage::new().application_property("statusCode", 202);
        let dashed = AmqpMessage::new().application_property("status-code", 404);
        assert_eq!(status_code(&camel), 202);
        assert_eq!(status_code(&dashed), 404);
        assert_eq!(status_code(&AmqpMessage::new()), UNDEFINED_STATUS_CODE);
    }

    #[test]
    fn test_status_description_sentinel() {
        let message = AmqpMessage::new().application_property("status-description", "Accepted");
        assert_eq!(status_description(&message), "Accepted");
        assert_eq!(
            status_description(&AmqpMessage::new()),
            UNDEFINED_STATUS_DESCRIPTION
        );
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(AmqpResponseCode::from_code(202), AmqpResponseCode::Accepted);
        assert!(AmqpResponseCode::from_code(204).is_success());
        assert!(!AmqpResponseCode::Unauthorized.is_success());
        assert_eq!(AmqpResponseCode::from_code(418).code(), 418);
    }
}
