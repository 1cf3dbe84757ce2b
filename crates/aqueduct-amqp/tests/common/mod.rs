//! Helpers shared by the integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use aqueduct_amqp::{AmqpConnection, AmqpMessage, MemoryEngine, MemoryPeer, PeerReply};
use aqueduct_core::{
    AccessToken, AmqpRetryOptions, CbsAuthorizationType, ConnectionOptions,
    ConnectionOptionsBuilder, TokenCredential,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub const NAMESPACE: &str = "contoso.servicebus.windows.net";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Hands out a fixed token valid for one hour
pub struct StaticCredential;

#[async_trait]
impl TokenCredential for StaticCredential {
    async fn get_token(&self, _scopes: &[String]) -> aqueduct_core::Result<AccessToken> {
        Ok(AccessToken::new(
            "signed-token",
            OffsetDateTime::now_utc() + time::Duration::hours(1),
        ))
    }
}

pub fn builder() -> ConnectionOptionsBuilder {
    ConnectionOptions::builder()
        .connection_id("test-connection")
        .fully_qualified_namespace(NAMESPACE)
        .credential(Arc::new(StaticCredential))
        .authorization_type(CbsAuthorizationType::SharedAccessSignature)
        .authorization_scope("https://servicebus.azure.net/.default")
        .retry_options(
            AmqpRetryOptions::fixed(Duration::from_secs(1), 2)
                .with_try_timeout(Duration::from_secs(30)),
        )
}

pub fn options() -> ConnectionOptions {
    builder().build().unwrap()
}

pub async fn open() -> (AmqpConnection, MemoryPeer) {
    init_tracing();
    let (engine, peer) = MemoryEngine::pair();
    let connection = AmqpConnection::open(options(), engine).await.unwrap();
    (connection, peer)
}

/// Answer every request with `status`, correlated to the request
pub fn reply_with_status(status: i32) -> impl Fn(&str, &AmqpMessage) -> PeerReply {
    move |_address: &str, request: &AmqpMessage| {
        let mut reply = AmqpMessage::new().application_property("status-code", status);
        reply.properties.correlation_id = request.properties.message_id.clone();
        PeerReply::respond(reply)
    }
}

/// Yield until `condition` holds, failing after a bounded number of turns
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
