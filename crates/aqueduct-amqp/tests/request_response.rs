//! Correlated request-response over a link pair

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use aqueduct_amqp::{
    status_code, status_description, AmqpMessage, EngineEvent, PeerReply,
    RequestResponseChannel, RequestResponseOptions, UNDEFINED_STATUS_CODE,
};
use aqueduct_core::{AmqpError, ErrorCondition};
use assert_matches::assert_matches;
use common::{open, reply_with_status};
use std::time::Duration;

const MANAGEMENT: &str = "$management";

fn echo(_address: &str, request: &AmqpMessage) -> PeerReply {
    let mut reply = AmqpMessage::new()
        .application_property("statusCode", 200)
        .application_property("statusDescription", "OK");
    reply.body = request.body.clone();
    reply.properties.correlation_id = request.properties.message_id.clone();
    PeerReply::respond(reply)
}

#[tokio::test(start_paused = true)]
async fn response_is_matched_by_correlation_id() {
    let (connection, peer) = open().await;
    peer.set_behavior(echo);
    let session = connection.create_session("management").await.unwrap();
    let channel = session
        .create_request_response_channel("mgmt", MANAGEMENT)
        .await
        .unwrap();

    assert_eq!(channel.reply_to(), "mgmt-reply-to");
    let response = channel
        .send_request(AmqpMessage::with_value("ping"))
        .await
        .unwrap();

    assert_eq!(response.body, AmqpMessage::with_value("ping").body);
    assert_eq!(status_code(&response), 200);
    assert_eq!(status_description(&response), "OK");
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn dashed_status_keys_are_recognised() {
    let (connection, peer) = open().await;
    peer.set_behavior(reply_with_status(202));
    let session = connection.create_session("management").await.unwrap();
    let channel = session
        .create_request_response_channel("mgmt", MANAGEMENT)
        .await
        .unwrap();

    let response = channel.send_request(AmqpMessage::new()).await.unwrap();
    assert_eq!(status_code(&response), 202);
    assert_eq!(status_description(&response), "");
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_get_their_own_responses() {
    let (connection, peer) = open().await;
    peer.set_behavior(echo);
    let session = connection.create_session("management").await.unwrap();
    let channel = session
        .create_request_response_channel("mgmt", MANAGEMENT)
        .await
        .unwrap();

    let (first, second, third) = tokio::join!(
        channel.send_request(AmqpMessage::with_value("a")),
        channel.send_request(AmqpMessage::with_value("b")),
        channel.send_request(AmqpMessage::with_value("c")),
    );

    assert_eq!(first.unwrap().body, AmqpMessage::with_value("a").body);
    assert_eq!(second.unwrap().body, AmqpMessage::with_value("b").body);
    assert_eq!(third.unwrap().body, AmqpMessage::with_value("c").body);
}

#[tokio::test(start_paused = true)]
async fn unknown_correlation_ids_are_dropped() {
    let (connection, peer) = open().await;
    peer.set_behavior(|_address: &str, request: &AmqpMessage| {
        let stray = AmqpMessage::with_value("stray").correlation_id("not-a-request");
        let uncorrelated = AmqpMessage::with_value("uncorrelated");
        let mut reply = AmqpMessage::with_value("real");
        reply.properties.correlation_id = request.properties.message_id.clone();
        PeerReply {
            replies: vec![stray, uncorrelated, reply],
            ..PeerReply::default()
        }
    });
    let session = connection.create_session("management").await.unwrap();
    let channel = session
        .create_request_response_channel("mgmt", MANAGEMENT)
        .await
        .unwrap();

    let response = channel.send_request(AmqpMessage::new()).await.unwrap();
    assert_eq!(response.body, AmqpMessage::with_value("real").body);
    assert_eq!(status_code(&response), UNDEFINED_STATUS_CODE);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_and_frees_its_slot() {
    let (connection, peer) = open().await;
    peer.set_behavior(|_address: &str, _request: &AmqpMessage| PeerReply::default());
    let session = connection.create_session("management").await.unwrap();
    let channel = RequestResponseChannel::create(
        &session,
        "mgmt",
        MANAGEMENT,
        RequestResponseOptions::new(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    let err = channel
        .send_request(AmqpMessage::new())
        .await
        .unwrap_err();
    assert_matches!(
        err,
        AmqpError::RequestTimeout { timeout, .. } if timeout == Duration::from_secs(2)
    );
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn ended_response_link_fails_pending_requests() {
    let (connection, peer) = open().await;
    peer.set_behavior(|_address: &str, _request: &AmqpMessage| PeerReply::default());
    let session = connection.create_session("management").await.unwrap();
    let channel = session
        .create_request_response_channel("mgmt", MANAGEMENT)
        .await
        .unwrap();
    let receiver = peer.link_handle("mgmt:receiver").unwrap();

    let detach = async {
        common::eventually(|| channel.pending_requests() == 1).await;
        peer.inject(EngineEvent::Detached {
            handle: receiver,
            error: Some((ErrorCondition::LinkDetachForced, "entity moved".to_string())),
        });
    };
    let (result, ()) = tokio::join!(channel.send_request(AmqpMessage::new()), detach);

    assert_matches!(result, Err(AmqpError::Transport { .. }));
    let err = channel.send_request(AmqpMessage::new()).await.unwrap_err();
    assert_matches!(err, AmqpError::Transport { .. });
}
