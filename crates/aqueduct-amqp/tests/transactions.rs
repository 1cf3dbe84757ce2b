//! Transactions declared and discharged through the coordinator link

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use aqueduct_amqp::types::{Payload, Target, TransactionalState};
use aqueduct_amqp::{AmqpMessage, Frame, LinkOptions, TransactionState};
use aqueduct_core::AmqpError;
use assert_matches::assert_matches;
use common::open;

#[tokio::test(start_paused = true)]
async fn transactional_send_commits() {
    let (connection, peer) = open().await;
    let session = connection.create_session("main").await.unwrap();
    let sender = session
        .create_send_link("orders-sender", "orders", LinkOptions::default())
        .await
        .unwrap();
    let coordinator = session.create_transaction_coordinator().await.unwrap();

    let transaction = coordinator.create_transaction().await.unwrap();
    assert_eq!(transaction.id_string(), "1");
    assert!(transaction.is_active());

    sender
        .send_in_transaction(AmqpMessage::with_value("order-1"), &transaction)
        .await
        .unwrap();
    coordinator
        .complete_transaction(&transaction, true)
        .await
        .unwrap();
    assert_eq!(transaction.state(), TransactionState::Committed);

    let enlisted = peer.count_frames(|frame| {
        matches!(
            frame,
            Frame::Transfer {
                payload: Payload::Message(_),
                state: Some(TransactionalState { txn_id }),
                ..
            } if txn_id.as_slice() == b"1"
        )
    });
    assert_eq!(enlisted, 1);

    let discharges = peer.count_frames(|frame| {
        matches!(
            frame,
            Frame::Transfer {
                payload: Payload::Discharge { fail: false, .. },
                ..
            }
        )
    });
    assert_eq!(discharges, 1);
}

#[tokio::test(start_paused = true)]
async fn completed_transaction_refuses_more_work() {
    let (connection, _peer) = open().await;
    let session = connection.create_session("main").await.unwrap();
    let sender = session
        .create_send_link("orders-sender", "orders", LinkOptions::default())
        .await
        .unwrap();
    let coordinator = session.create_transaction_coordinator().await.unwrap();

    let transaction = coordinator.create_transaction().await.unwrap();
    coordinator
        .complete_transaction(&transaction, false)
        .await
        .unwrap();
    assert_eq!(transaction.state(), TransactionState::RolledBack);

    let err = sender
        .send_in_transaction(AmqpMessage::with_value("late"), &transaction)
        .await
        .unwrap_err();
    assert_matches!(err, AmqpError::Transaction { .. });

    let next = coordinator.create_transaction().await.unwrap();
    assert_eq!(next.id_string(), "2");
}

#[tokio::test(start_paused = true)]
async fn coordinator_link_targets_the_coordinator() {
    let (connection, peer) = open().await;
    let session = connection.create_session("main").await.unwrap();
    let _coordinator = session.create_transaction_coordinator().await.unwrap();

    let attaches = peer.count_frames(|frame| {
        matches!(
            frame,
            Frame::Attach {
                name,
                target: Some(Target::Coordinator),
                ..
            } if name == "coordinator"
        )
    });
    assert_eq!(attaches, 1);
}
