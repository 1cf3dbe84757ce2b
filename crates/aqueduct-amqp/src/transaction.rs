//! Transaction coordinator
//!
//! Transactions are declared and discharged by transferring control
//! payloads over a sending link attached to the coordinator target. The
//! coordinator only needs the link's send primitive, expressed by
//! [`DeliverySender`], so it can be driven by any link implementation.

use crate::connection::bounded;
use crate::types::{DeliveryOutcome, Payload, TransactionalState};
use aqueduct_core::{AmqpError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Send primitive of a link
#[async_trait]
pub trait DeliverySender: Send + Sync {
    /// Transfer `payload`, optionally enlisted in a transaction, and return
    /// the peer's outcome.
    async fn send_payload(
        &self,
        payload: Payload,
        state: Option<TransactionalState>,
    ) -> Result<DeliveryOutcome>;
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Not declared
    NoTransaction,
    /// Declare in flight
    Declaring,
    /// Declared; work can be enlisted
    Active,
    /// Discharge in flight
    Discharging,
    /// Discharged with commit
    Committed,
    /// Discharged with rollback
    RolledBack,
    /// Declare or discharge failed
    Failed,
}

impl TransactionState {
    /// Whether the transaction is finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

struct TransactionInner {
    id: Vec<u8>,
    state: TransactionState,
}

/// Handle to a declared transaction
///
/// Clones share the same state, so completing one clone completes them all.
#[derive(Clone)]
pub struct AmqpTransaction {
    inner: Arc<Mutex<TransactionInner>>,
}

impl fmt::Debug for AmqpTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpTransaction")
            .field("id", &self.id_string())
            .field("state", &self.state())
            .finish()
    }
}

impl AmqpTransaction {
    fn undeclared() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransactionInner {
                id: Vec::new(),
                state: TransactionState::NoTransaction,
            })),
        }
    }

    /// Transaction id assigned by the coordinator; empty until declared
    pub fn id(&self) -> Vec<u8> {
        self.inner.lock().id.clone()
    }

    /// Transaction id rendered as text
    pub fn id_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().id).into_owned()
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Whether work can still be enlisted
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    fn begin_declare(&self) {
        self.inner.lock().state = TransactionState::Declaring;
    }

    fn declared(&self, txn_id: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.id = txn_id;
        inner.state = TransactionState::Active;
    }

    fn begin_discharge(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Active {
            return Err(AmqpError::transaction(format!(
                "transaction {} cannot be completed: it is {:?}",
                String::from_utf8_lossy(&inner.id),
                inner.state
            )));
        }
        inner.state = TransactionState::Discharging;
        Ok(())
    }

    fn finish(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }
}

/// Declares and discharges transactions over a coordinator link
pub struct TransactionCoordinator<S> {
    sender: S,
    try_timeout: Duration,
}

impl<S> fmt::Debug for TransactionCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("try_timeout", &self.try_timeout)
            .finish()
    }
}

impl<S: DeliverySender> TransactionCoordinator<S> {
    /// Coordinate over `sender`, bounding each control transfer by `try_timeout`
    pub fn new(sender: S, try_timeout: Duration) -> Self {
        Self {
            sender,
            try_timeout,
        }
    }

    /// Link the control payloads travel over
    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Declare a new transaction.
    pub async fn create_transaction(&self) -> Result<AmqpTransaction> {
        let transaction = AmqpTransaction::undeclared();
        transaction.begin_declare();
        let result = bounded(
            "declare transaction",
            self.try_timeout,
            self.sender.send_payload(Payload::Declare, None),
        )
        .await;

        match result {
            Ok(DeliveryOutcome::Declared { txn_id }) => {
                transaction.declared(txn_id);
                info!(txn_id = %transaction.id_string(), "Transaction declared");
                Ok(transaction)
            }
            Ok(other) => {
                transaction.finish(TransactionState::Failed);
                warn!(outcome = ?other, "Declare refused");
                Err(AmqpError::transaction(format!(
                    "declare was answered with {other:?}"
                )))
            }
            Err(err) => {
                transaction.finish(TransactionState::Failed);
                Err(err)
            }
        }
    }

    /// Commit (`commit == true`) or roll back `transaction`.
    ///
    /// A transaction can be completed once; later calls fail without
    /// contacting the peer.
    pub async fn complete_transaction(
        &self,
        transaction: &AmqpTransaction,
        commit: bool,
    ) -> Result<()> {
        transaction.begin_discharge()?;
        debug!(txn_id = %transaction.id_string(), commit, "Discharging transaction");

        let result = bounded(
            "discharge transaction",
            self.try_timeout,
            self.sender.send_payload(
                Payload::Discharge {
                    txn_id: transaction.id(),
                    fail: !commit,
                },
                None,
            ),
        )
        .await;

        match result {
            Ok(DeliveryOutcome::Accepted) => {
                let state = if commit {
                    TransactionState::Committed
                } else {
                    TransactionState::RolledBack
                };
                transaction.finish(state);
                info!(txn_id = %transaction.id_string(), ?state, "Transaction discharged");
                Ok(())
            }
            Ok(other) => {
                transaction.finish(TransactionState::Failed);
                warn!(txn_id = %transaction.id_string(), outcome = ?other, "Discharge refused");
                Err(AmqpError::transaction(format!(
                    "discharge of transaction {} was answered with {other:?}",
                    transaction.id_string()
                )))
            }
            Err(err) => {
                transaction.finish(TransactionState::Failed);
                warn!(txn_id = %transaction.id_string(), error = %err, "Discharge failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqueduct_core::ErrorCondition;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSender {
        declares: AtomicUsize,
        discharges: Mutex<Vec<(Vec<u8>, bool)>>,
        reject_declare: bool,
        reject_discharge: bool,
    }

    #[async_trait]
    impl DeliverySender for RecordingSender {
        async fn send_payload(
            &self,
            payload: Payload,
            _state: Option<TransactionalState>,
        ) -> Result<DeliveryOutcome> {
            match payload {
                Payload::Declare if self.reject_declare => {
                    self.declares.fetch_add(1, Ordering::SeqCst);
                    Ok(DeliveryOutcome::Rejected {
                        condition: ErrorCondition::NotAllowed,
                        description: None,
                    })
                }
                Payload::Declare => {
                    self.declares.fetch_add(1, Ordering::SeqCst);
                    Ok(DeliveryOutcome::Declared {
                        txn_id: b"1".to_vec(),
                    })
                }
                Payload::Discharge { txn_id, fail } => {
                    self.discharges.lock().push((txn_id, fail));
                    if self.reject_discharge {
                        Ok(DeliveryOutcome::Rejected {
                            condition: ErrorCondition::TransactionUnknownId,
                            description: None,
                        })
                    } else {
                        Ok(DeliveryOutcome::Accepted)
                    }
                }
                _ => Ok(DeliveryOutcome::Accepted),
            }
        }
    }

    #[tokio::test]
    async fn test_commit_round_trip() {
        let coordinator =
            TransactionCoordinator::new(RecordingSender::default(), Duration::from_secs(5));

        let transaction = coordinator.create_transaction().await.unwrap();
        assert_eq!(transaction.id(), b"1");
        assert_eq!(transaction.state(), TransactionState::Active);

        coordinator
            .complete_transaction(&transaction, true)
            .await
            .unwrap();
        assert_eq!(transaction.state(), TransactionState::Committed);

        let sender = coordinator.sender();
        assert_eq!(sender.declares.load(Ordering::SeqCst), 1);
        assert_eq!(*sender.discharges.lock(), vec![(b"1".to_vec(), false)]);
    }

    #[tokio::test]
    async fn test_second_completion_fails_without_sending() {
        let coordinator =
            TransactionCoordinator::new(RecordingSender::default(), Duration::from_secs(5));
        let transaction = coordinator.create_transaction().await.unwrap();

        coordinator
            .complete_transaction(&transaction, false)
            .await
            .unwrap();
        assert_eq!(transaction.state(), TransactionState::RolledBack);

        let err = coordinator
            .complete_transaction(&transaction, true)
            .await
            .unwrap_err();
        assert_matches!(err, AmqpError::Transaction { .. });
        assert_eq!(coordinator.sender().discharges.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_discharge_fails_transaction() {
        let sender = RecordingSender {
            reject_discharge: true,
            ..RecordingSender::default()
        };
        let coordinator = TransactionCoordinator::new(sender, Duration::from_secs(5));
        let transaction = coordinator.create_transaction().await.unwrap();

        let err = coordinator
            .complete_transaction(&transaction, true)
            .await
            .unwrap_err();
        assert_matches!(err, AmqpError::Transaction { .. });
        assert_eq!(transaction.state(), TransactionState::Failed);
    }

    #[tokio::test]
    async fn test_refused_declare_is_a_transaction_error() {
        let sender = RecordingSender {
            reject_declare: true,
            ..RecordingSender::default()
        };
        let coordinator = TransactionCoordinator::new(sender, Duration::from_secs(5));

        let err = coordinator.create_transaction().await.unwrap_err();
        assert_matches!(err, AmqpError::Transaction { .. });
        assert_eq!(coordinator.sender().declares.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_moves_through_declare() {
        let transaction = AmqpTransaction::undeclared();
        assert_eq!(transaction.state(), TransactionState::NoTransaction);
        assert!(transaction.id().is_empty());

        transaction.begin_declare();
        assert_eq!(transaction.state(), TransactionState::Declaring);
        assert!(transaction.begin_discharge().is_err());

        transaction.declared(b"7".to_vec());
        assert!(transaction.is_active());
        assert_eq!(transaction.id_string(), "7");
    }
}
