//! Transactional publish coordination.
//!
//! Tagged publishes are staged in the topic's reserved staging queue and
//! only reach real subscriber queues once the producer commits, either
//! explicitly or by answering a checkback. This module tracks which staged
//! messages belong to which transaction; the staging queues own the
//! messages themselves.

use crate::messaging::holder::MessageHolder;
use crate::messaging::queue::QueueKey;
use crate::messaging::session::SessionRef;
use std::collections::HashMap;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Transaction State Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Collecting staged publishes.
    Ongoing,
    /// Released to subscriber queues.
    Committed,
    /// Staged publishes discarded.
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Ongoing => "ongoing",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

/// A staged message, addressed by its staging queue and tid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRef {
    pub queue: QueueKey,
    pub tid: String,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub txn_id: String,
    /// Session id of the producer that opened the transaction.
    pub producer: String,
    pub state: TransactionState,
    pub staged: Vec<StagedRef>,
    pub started_at: Instant,
}

impl Transaction {
    pub fn new(txn_id: String, producer: String) -> Self {
        Self {
            txn_id,
            producer,
            state: TransactionState::Ongoing,
            staged: Vec::new(),
            started_at: Instant::now(),
        }
    }

    fn finish(&mut self, state: TransactionState) -> Result<Vec<StagedRef>, TransactionError> {
        if self.state.is_terminal() {
            return Err(TransactionError::InvalidState {
                current: self.state,
                expected: TransactionState::Ongoing,
            });
        }
        self.state = state;
        Ok(std::mem::take(&mut self.staged))
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// No transaction with this id.
    NotFound(String),
    /// Operation not valid in the current state.
    InvalidState {
        current: TransactionState,
        expected: TransactionState,
    },
    /// Transaction belongs to a different producer.
    ProducerMismatch { txn_id: String, producer: String },
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionError::NotFound(id) => write!(f, "transaction not found: {id}"),
            TransactionError::InvalidState { current, expected } => write!(
                f,
                "invalid transaction state: {} (expected {})",
                current.as_str(),
                expected.as_str()
            ),
            TransactionError::ProducerMismatch { txn_id, producer } => {
                write!(f, "transaction {txn_id} is not owned by {producer}")
            }
        }
    }
}

impl std::error::Error for TransactionError {}

// ---------------------------------------------------------------------------
// Staging seam
// ---------------------------------------------------------------------------

/// What a staging queue needs from its broker to settle a checkback.
pub trait StagingResolver: Send + Sync {
    /// The live session of the producer that staged a message.
    fn producer_session(&self, sender: &str) -> Option<SessionRef>;
    /// Producer answered commit: release through fan-out.
    fn commit_staged(&self, holder: MessageHolder);
    /// Producer answered rollback or is gone: discard.
    fn rollback_staged(&self, holder: MessageHolder);
}

// ---------------------------------------------------------------------------
// Transaction Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TransactionCoordinator {
    transactions: HashMap<String, Transaction>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction for `producer` and returns its id.
    pub fn begin(&mut self, producer: &str) -> String {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        self.transactions.insert(
            txn_id.clone(),
            Transaction::new(txn_id.clone(), producer.to_string()),
        );
        txn_id
    }

    /// Records a staged message. Unknown ids open a transaction implicitly,
    /// which is how producers that only tag messages are tracked.
    pub fn stage(
        &mut self,
        txn_id: &str,
        producer: &str,
        staged: StagedRef,
    ) -> Result<(), TransactionError> {
        let txn = self
            .transactions
            .entry(txn_id.to_string())
            .or_insert_with(|| Transaction::new(txn_id.to_string(), producer.to_string()));
        if txn.state.is_terminal() {
            return Err(TransactionError::InvalidState {
                current: txn.state,
                expected: TransactionState::Ongoing,
            });
        }
        if txn.producer != producer {
            return Err(TransactionError::ProducerMismatch {
                txn_id: txn_id.to_string(),
                producer: producer.to_string(),
            });
        }
        txn.staged.push(staged);
        Ok(())
    }

    pub fn take_for_commit(&mut self, txn_id: &str) -> Result<Vec<StagedRef>, TransactionError> {
        self.settle(txn_id, TransactionState::Committed)
    }

    pub fn take_for_rollback(&mut self, txn_id: &str) -> Result<Vec<StagedRef>, TransactionError> {
        self.settle(txn_id, TransactionState::RolledBack)
    }

    fn settle(
        &mut self,
        txn_id: &str,
        state: TransactionState,
    ) -> Result<Vec<StagedRef>, TransactionError> {
        let txn = self
            .transactions
            .get_mut(txn_id)
            .ok_or_else(|| TransactionError::NotFound(txn_id.to_string()))?;
        let staged = txn.finish(state)?;
        tracing::debug!(
            txn = %txn_id,
            state = state.as_str(),
            age_ms = txn.duration().as_millis() as u64,
            staged = staged.len(),
            "transaction settled"
        );
        self.transactions.remove(txn_id);
        Ok(staged)
    }

    /// Drops one staged message settled by a checkback answer. The
    /// transaction disappears with its last staged message.
    pub fn forget_staged(&mut self, txn_id: &str, tid: &str) {
        let empty = match self.transactions.get_mut(txn_id) {
            Some(txn) => {
                txn.staged.retain(|s| s.tid != tid);
                txn.staged.is_empty()
            }
            None => return,
        };
        if empty {
            self.transactions.remove(txn_id);
        }
    }

    pub fn get(&self, txn_id: &str) -> Option<&Transaction> {
        self.transactions.get(txn_id)
    }

    /// Ids of transactions opened by `producer`.
    pub fn owned_by(&self, producer: &str) -> Vec<String> {
        self.transactions
            .values()
            .filter(|t| t.producer == producer)
            .map(|t| t.txn_id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(tid: &str) -> StagedRef {
        StagedRef {
            queue: QueueKey::staging("orders"),
            tid: tid.to_string(),
        }
    }

    #[test]
    fn commit_returns_staged_and_closes() {
        let mut coord = TransactionCoordinator::new();
        let txn = coord.begin("producer-1");
        coord.stage(&txn, "producer-1", staged("a")).unwrap();
        coord.stage(&txn, "producer-1", staged("b")).unwrap();
        let refs = coord.take_for_commit(&txn).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(coord.count(), 0);
        assert_eq!(
            coord.take_for_rollback(&txn),
            Err(TransactionError::NotFound(txn.clone()))
        );
    }

    #[test]
    fn implicit_transaction_and_forget() {
        let mut coord = TransactionCoordinator::new();
        coord.stage("tx", "p", staged("a")).unwrap();
        coord.stage("tx", "p", staged("b")).unwrap();
        assert_eq!(coord.owned_by("p"), vec!["tx".to_string()]);
        coord.forget_staged("tx", "a");
        assert_eq!(coord.get("tx").unwrap().staged.len(), 1);
        coord.forget_staged("tx", "b");
        assert!(coord.get("tx").is_none());
    }

    #[test]
    fn other_producer_cannot_stage() {
        let mut coord = TransactionCoordinator::new();
        let txn = coord.begin("p1");
        assert!(matches!(
            coord.stage(&txn, "p2", staged("a")),
            Err(TransactionError::ProducerMismatch { .. })
        ));
    }

    #[test]
    fn terminal_states() {
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
        assert!(!TransactionState::Ongoing.is_terminal());
    }
}
