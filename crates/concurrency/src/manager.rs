//! Transaction manager for coordinating commit operations
//!
//! Provides atomic commit by orchestrating:
//! 1. Precommit (validation and hook vetoes)
//! 2. Persistence write (durability)
//! 3. Post-commit (visibility and notifications)
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. precommit() every task       - any error: rollback all, return error
//! 2. records() every task         - gather one CommitBatch
//! 3. PersistenceManager::write()  - DURABILITY POINT; error: rollback all
//! 4. commit() every task          - state transitions, post-commit hooks
//! ```
//!
//! If a crash occurs before step 3 completes, nothing of the transaction is
//! recovered. After step 3, the whole transaction is.
//!
//! The manager also tracks transaction metrics and gates new transactions
//! while the store shuts down.

use crate::transaction::{Transaction, TransactionKind, TransactionTask};
use msgstore_core::{StoreError, StoreResult, TransactionId};
use msgstore_durability::{CommitBatch, PersistenceManager};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Manages transaction lifecycle and atomic commits
///
/// The metric counters use Relaxed ordering; they are observational only.
pub struct TransactionManager {
    persistence: Arc<dyn PersistenceManager>,
    /// Next transaction id
    next_txn_id: AtomicU64,
    /// Whether new transactions may begin
    accepting: AtomicBool,
    /// Local transactions begun and not completed, plus auto-commit
    /// operations mid-commit
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_rolled_back: AtomicU64,
}

impl TransactionManager {
    /// Create a manager writing commits through `persistence`
    pub fn new(persistence: Arc<dyn PersistenceManager>) -> Self {
        TransactionManager {
            persistence,
            next_txn_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_rolled_back: AtomicU64::new(0),
        }
    }

    /// Persistence manager commits are written to
    pub fn persistence(&self) -> &Arc<dyn PersistenceManager> {
        &self.persistence
    }

    /// Allocate next transaction id
    pub fn next_txn_id(&self) -> TransactionId {
        TransactionId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Begin a transaction
    ///
    /// # Errors
    /// `StoreError::Unavailable` once the manager stopped accepting work.
    pub fn begin(self: &Arc<Self>, kind: TransactionKind) -> StoreResult<Transaction> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(
                "not accepting new transactions",
                None,
            ));
        }
        let id = self.next_txn_id();
        if kind == TransactionKind::Local {
            self.active_count.fetch_add(1, Ordering::SeqCst);
        }
        self.total_started.fetch_add(1, Ordering::Relaxed);
        debug!(target: "msgstore::txn", txn = %id, ?kind, "Transaction started");
        Ok(Transaction::new(id, kind, Arc::clone(self)))
    }

    /// Stop handing out new transactions
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Whether new transactions may begin
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run the commit protocol over a set of tasks
    fn run_commit(
        &self,
        tx: TransactionId,
        tasks: &mut [Box<dyn TransactionTask>],
    ) -> StoreResult<()> {
        for task in tasks.iter_mut() {
            if let Err(e) = task.precommit(tx) {
                warn!(
                    target: "msgstore::txn",
                    txn = %tx,
                    task = %task.describe(),
                    error = %e,
                    "Precommit failed; rolling back"
                );
                Self::rollback_all(tx, tasks);
                return Err(e);
            }
        }

        let mut batch = CommitBatch::new(tx);
        for task in tasks.iter() {
            task.records(&mut batch);
        }

        if !batch.is_empty() {
            if let Err(e) = self.persistence.write(&batch) {
                error!(
                    target: "msgstore::txn",
                    txn = %tx,
                    records = batch.len(),
                    error = %e,
                    "Persistence write failed; rolling back"
                );
                Self::rollback_all(tx, tasks);
                return Err(e);
            }
        }

        for task in tasks.iter_mut() {
            trace!(target: "msgstore::txn", txn = %tx, task = %task.describe(), "Post-commit");
            task.commit(tx);
        }
        Ok(())
    }

    fn rollback_all(tx: TransactionId, tasks: &mut [Box<dyn TransactionTask>]) {
        // Reverse order undoes dependent changes (a reference before the
        // item it refers to) first.
        for task in tasks.iter_mut().rev() {
            trace!(target: "msgstore::txn", txn = %tx, task = %task.describe(), "Rollback");
            task.rollback(tx);
        }
    }

    pub(crate) fn commit_local(
        &self,
        tx: TransactionId,
        mut tasks: Vec<Box<dyn TransactionTask>>,
    ) -> StoreResult<()> {
        let result = self.run_commit(tx, &mut tasks);
        self.record_completion(result.is_ok());
        match &result {
            Ok(()) => {
                debug!(target: "msgstore::txn", txn = %tx, tasks = tasks.len(), "Transaction committed")
            }
            Err(e) => {
                warn!(target: "msgstore::txn", txn = %tx, error = %e, "Transaction rolled back")
            }
        }
        result
    }

    pub(crate) fn rollback_local(
        &self,
        tx: TransactionId,
        mut tasks: Vec<Box<dyn TransactionTask>>,
    ) {
        Self::rollback_all(tx, &mut tasks);
        self.record_completion(false);
        debug!(target: "msgstore::txn", txn = %tx, tasks = tasks.len(), "Transaction rolled back");
    }

    pub(crate) fn commit_auto(
        &self,
        tx: TransactionId,
        task: Box<dyn TransactionTask>,
    ) -> StoreResult<()> {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        let mut tasks = vec![task];
        let result = self.run_commit(tx, &mut tasks);
        let _ = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| Some(x.saturating_sub(1)));
        if result.is_ok() {
            self.total_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_rolled_back.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn record_completion(&self, committed: bool) {
        let _ = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| Some(x.saturating_sub(1)));
        if committed {
            self.total_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current active transaction count
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait for all active transactions to complete
    ///
    /// Returns `false` if the timeout expired with transactions still active.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let sleep_duration = Duration::from_millis(1);
        while self.active_count.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(sleep_duration);
        }
        true
    }

    /// Get transaction metrics
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);
        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_rolled_back: self.total_rolled_back.load(Ordering::Relaxed),
        }
    }
}

/// Transaction metrics
///
/// Auto-commit transactions count once when begun and once per committed
/// or rolled back operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetrics {
    /// Number of currently active transactions
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of commits
    pub total_committed: u64,
    /// Total number of rollbacks
    pub total_rolled_back: u64,
}
