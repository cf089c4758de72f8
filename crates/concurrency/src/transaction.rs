//! Transactions
//!
//! A [`Transaction`] collects units of work ([`TransactionTask`]s) enlisted
//! by store operations. On commit the tasks are driven through the commit
//! protocol of the [`TransactionManager`]; on rollback each task undoes
//! its tentative state change.
//!
//! Two kinds exist:
//!
//! - **Local**: explicit `commit()` / `rollback()` spanning many operations.
//!   Dropping an active local transaction rolls it back.
//! - **Auto-commit**: every enlisted task is committed on its own as soon as
//!   it is enlisted. The transaction stays active and can be reused.
//!
//! State transitions (local):
//! - `Active` → `Committing` (commit begins)
//! - `Committing` → `Committed` | `RolledBack`
//! - `Active` → `RolledBack` (explicit rollback or drop)

use crate::manager::TransactionManager;
use msgstore_core::{StoreError, StoreResult, TransactionId};
use msgstore_durability::CommitBatch;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Local or auto-commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Explicit commit/rollback
    Local,
    /// Each operation commits on its own
    AutoCommit,
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting work
    Active,
    /// Commit protocol running
    Committing,
    /// Committed; terminal
    Committed,
    /// Rolled back; terminal
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "Active",
            TransactionState::Committing => "Committing",
            TransactionState::Committed => "Committed",
            TransactionState::RolledBack => "RolledBack",
        };
        f.write_str(s)
    }
}

/// One unit of work enlisted in a transaction
///
/// The store's operations put their target into a transitional state
/// (Adding, Removing, ...) and enlist a task that finishes or reverts the
/// transition. Callbacks are invoked in protocol order, exactly once per
/// outcome: `precommit` → `records` → `commit`, or `rollback` at any point
/// before `commit`.
pub trait TransactionTask: Send {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Validate and capture whatever the commit needs; an error rolls the
    /// whole transaction back
    fn precommit(&mut self, _tx: TransactionId) -> StoreResult<()> {
        Ok(())
    }

    /// Contribute persistence records to the commit batch
    fn records(&self, _batch: &mut CommitBatch) {}

    /// Make the change permanent and visible
    fn commit(&mut self, tx: TransactionId);

    /// Revert the tentative change
    fn rollback(&mut self, tx: TransactionId);
}

/// Summary of work waiting in a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingWork {
    /// Tasks enlisted and not yet completed
    pub tasks: usize,
}

impl PendingWork {
    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.tasks == 0
    }
}

struct TransactionInner {
    state: TransactionState,
    tasks: Vec<Box<dyn TransactionTask>>,
}

/// A unit of work against the store
///
/// Methods take `&self`; the pending work sits behind a mutex, so a
/// transaction can be shared by reference with store operations.
pub struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    manager: Arc<TransactionManager>,
    inner: Mutex<TransactionInner>,
    start_time: Instant,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        kind: TransactionKind,
        manager: Arc<TransactionManager>,
    ) -> Self {
        Transaction {
            id,
            kind,
            manager,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Active,
                tasks: Vec::new(),
            }),
            start_time: Instant::now(),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Local or auto-commit
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Whether every operation commits on its own
    pub fn is_auto_commit(&self) -> bool {
        self.kind == TransactionKind::AutoCommit
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Whether work can still be enlisted
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Work enlisted and not yet completed
    pub fn pending_work(&self) -> PendingWork {
        PendingWork {
            tasks: self.inner.lock().tasks.len(),
        }
    }

    /// Time since the transaction began
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether this transaction was issued by `manager`
    pub fn belongs_to(&self, manager: &Arc<TransactionManager>) -> bool {
        Arc::ptr_eq(&self.manager, manager)
    }

    /// Fail unless work can be enlisted
    ///
    /// # Errors
    /// `StoreError::TransactionNotActive` when committing or completed.
    pub fn ensure_active(&self) -> StoreResult<()> {
        let state = self.state();
        if state == TransactionState::Active {
            Ok(())
        } else {
            Err(StoreError::TransactionNotActive {
                id: self.id,
                state: state.to_string(),
            })
        }
    }

    /// Enlist a unit of work
    ///
    /// For an auto-commit transaction the task is committed immediately and
    /// the commit outcome is returned. If the transaction is not active the
    /// task is rolled back before the error is returned, so the caller's
    /// tentative change never leaks.
    pub fn enlist(&self, mut task: Box<dyn TransactionTask>) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Active {
                let state = inner.state;
                drop(inner);
                task.rollback(self.id);
                return Err(StoreError::TransactionNotActive {
                    id: self.id,
                    state: state.to_string(),
                });
            }
            if self.kind == TransactionKind::Local {
                inner.tasks.push(task);
                return Ok(());
            }
        }

        self.manager.commit_auto(self.id, task)
    }

    /// Commit all enlisted work atomically
    ///
    /// # Errors
    /// - `TransactionNotActive` if already completed (or auto-commit)
    /// - whatever precommit or the persistence write failed with; the
    ///   transaction is then rolled back
    pub fn commit(&self) -> StoreResult<()> {
        let tasks = self.begin_completion(TransactionState::Committing)?;
        let result = self.manager.commit_local(self.id, tasks);
        self.inner.lock().state = match result {
            Ok(()) => TransactionState::Committed,
            Err(_) => TransactionState::RolledBack,
        };
        result
    }

    /// Discard all enlisted work
    ///
    /// # Errors
    /// `TransactionNotActive` if already completed (or auto-commit).
    pub fn rollback(&self) -> StoreResult<()> {
        let tasks = self.begin_completion(TransactionState::RolledBack)?;
        self.manager.rollback_local(self.id, tasks);
        Ok(())
    }

    fn begin_completion(
        &self,
        next: TransactionState,
    ) -> StoreResult<Vec<Box<dyn TransactionTask>>> {
        let mut inner = self.inner.lock();
        if self.kind == TransactionKind::AutoCommit || inner.state != TransactionState::Active {
            let state = if self.kind == TransactionKind::AutoCommit {
                "auto-commit".to_string()
            } else {
                inner.state.to_string()
            };
            return Err(StoreError::TransactionNotActive { id: self.id, state });
        }
        inner.state = next;
        Ok(std::mem::take(&mut inner.tasks))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &inner.state)
            .field("pending", &inner.tasks.len())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.kind != TransactionKind::Local {
            return;
        }
        let inner = self.inner.get_mut();
        if inner.state != TransactionState::Active {
            return;
        }
        inner.state = TransactionState::RolledBack;
        let tasks = std::mem::take(&mut inner.tasks);
        warn!(
            target: "msgstore::txn",
            txn = %self.id,
            pending = tasks.len(),
            "Active transaction dropped; rolling back"
        );
        self.manager.rollback_local(self.id, tasks);
    }
}
