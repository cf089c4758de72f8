//! Concurrency layer for the message store
//!
//! This crate implements the transaction model:
//! - Transaction: local (explicit commit/rollback) or auto-commit units of work
//! - TransactionTask: the tentative state change an operation enlists
//! - TransactionManager: id allocation, the commit protocol
//!   (precommit → persist → post-commit), shutdown gating and metrics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod transaction;

pub use manager::{TransactionManager, TransactionMetrics};
pub use transaction::{
    PendingWork, Transaction, TransactionKind, TransactionState, TransactionTask,
};
