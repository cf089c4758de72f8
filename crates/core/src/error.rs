//! Error types for the message store
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into a small number of kinds (see [`ErrorKind`]) so that
//! callers can tell "try again later" (resource exhaustion) apart from
//! "never going to work with this input" (protocol violation) and from
//! "the store is down" (unavailable).

use crate::state::ItemState;
use crate::types::{ItemId, LockId, TransactionId};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Broad classification of a [`StoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation invoked in an incompatible state; a caller bug
    ProtocolViolation,
    /// A limit was hit; retrying later may succeed
    ResourceExhausted,
    /// The store is stopped or failed to start
    Unavailable,
    /// Disk or encoding failure in the persistence layer
    Persistence,
    /// Invalid configuration
    Configuration,
    /// Unexpected internal condition
    Internal,
}

/// Error types for the message store
#[derive(Debug, Error)]
pub enum StoreError {
    /// An item was asked to do something its current state does not allow
    #[error("Invalid state for {operation} on {id}: item is {state}")]
    InvalidState {
        /// Item the operation targeted
        id: ItemId,
        /// State the item was in
        state: ItemState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// The lock id presented does not match the one issued
    #[error("Lock id mismatch on {id}: held by {expected}, presented {actual}")]
    LockIdMismatch {
        /// Item the operation targeted
        id: ItemId,
        /// Lock id currently held
        expected: LockId,
        /// Lock id presented by the caller
        actual: LockId,
    },

    /// A reference does not satisfy the reference consistency rules
    #[error("Reference consistency violation: {0}")]
    ReferenceConsistencyViolation(String),

    /// An add was attempted that can never succeed as requested
    #[error("Invalid add operation: {0}")]
    InvalidAddOperation(String),

    /// The transaction is no longer accepting work
    #[error("Transaction {id} is not active: {state}")]
    TransactionNotActive {
        /// Transaction id
        id: TransactionId,
        /// Human-readable state
        state: String,
    },

    /// Work was presented under a transaction other than the one that owns it
    #[error("Transaction mismatch: {0}")]
    TransactionMismatch(String),

    /// Stream depth limit reached
    #[error("Stream {stream} is full (limit {limit})")]
    StreamFull {
        /// Stream that rejected the add
        stream: ItemId,
        /// Configured maximum depth
        limit: u64,
    },

    /// In-memory item cache has no room left
    #[error("Cache space exhausted: requested {requested} bytes, limit {limit}")]
    CacheSpaceExhausted {
        /// Bytes the add needed
        requested: u64,
        /// Configured cache limit
        limit: u64,
    },

    /// Permanent store file would exceed its maximum size
    #[error("Persistent store full: {size} bytes exceeds limit {limit}")]
    PersistentStoreFull {
        /// Size the file would have reached
        size: u64,
        /// Configured maximum size
        limit: u64,
    },

    /// A lifecycle operation was invoked in a store state that forbids it
    #[error("Cannot {operation} a message store that is {state}")]
    InvalidStoreState {
        /// Store state at the time
        state: String,
        /// Lifecycle operation that was attempted
        operation: &'static str,
    },

    /// The store is not started, has been stopped, or failed to start
    #[error("Message store unavailable: {message}")]
    Unavailable {
        /// Human-readable reason
        message: String,
        /// Original start-up failure, when there was one
        #[source]
        cause: Option<Arc<StoreError>>,
    },

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Persistence manager failure not covered by the variants above
    #[error("Persistence error: {message}")]
    Persistence {
        /// Human-readable reason
        message: String,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A recovered record names an item type nobody registered
    #[error("Unknown item type '{0}'")]
    UnknownItemType(String),

    /// Unexpected internal condition
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Build an invalid-state protocol violation
    pub fn invalid_state(id: ItemId, state: ItemState, operation: &'static str) -> Self {
        StoreError::InvalidState {
            id,
            state,
            operation,
        }
    }

    /// Build an unavailable error, chaining the start-up failure if any
    pub fn unavailable(message: impl Into<String>, cause: Option<Arc<StoreError>>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
            cause,
        }
    }

    /// Build a reference consistency violation
    pub fn reference_violation(message: impl Into<String>) -> Self {
        StoreError::ReferenceConsistencyViolation(message.into())
    }

    /// Build an invalid add operation error
    pub fn invalid_add(message: impl Into<String>) -> Self {
        StoreError::InvalidAddOperation(message.into())
    }

    /// Build a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        StoreError::Persistence {
            message: message.into(),
        }
    }

    /// Build a configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        StoreError::InvalidConfig(message.into())
    }

    /// Build an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal(message.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidState { .. }
            | StoreError::LockIdMismatch { .. }
            | StoreError::ReferenceConsistencyViolation(_)
            | StoreError::InvalidAddOperation(_)
            | StoreError::TransactionNotActive { .. }
            | StoreError::TransactionMismatch(_)
            | StoreError::InvalidStoreState { .. } => ErrorKind::ProtocolViolation,
            StoreError::StreamFull { .. }
            | StoreError::CacheSpaceExhausted { .. }
            | StoreError::PersistentStoreFull { .. } => ErrorKind::ResourceExhausted,
            StoreError::Unavailable { .. } => ErrorKind::Unavailable,
            StoreError::Io(_)
            | StoreError::Serialization(_)
            | StoreError::Corruption(_)
            | StoreError::Persistence { .. } => ErrorKind::Persistence,
            StoreError::InvalidConfig(_) | StoreError::UnknownItemType(_) => {
                ErrorKind::Configuration
            }
            StoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhausted
    }

    /// Whether this error reports a caller protocol bug
    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::ProtocolViolation
    }

    /// Whether this is the store-unavailable error
    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
