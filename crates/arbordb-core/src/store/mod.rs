//! The ordered key/value substrate the engine runs on.
//!
//! The rest of the crate consumes exactly the contract exposed here: named
//! databases (one per attribute index plus `id2entry`), `get`/`put`/`del`
//! within multi-operation transactions, duplicate-record databases, cursors
//! with the seek operations of [`CursorOp`], nested transactions, and a set
//! of distinguishable error codes ([`StoreError`]). Any ordered store with
//! deadlock detection can sit behind this module; the in-crate
//! implementation is [`kv::Store`], an ordered map with per-key write locks,
//! immediate-conflict deadlock reporting and snapshot persistence.
//!
//! # Transaction model
//!
//! Writers buffer their mutations and take a per-key write lock at call
//! time. A lock held by another transaction surfaces as
//! [`StoreError::Deadlock`] immediately; the caller owns the retry loop.
//! Reads see committed state plus the transaction's own buffered writes
//! (read-committed). Child transactions merge their writes into the parent
//! on commit; only the root commit publishes to the tables.

mod kv;


pub use kv::{Cursor, Store, Txn};

use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by the store, distinguishable per the engine contract.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key (or duplicate record) does not exist.
    #[error("key not found")]
    NotFound,

    /// Lock conflict; the transaction must abort and the operation retry.
    #[error("deadlock detected")]
    Deadlock,

    /// The store is corrupt beyond this process's ability to continue.
    #[error("store requires recovery")]
    RunRecovery,

    /// The underlying volume is out of space.
    #[error("disk full")]
    DiskFull,

    /// The store files are not accessible with the current permissions.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or record decoding failed.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

/// Handle to an open database within the store.
///
/// Cheap to copy; stays valid for the lifetime of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Db(pub(crate) usize);

/// Cursor positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Position on the exact key (first duplicate).
    Set,
    /// Position on the smallest key greater than or equal to the given key.
    SetRange,
    /// Position on the first record.
    First,
    /// Position on the last record.
    Last,
    /// Advance one record (into duplicates of the same key first).
    Next,
    /// Advance to the first record of the next distinct key.
    NextNoDup,
    /// Step back one record.
    Prev,
}
