//! Encoding selection shim.
//!
//! One [`IdlKind`] is chosen per instance at open time (the `idl_switch`
//! configuration option, recorded in the `DBVERSION` file) and routed
//! through here so the index layer never cares which encoding is live.

use serde::{Deserialize, Serialize};

use super::old::{DeleteOutcome, InsertDisposition};
use super::{new, old, IdList};
use crate::error::Result;
use crate::id::EntryId;
use crate::store::{Db, Txn};

/// Which on-disk IDL encoding an instance uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlKind {
    /// Block encoding: header plus continuation blocks.
    Old,
    /// One duplicate record per ID.
    #[default]
    New,
}

impl IdlKind {
    /// Whether the index databases need duplicate-record support.
    #[must_use]
    pub const fn dup_sort(self) -> bool {
        matches!(self, Self::New)
    }
}

impl std::fmt::Display for IdlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Old => f.write_str("old"),
            Self::New => f.write_str("new"),
        }
    }
}

/// Per-attribute IDL tuning, derived from the page size and the AllIds
/// threshold the way the block encoding sizes its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlTuning {
    /// Maximum IDs in one block.
    pub maxids: usize,
    /// Maximum continuation blocks before a key collapses to AllIds.
    pub maxindirect: usize,
    /// Maximum IDs under one key in any shape.
    pub allidslimit: usize,
}

impl IdlTuning {
    /// Derives the tuning: a block holds `pagesize / 4 - 2` IDs, the
    /// indirect budget covers `allidsthreshold` with one block to spare,
    /// and the hard limit is their product.
    #[must_use]
    pub fn derive(pagesize: usize, allidsthreshold: usize) -> Self {
        let maxids = (pagesize / 4).saturating_sub(2).max(1);
        let maxindirect = allidsthreshold / maxids + 1;
        Self {
            maxids,
            maxindirect,
            allidslimit: maxids * maxindirect,
        }
    }
}

impl IdlKind {
    /// Fetches the IDL at `key`; `None` when the key does not exist.
    ///
    /// # Errors
    ///
    /// Store and decoding failures propagate.
    pub fn fetch(
        self,
        txn: &Txn,
        db: Db,
        key: &[u8],
        next_id: u32,
    ) -> Result<Option<IdList>> {
        match self {
            Self::Old => old::fetch(txn, db, key, next_id),
            Self::New => new::fetch(txn, db, key, next_id),
        }
    }

    /// Inserts one ID under `key`.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn insert_key(
        self,
        txn: &Txn,
        db: Db,
        key: &[u8],
        id: EntryId,
        tuning: &IdlTuning,
        next_id: u32,
    ) -> Result<InsertDisposition> {
        match self {
            Self::Old => old::insert_key(txn, db, key, id, tuning, next_id),
            Self::New => new::insert_key(txn, db, key, id, tuning),
        }
    }

    /// Deletes one ID under `key`.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn delete_key(
        self,
        txn: &Txn,
        db: Db,
        key: &[u8],
        id: EntryId,
    ) -> Result<DeleteOutcome> {
        match self {
            Self::Old => old::delete_key(txn, db, key, id),
            Self::New => new::delete_key(txn, db, key, id),
        }
    }

    /// Stores a complete IDL under `key` in one go.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn store_block(
        self,
        txn: &Txn,
        db: Db,
        key: &[u8],
        idl: &IdList,
        tuning: &IdlTuning,
        next_id: u32,
    ) -> Result<()> {
        match self {
            Self::Old => old::store_block(txn, db, key, idl, tuning, next_id),
            Self::New => new::store_block(txn, db, key, idl, tuning),
        }
    }
}
