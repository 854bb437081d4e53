//! The duplicate-record ("new") on-disk IDL encoding.
//!
//! Duplicates are delegated to the store: each ID under a key is its own
//! duplicate record, a single big-endian 32-bit word, kept in sorted order
//! by the store's duplicate handling. Inserting is one append; there are no
//! indirect blocks. AllIds is a single duplicate record holding `NOID`,
//! which sorts first and is unambiguous because real IDs are non-zero.

use tracing::debug;

use super::shim::IdlTuning;
use super::IdList;
use crate::error::{Error, Result};
use crate::id::{EntryId, NOID};
use crate::store::{Db, StoreError, Txn};

use super::old::{DeleteOutcome, InsertDisposition};

fn decode_id(bytes: &[u8]) -> Result<EntryId> {
    let buf: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Serialization(format!("IDL record has length {}", bytes.len())))?;
    Ok(EntryId::from_be_bytes(buf))
}

fn records(txn: &Txn, db: Db, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
    match txn.get_all(db, key) {
        Ok(values) => Ok(Some(values)),
        Err(StoreError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Fetches the IDL under `key`; `None` when the key does not exist.
///
/// # Errors
///
/// Store and decoding failures propagate.
pub fn fetch(txn: &Txn, db: Db, key: &[u8], next_id: u32) -> Result<Option<IdList>> {
    let Some(values) = records(txn, db, key)? else {
        return Ok(None);
    };
    if values.first().map(Vec::as_slice) == Some(&NOID.to_be_bytes()[..]) {
        return Ok(Some(IdList::allids(next_id)));
    }
    let mut ids = Vec::with_capacity(values.len());
    for value in &values {
        ids.push(decode_id(value)?);
    }
    Ok(Some(IdList::from_ids(ids)))
}

/// Inserts `id`: a single duplicate-record append, with the AllIds
/// promotion once the key holds more than `allidslimit` records.
///
/// # Errors
///
/// Store failures propagate unchanged.
pub fn insert_key(
    txn: &Txn,
    db: Db,
    key: &[u8],
    id: EntryId,
    tuning: &IdlTuning,
) -> Result<InsertDisposition> {
    if let Some(values) = records(txn, db, key)? {
        if values.first().map(Vec::as_slice) == Some(&NOID.to_be_bytes()[..]) {
            return Ok(InsertDisposition::AllIds);
        }
        if values.len() + 1 > tuning.allidslimit {
            txn.del(db, key).map_err(Error::from)?;
            txn.put(db, key, &NOID.to_be_bytes())?;
            debug!(?id, "key promoted to AllIds");
            return Ok(InsertDisposition::NowAllIds);
        }
    }
    txn.put(db, key, &id.to_be_bytes())?;
    Ok(InsertDisposition::Normal)
}

/// Deletes one ID record.
///
/// # Errors
///
/// Store failures propagate unchanged.
pub fn delete_key(txn: &Txn, db: Db, key: &[u8], id: EntryId) -> Result<DeleteOutcome> {
    let Some(values) = records(txn, db, key)? else {
        return Ok(DeleteOutcome::Absent);
    };
    if values.first().map(Vec::as_slice) == Some(&NOID.to_be_bytes()[..]) {
        return Ok(DeleteOutcome::AllIds);
    }
    match txn.del_value(db, key, &id.to_be_bytes()) {
        Ok(()) => Ok(DeleteOutcome::Done),
        Err(StoreError::NotFound) => Ok(DeleteOutcome::Absent),
        Err(err) => Err(err.into()),
    }
}

/// Stores a complete IDL in one go, replacing whatever the key held.
///
/// # Errors
///
/// Store failures propagate unchanged.
pub fn store_block(
    txn: &Txn,
    db: Db,
    key: &[u8],
    idl: &IdList,
    tuning: &IdlTuning,
) -> Result<()> {
    if records(txn, db, key)?.is_some() {
        txn.del(db, key).map_err(Error::from)?;
    }
    match idl {
        IdList::AllIds { .. } => {
            txn.put(db, key, &NOID.to_be_bytes())?;
        }
        IdList::Regular { ids, .. } => {
            if ids.len() > tuning.allidslimit {
                txn.put(db, key, &NOID.to_be_bytes())?;
                return Ok(());
            }
            for id in ids {
                txn.put(db, key, &id.to_be_bytes())?;
            }
        }
    }
    Ok(())
}
