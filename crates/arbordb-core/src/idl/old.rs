//! The block ("old") on-disk IDL encoding.
//!
//! A key maps to one of three block shapes, all sharing a fixed header of
//! two big-endian 32-bit words (`nmax`, `nids`) followed by big-endian IDs:
//!
//! - *Regular*: `nmax` > 0, `nids` > 0; the IDs of the list.
//! - *AllIds*: `nmax` == [`ALLIDSBLOCK`]; `nids` records the next-ID value
//!   at write time.
//! - *Indirect header*: `nids` == [`INDBLOCK`]; the payload is the sorted
//!   first IDs of the continuation blocks, terminated by `NOID`.
//!
//! Continuation blocks live under derived keys
//! `#<parent-key><first-id-decimal>`. A block that overflows `idl_maxids`
//! on insert splits at the insertion point into two continuations; once a
//! key would need more than `idl_maxindirect` continuations the whole set
//! collapses to a single AllIds block. Deletions cascade the other way:
//! an emptied continuation is removed from the header, and an emptied
//! header deletes the key.

use tracing::{debug, warn};

use super::shim::IdlTuning;
use super::{DeleteResult, IdList};
use crate::error::{Error, Result};
use crate::id::{EntryId, NOID};
use crate::store::{Db, StoreError, Txn};

/// `nmax` value marking an AllIds block.
pub const ALLIDSBLOCK: u32 = 0;

/// `nids` value marking an indirect header block.
pub const INDBLOCK: u32 = 0;

/// Prefix byte of continuation keys.
pub const CONT_PREFIX: u8 = b'#';

/// How an insert left the key, beyond plain success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertDisposition {
    /// Plain insert into a regular or continuation block.
    Normal,
    /// The key was already AllIds; nothing was written.
    AllIds,
    /// This insert promoted the key to AllIds.
    NowAllIds,
}

/// Outcome of a key-level delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The ID was removed (the key itself may be gone if emptied).
    Done,
    /// The ID was not under the key; idempotent deletes ignore this.
    Absent,
    /// The key is AllIds; individual IDs cannot be removed.
    AllIds,
}

/// Decoded shape of one stored block.
enum Block {
    Regular(Vec<EntryId>),
    AllIds,
    /// First IDs of the continuation blocks, terminator stripped.
    Indirect(Vec<EntryId>),
}

fn encode_regular(ids: &[EntryId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + ids.len() * 4);
    out.extend_from_slice(&u32::try_from(ids.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(&u32::try_from(ids.len()).unwrap_or(u32::MAX).to_be_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

fn encode_allids(nids: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&ALLIDSBLOCK.to_be_bytes());
    out.extend_from_slice(&nids.to_be_bytes());
    out
}

fn encode_indirect(firsts: &[EntryId]) -> Vec<u8> {
    let nmax = u32::try_from(firsts.len() + 1).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(8 + (firsts.len() + 1) * 4);
    out.extend_from_slice(&nmax.to_be_bytes());
    out.extend_from_slice(&INDBLOCK.to_be_bytes());
    for id in firsts {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out.extend_from_slice(&NOID.to_be_bytes());
    out
}

fn decode(bytes: &[u8]) -> Result<Block> {
    if bytes.len() < 8 || bytes.len() % 4 != 0 {
        return Err(Error::Serialization(format!(
            "IDL block has invalid length {}",
            bytes.len()
        )));
    }
    let word = |at: usize| -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[at..at + 4]);
        u32::from_be_bytes(buf)
    };
    let nmax = word(0);
    let nids = word(4);
    if nmax == ALLIDSBLOCK {
        return Ok(Block::AllIds);
    }
    let payload: Vec<EntryId> = (8..bytes.len()).step_by(4).map(|at| EntryId(word(at))).collect();
    if nids == INDBLOCK {
        let firsts = payload.into_iter().take_while(|&id| id != NOID).collect();
        return Ok(Block::Indirect(firsts));
    }
    let count = nids as usize;
    if payload.len() < count {
        return Err(Error::Serialization(format!(
            "IDL block claims {count} ids but holds {}",
            payload.len()
        )));
    }
    Ok(Block::Regular(payload.into_iter().take(count).collect()))
}

/// Builds the continuation key for `first_id` under `key`.
///
/// The parent key's NUL terminator moves to the end of the derived key.
#[must_use]
pub fn make_cont_key(key: &[u8], first_id: EntryId) -> Vec<u8> {
    let parent = key.strip_suffix(&[0]).unwrap_or(key);
    let mut out = Vec::with_capacity(parent.len() + 12);
    out.push(CONT_PREFIX);
    out.extend_from_slice(parent);
    out.extend_from_slice(first_id.0.to_string().as_bytes());
    out.push(0);
    out
}

fn get_block(txn: &Txn, db: Db, key: &[u8]) -> Result<Option<Block>> {
    match txn.get(db, key) {
        Ok(bytes) => Ok(Some(decode(&bytes)?)),
        Err(StoreError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Fetches the full IDL stored under `key`.
///
/// Returns `None` when the key does not exist. An indirect header pulls in
/// every continuation block, concatenated in order.
///
/// # Errors
///
/// Store and decoding failures propagate; a dangling continuation pointer
/// surfaces as a serialization error.
pub fn fetch(txn: &Txn, db: Db, key: &[u8], next_id: u32) -> Result<Option<IdList>> {
    let Some(block) = get_block(txn, db, key)? else {
        return Ok(None);
    };
    match block {
        Block::AllIds => Ok(Some(IdList::allids(next_id))),
        Block::Regular(ids) => Ok(Some(IdList::from_ids(ids))),
        Block::Indirect(firsts) => {
            let mut all = Vec::new();
            for first in &firsts {
                let cont_key = make_cont_key(key, *first);
                match get_block(txn, db, &cont_key)? {
                    Some(Block::Regular(mut ids)) => all.append(&mut ids),
                    _ => {
                        return Err(Error::Serialization(format!(
                            "missing continuation block for first id {first}"
                        )))
                    }
                }
            }
            Ok(Some(IdList::from_ids(all)))
        }
    }
}

/// Splits `ids` around a fresh `id`, producing the two halves the caller
/// stores as continuation blocks.
fn split_with(ids: &[EntryId], id: EntryId) -> (Vec<EntryId>, Vec<EntryId>) {
    let mut merged = ids.to_vec();
    if let Err(at) = merged.binary_search(&id) {
        merged.insert(at, id);
    }
    let half = merged.len().div_ceil(2);
    let right = merged.split_off(half);
    (merged, right)
}

/// Rewrites continuation `index` of `firsts` whose first ID changed:
/// deletes the record under the stale key, stores the block under the new
/// one, and rewrites the header.
fn change_first(
    txn: &Txn,
    db: Db,
    key: &[u8],
    firsts: &mut [EntryId],
    index: usize,
    old_first: EntryId,
    cont: &[EntryId],
) -> Result<()> {
    let Some(&new_first) = cont.first() else {
        return Err(Error::Operations("continuation emptied in change_first".into()));
    };
    txn.del(db, &make_cont_key(key, old_first))
        .map_err(Error::from)?;
    txn.put(db, &make_cont_key(key, new_first), &encode_regular(cont))?;
    firsts[index] = new_first;
    txn.put(db, key, &encode_indirect(firsts))?;
    Ok(())
}

/// Inserts into a bounded block. Mirrors the four-way contract the callers
/// dispatch on.
enum BlockInsert {
    Inserted,
    InsertedFirst,
    Already,
    Full,
}

fn insert_bounded(ids: &mut Vec<EntryId>, id: EntryId, maxids: usize) -> BlockInsert {
    match ids.binary_search(&id) {
        Ok(_) => BlockInsert::Already,
        Err(at) => {
            if ids.len() >= maxids {
                return BlockInsert::Full;
            }
            ids.insert(at, id);
            if at == 0 {
                BlockInsert::InsertedFirst
            } else {
                BlockInsert::Inserted
            }
        }
    }
}

/// Inserts `id` into the IDL at `key`.
///
/// # Errors
///
/// Store failures (deadlock included) propagate unchanged.
pub fn insert_key(
    txn: &Txn,
    db: Db,
    key: &[u8],
    id: EntryId,
    tuning: &IdlTuning,
    next_id: u32,
) -> Result<InsertDisposition> {
    let Some(block) = get_block(txn, db, key)? else {
        txn.put(db, key, &encode_regular(&[id]))?;
        return Ok(InsertDisposition::Normal);
    };

    match block {
        Block::AllIds => Ok(InsertDisposition::AllIds),

        Block::Regular(mut ids) => match insert_bounded(&mut ids, id, tuning.maxids) {
            BlockInsert::Inserted | BlockInsert::InsertedFirst => {
                txn.put(db, key, &encode_regular(&ids))?;
                Ok(InsertDisposition::Normal)
            }
            BlockInsert::Already => Ok(InsertDisposition::Normal),
            BlockInsert::Full => {
                if tuning.maxindirect < 2 {
                    txn.put(db, key, &encode_allids(next_id))?;
                    debug!(?id, "single-block key promoted straight to AllIds");
                    return Ok(InsertDisposition::NowAllIds);
                }
                let (left, right) = split_with(&ids, id);
                let firsts = [left[0], right[0]];
                txn.put(db, key, &encode_indirect(&firsts))?;
                txn.put(db, &make_cont_key(key, left[0]), &encode_regular(&left))?;
                txn.put(db, &make_cont_key(key, right[0]), &encode_regular(&right))?;
                Ok(InsertDisposition::Normal)
            }
        },

        Block::Indirect(mut firsts) => {
            // Select the continuation whose range covers the id.
            let mut at = firsts.partition_point(|&f| f <= id);
            if firsts.get(at.wrapping_sub(1)).copied() == Some(id) {
                return Ok(InsertDisposition::Normal); // already the lead id
            }
            at = at.saturating_sub(1);
            let old_first = firsts[at];
            let cont_key = make_cont_key(key, old_first);
            let Some(Block::Regular(mut cont)) = get_block(txn, db, &cont_key)? else {
                return Err(Error::Serialization(format!(
                    "missing continuation block for first id {old_first}"
                )));
            };

            match insert_bounded(&mut cont, id, tuning.maxids) {
                BlockInsert::Inserted => {
                    txn.put(db, &cont_key, &encode_regular(&cont))?;
                    Ok(InsertDisposition::Normal)
                }
                BlockInsert::InsertedFirst => {
                    change_first(txn, db, key, &mut firsts, at, old_first, &cont)?;
                    Ok(InsertDisposition::Normal)
                }
                BlockInsert::Already => Ok(InsertDisposition::Normal),
                BlockInsert::Full => {
                    if firsts.len() + 1 > tuning.maxindirect {
                        // Past the threshold: replace everything with AllIds.
                        for first in &firsts {
                            txn.del(db, &make_cont_key(key, *first))
                                .map_err(Error::from)?;
                        }
                        txn.put(db, key, &encode_allids(next_id))?;
                        debug!(?id, "indirect key promoted to AllIds");
                        return Ok(InsertDisposition::NowAllIds);
                    }
                    let (left, right) = split_with(&cont, id);
                    firsts.splice(at..=at, [left[0], right[0]]);
                    txn.put(db, key, &encode_indirect(&firsts))?;
                    if left[0] != old_first {
                        txn.del(db, &cont_key).map_err(Error::from)?;
                    }
                    txn.put(db, &make_cont_key(key, left[0]), &encode_regular(&left))?;
                    txn.put(db, &make_cont_key(key, right[0]), &encode_regular(&right))?;
                    Ok(InsertDisposition::Normal)
                }
            }
        }
    }
}

/// Deletes `id` from the IDL at `key`, cascading continuation and header
/// removal as blocks empty out.
///
/// # Errors
///
/// Store failures propagate unchanged.
pub fn delete_key(txn: &Txn, db: Db, key: &[u8], id: EntryId) -> Result<DeleteOutcome> {
    let Some(block) = get_block(txn, db, key)? else {
        return Ok(DeleteOutcome::Absent);
    };

    match block {
        Block::AllIds => Ok(DeleteOutcome::AllIds),

        Block::Regular(ids) => {
            let mut idl = IdList::from_ids(ids);
            match idl.delete_id(id) {
                DeleteResult::Absent => Ok(DeleteOutcome::Absent),
                DeleteResult::Emptied => {
                    txn.del(db, key).map_err(Error::from)?;
                    Ok(DeleteOutcome::Done)
                }
                _ => {
                    let ids = idl.ids().unwrap_or_default();
                    txn.put(db, key, &encode_regular(ids))?;
                    Ok(DeleteOutcome::Done)
                }
            }
        }

        Block::Indirect(mut firsts) => {
            let at = firsts.partition_point(|&f| f <= id);
            let Some(at) = at.checked_sub(1) else {
                return Ok(DeleteOutcome::Absent); // below the smallest block
            };
            let old_first = firsts[at];
            let cont_key = make_cont_key(key, old_first);
            let Some(Block::Regular(cont)) = get_block(txn, db, &cont_key)? else {
                return Err(Error::Serialization(format!(
                    "missing continuation block for first id {old_first}"
                )));
            };
            let mut cont_idl = IdList::from_ids(cont);
            match cont_idl.delete_id(id) {
                DeleteResult::Absent => Ok(DeleteOutcome::Absent),
                DeleteResult::Deleted => {
                    let ids = cont_idl.ids().unwrap_or_default();
                    txn.put(db, &cont_key, &encode_regular(ids))?;
                    Ok(DeleteOutcome::Done)
                }
                DeleteResult::DeletedFirstChanged => {
                    let ids = cont_idl.ids().unwrap_or_default().to_vec();
                    change_first(txn, db, key, &mut firsts, at, old_first, &ids)?;
                    Ok(DeleteOutcome::Done)
                }
                DeleteResult::Emptied => {
                    firsts.remove(at);
                    if firsts.is_empty() {
                        txn.del(db, key).map_err(Error::from)?;
                    } else {
                        txn.put(db, key, &encode_indirect(&firsts))?;
                    }
                    txn.del(db, &cont_key).map_err(Error::from)?;
                    Ok(DeleteOutcome::Done)
                }
                DeleteResult::AllIds => {
                    warn!("continuation block is AllIds, index needs a rebuild");
                    Ok(DeleteOutcome::Done)
                }
            }
        }
    }
}

/// Stores a complete IDL in one go (bulk import and rebuild paths). Any
/// existing value under `key` is replaced; continuation blocks from a prior
/// shape are not cleaned up, so callers run this against fresh keys.
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
    next_id: u32,
) -> Result<()> {
    match idl {
        IdList::AllIds { .. } => {
            txn.put(db, key, &encode_allids(next_id))?;
            Ok(())
        }
        IdList::Regular { ids, .. } => {
            if ids.len() > tuning.allidslimit {
                txn.put(db, key, &encode_allids(next_id))?;
                return Ok(());
            }
            if ids.len() <= tuning.maxids {
                if ids.is_empty() {
                    return Ok(());
                }
                txn.put(db, key, &encode_regular(ids))?;
                return Ok(());
            }
            // Needs splitting into continuation blocks under a header.
            let mut firsts = Vec::new();
            for chunk in ids.chunks(tuning.maxids) {
                let lead = chunk[0];
                txn.put(db, &make_cont_key(key, lead), &encode_regular(chunk))?;
                firsts.push(lead);
            }
            txn.put(db, key, &encode_indirect(&firsts))?;
            Ok(())
        }
    }
}
