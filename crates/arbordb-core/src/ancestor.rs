//! The `ancestorid` index: every entry's transitive descendants.
//!
//! `parentid` holds the direct children of each non-leaf; `ancestorid`
//! holds the closure, so one-level subtree filters read one key. The
//! invariant: for every non-leaf `e`, `ancestorid[e]` equals the
//! transitive closure of `parentid[e]` over live entries.
//!
//! Three maintenance paths:
//!
//! - **Full rebuild** (offline, [`Instance::ancestorid_create_index`]):
//!   walks the non-leaf IDs from highest to lowest, so a child's complete
//!   descendant set exists before its parent consumes it. Two variants
//!   produce the same end state: the default accumulates intermediate
//!   sets in a hash map; the new-encoding variant writes each
//!   intermediate union straight to disk, trading RAM for writes.
//! - **Online update** ([`Instance::ancestorid_index_update`]): walks the
//!   DN chain upward on add/delete, stopping early once an ancestor is
//!   already AllIds (every higher ancestor is a superset).
//! - **Subtree move** ([`Instance::ancestorid_move_subtree`]): splits the
//!   old and new DN chains at their common ancestor and updates only the
//!   disjoint prefixes.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::entry::{Dn, Entry};
use crate::error::{Error, Result};
use crate::id::EntryId;
use crate::idl::IdList;
use crate::index::keys;
use crate::index::IndexOp;
use crate::instance::Instance;
use crate::store::{CursorOp, StoreError, Txn};

fn id_key(id: EntryId) -> Vec<u8> {
    keys::eq_key(id.to_string().as_bytes())
}

fn parse_id_key(key: &[u8]) -> Option<EntryId> {
    let body = key.strip_prefix(&[keys::EQ_PREFIX])?;
    let body = body.strip_suffix(&[0]).unwrap_or(body);
    std::str::from_utf8(body).ok()?.parse::<u32>().ok().map(EntryId)
}

impl Instance {
    /// Reads `ancestorid[id]` (the descendants of `id`); empty when the
    /// entry is a leaf.
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn ancestorid_read(&self, txn: &Txn, id: EntryId) -> Result<IdList> {
        let db = self.index_db("ancestorid")?;
        Ok(self
            .config()
            .idl_switch
            .fetch(txn, db, &id_key(id), self.next_id_value())?
            .unwrap_or_else(|| IdList::alloc(0)))
    }

    /// Reads `parentid[id]` (the direct children of `id`).
    ///
    /// # Errors
    ///
    /// Store failures propagate.
    pub fn parentid_read(&self, txn: &Txn, id: EntryId) -> Result<IdList> {
        let db = self.index_db("parentid")?;
        Ok(self
            .config()
            .idl_switch
            .fetch(txn, db, &id_key(id), self.next_id_value())?
            .unwrap_or_else(|| IdList::alloc(0)))
    }

    /// Every ID that appears as a `parentid` key, sorted: the non-leaves.
    fn nonleaf_ids(&self, txn: &Txn) -> Result<Vec<EntryId>> {
        let db = self.index_db("parentid")?;
        let mut cursor = txn.cursor(db).map_err(Error::from)?;
        let mut ids = Vec::new();
        let mut position = cursor.seek(CursorOp::First, None);
        loop {
            let (key, _) = match position {
                Ok(pair) => pair,
                Err(StoreError::NotFound) => break,
                Err(err) => return Err(err.into()),
            };
            if let Some(id) = parse_id_key(&key) {
                ids.push(id);
            }
            position = cursor.seek(CursorOp::NextNoDup, None);
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Rebuilds `ancestorid` from `parentid` from scratch.
    ///
    /// Preconditions: no writers (the attribute is additionally fenced
    /// OFFLINE for the duration) and an accurate `parentid`. The variant
    /// follows the active encoding.
    ///
    /// # Errors
    ///
    /// Store failures propagate; the OFFLINE fence is always released.
    pub fn ancestorid_create_index(&self) -> Result<()> {
        let ai = self
            .attrinfo()
            .get("ancestorid")
            .ok_or_else(|| Error::Operations("ancestorid attrinfo missing".into()))?;
        ai.set_offline(true);
        let out = self.ancestorid_build();
        ai.set_offline(false);
        out
    }

    fn ancestorid_build(&self) -> Result<()> {
        let db = self.index_db("ancestorid")?;
        self.store().truncate_db(db).map_err(Error::from)?;

        let txn = self.store().begin(None).map_err(Error::from)?;
        let nonleafs = self.nonleaf_ids(&txn)?;
        let out = if self.config().idl_switch.dup_sort() {
            self.ancestorid_new_idl_create(&txn, &nonleafs)
        } else {
            self.ancestorid_default_create(&txn, &nonleafs)
        };
        match out {
            Ok(()) => {
                txn.commit().map_err(Error::from)?;
                debug!(nonleafs = nonleafs.len(), "ancestorid rebuilt");
                Ok(())
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Default rebuild: accumulate intermediate descendant sets in memory.
    fn ancestorid_default_create(&self, txn: &Txn, nonleafs: &[EntryId]) -> Result<()> {
        let db = self.index_db("ancestorid")?;
        let ai = self
            .attrinfo()
            .get("ancestorid")
            .ok_or_else(|| Error::Operations("ancestorid attrinfo missing".into()))?;
        let tuning = *ai.tuning();
        let next_id = self.next_id_value();
        let encoding = self.config().idl_switch;

        let mut pending: FxHashMap<EntryId, IdList> = FxHashMap::default();
        // Highest first: children finish before their parents consume them.
        for &id in nonleafs.iter().rev() {
            let children = self.parentid_read(txn, id)?;
            let descendants = match pending.remove(&id) {
                Some(accumulated) => IdList::union(&children, &accumulated),
                None => children,
            };
            encoding.store_block(txn, db, &id_key(id), &descendants, &tuning, next_id)?;

            let parent = self.entry_fetch(txn, id)?.parent_id();
            if let Some(pid) = parent {
                let merged = match pending.remove(&pid) {
                    Some(existing) => IdList::union(&existing, &descendants),
                    None => descendants,
                };
                pending.insert(pid, merged);
            }
        }
        Ok(())
    }

    /// New-encoding rebuild: no in-memory map; every intermediate union
    /// goes straight to disk.
    fn ancestorid_new_idl_create(&self, txn: &Txn, nonleafs: &[EntryId]) -> Result<()> {
        let db = self.index_db("ancestorid")?;
        let ai = self
            .attrinfo()
            .get("ancestorid")
            .ok_or_else(|| Error::Operations("ancestorid attrinfo missing".into()))?;
        let tuning = *ai.tuning();
        let next_id = self.next_id_value();
        let encoding = self.config().idl_switch;

        for &id in nonleafs.iter().rev() {
            let children = self.parentid_read(txn, id)?;
            let on_disk = self.ancestorid_read(txn, id)?;
            let descendants = IdList::union(&children, &on_disk);
            encoding.store_block(txn, db, &id_key(id), &descendants, &tuning, next_id)?;

            let parent = self.entry_fetch(txn, id)?.parent_id();
            if let Some(pid) = parent {
                let existing = self.ancestorid_read(txn, pid)?;
                let merged = IdList::union(&existing, &descendants);
                encoding.store_block(txn, db, &id_key(pid), &merged, &tuning, next_id)?;
            }
        }
        Ok(())
    }

    /// Applies one membership change to `ancestorid[ancestor]`: `id` plus
    /// every member of `subtree`. Returns `true` when the walk can stop
    /// early (the ancestor is AllIds; every higher one is a superset).
    fn ancestorid_addordel(
        &self,
        txn: &Txn,
        ancestor: EntryId,
        id: EntryId,
        subtree: Option<&IdList>,
        op: IndexOp,
    ) -> Result<bool> {
        let db = self.index_db("ancestorid")?;
        let ai = self
            .attrinfo()
            .get("ancestorid")
            .ok_or_else(|| Error::Operations("ancestorid attrinfo missing".into()))?;
        let tuning = *ai.tuning();
        let next_id = self.next_id_value();
        let encoding = self.config().idl_switch;
        let key = id_key(ancestor);

        if let Some(subtree) = subtree {
            if subtree.is_allids() {
                return match op {
                    IndexOp::Add => {
                        encoding.store_block(txn, db, &key, subtree, &tuning, next_id)?;
                        Ok(true)
                    }
                    IndexOp::Del => {
                        warn!(%ancestor, "cannot subtract AllIds subtree, ancestorid left as superset");
                        Ok(true)
                    }
                };
            }
        }

        let members = std::iter::once(id).chain(subtree.into_iter().flat_map(IdList::iter));
        for member in members {
            match op {
                IndexOp::Add => {
                    use crate::idl::old::InsertDisposition;
                    let disposition =
                        encoding.insert_key(txn, db, &key, member, &tuning, next_id)?;
                    if disposition == InsertDisposition::AllIds {
                        return Ok(true);
                    }
                }
                IndexOp::Del => {
                    use crate::idl::old::DeleteOutcome;
                    if encoding.delete_key(txn, db, &key, member)? == DeleteOutcome::AllIds {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Walks the DN chain from `low` upward (optionally through `high`,
    /// per the include flags), updating each level's descendant set with
    /// `id` and `subtree`. Levels that resolve to no entry are skipped;
    /// the walk stops early at an AllIds ancestor.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn ancestorid_index_update(
        &self,
        txn: &Txn,
        low: &Dn,
        high: Option<&Dn>,
        include_low: bool,
        include_high: bool,
        id: EntryId,
        subtree: Option<&IdList>,
        op: IndexOp,
    ) -> Result<()> {
        let mut chain: Vec<Dn> = vec![low.clone()];
        chain.extend(low.ancestors());

        for (level, dn) in chain.iter().enumerate() {
            let at_high = high.is_some_and(|h| h == dn);
            let skip = (level == 0 && !include_low) || (at_high && !include_high);
            if !skip {
                if let Some(ancestor) = self.dn2id(txn, dn)? {
                    if self.ancestorid_addordel(txn, ancestor, id, subtree, op)? {
                        break;
                    }
                }
            }
            if at_high {
                break;
            }
        }
        Ok(())
    }

    /// Maintains `ancestorid` for one entry add or delete: the entry's ID
    /// joins (or leaves) every ancestor's descendant set. Tombstones are
    /// detached from the hierarchy and never touch it.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn ancestorid_index_entry(&self, txn: &Txn, entry: &Entry, op: IndexOp) -> Result<()> {
        if entry.is_tombstone() || entry.is_ruv() {
            return Ok(());
        }
        let Some(parent) = entry.dn().parent() else {
            return Ok(());
        };
        self.ancestorid_index_update(txn, &parent, None, true, true, entry.id(), None, op)
    }

    /// The subtree move: computes the common suffix of the old and new
    /// DNs, removes `id` + `subtree` from the ancestors exclusive to the
    /// old chain, and adds them to the ancestors exclusive to the new
    /// chain. The common ancestor and everything above it are already
    /// correct.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn ancestorid_move_subtree(
        &self,
        txn: &Txn,
        old_dn: &Dn,
        new_dn: &Dn,
        id: EntryId,
        subtree: Option<&IdList>,
    ) -> Result<()> {
        let old_chain: Vec<Dn> = old_dn.ancestors().collect();
        let new_chain: Vec<Dn> = new_dn.ancestors().collect();
        let common = old_chain
            .iter()
            .rev()
            .zip(new_chain.iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        for dn in &old_chain[..old_chain.len() - common] {
            if let Some(ancestor) = self.dn2id(txn, dn)? {
                if self.ancestorid_addordel(txn, ancestor, id, subtree, IndexOp::Del)? {
                    break;
                }
            }
        }
        for dn in &new_chain[..new_chain.len() - common] {
            if let Some(ancestor) = self.dn2id(txn, dn)? {
                if self.ancestorid_addordel(txn, ancestor, id, subtree, IndexOp::Add)? {
                    break;
                }
            }
        }
        Ok(())
    }
}
