//! The delete operation.
//!
//! Non-leaf entries refuse to go. A plain delete removes the `id2entry`
//! row, every index key, the DN record, the ancestor memberships, and
//! decrements the parent count. A delete whose context carries the
//! tombstone flag tombstones instead: the row is rewritten in place as
//! the tombstone form, full indexing is swapped for the minimal triple,
//! and the entry detaches from the hierarchy while keeping its ID and
//! unique ID. The flag and the CSN are independent signals; the CSN only
//! feeds the replication-vector piggyback. Deleting a tombstone itself
//! (reaping) removes it physically.

use tracing::debug;

use crate::entry::Dn;
use crate::error::{Error, Result};
use crate::index::IndexOp;
use crate::instance::Instance;
use crate::parents::{parent_update_on_childchange, ChildChange};
use crate::plugin::{HookPoint, OpInfo, OpKind};
use crate::txn::OpContext;

impl Instance {
    /// Deletes the entry at `dn`, tombstoning when the context requests
    /// it.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] for an unknown DN,
    /// [`Error::NotAllowedOnNonleaf`] when children exist,
    /// [`Error::Busy`] on retry exhaustion, plus store failures.
    pub fn delete(&self, ctx: &OpContext, dn: &Dn) -> Result<()> {
        self.check_writable()?;

        let entry = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let found = self.dn2entry(&probe, dn)?;
            probe.abort();
            found.ok_or_else(|| Error::NoSuchObject(dn.to_string()))?
        };
        let id = entry.id();

        {
            let info = OpInfo {
                kind: OpKind::Delete,
                dn,
                entry: Some(&entry),
            };
            if self.plugins().run(HookPoint::PreOp, &info)? {
                return Ok(());
            }
        }

        // Children block the delete (tombstones have none by
        // construction).
        if !entry.is_tombstone() {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let children = self.parentid_read(&probe, id)?;
            probe.abort();
            if !children.is_empty() {
                return Err(Error::NotAllowedOnNonleaf(dn.to_string()));
            }
        }

        let entry_lock = self.cache().entry_lock(id);
        let _entry_guard = entry_lock.lock();

        let make_tombstone = ctx.tombstone_requested() && !entry.is_tombstone();

        // Parent bookkeeping applies to live entries only.
        let (parent_entry, parent_uid) = if entry.is_tombstone() {
            (None, None)
        } else {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let parent = match entry.dn().parent() {
                Some(parent_dn) => self.dn2entry(&probe, &parent_dn)?,
                None => None,
            };
            probe.abort();
            let uid = parent.as_ref().map(|p| p.unique_id().to_string());
            (parent, uid)
        };
        let parent_lock = parent_entry
            .as_ref()
            .map(|p| self.cache().entry_lock(p.id()));
        let _parent_guard = parent_lock.as_ref().map(|l| l.lock());

        let saved_entry = entry;
        let saved_parent = parent_entry;
        let stone = make_tombstone.then(|| saved_entry.to_tombstone(parent_uid.as_deref()));

        let result = self.run_write(|txn| {
            let info = OpInfo {
                kind: OpKind::Delete,
                dn,
                entry: Some(&saved_entry),
            };
            self.plugins().run(HookPoint::TxnPre, &info)?;

            // Unindex the old image and detach from the hierarchy.
            self.index_addordel_entry(txn, &saved_entry, IndexOp::Del)?;
            self.ancestorid_index_entry(txn, &saved_entry, IndexOp::Del)?;
            self.dn_link_remove(txn, &saved_entry)?;

            match &stone {
                Some(stone) => {
                    // Tombstone: rewrite the row in place, minimal keys.
                    self.entry_store(txn, stone)?;
                    self.index_addordel_entry(txn, stone, IndexOp::Add)?;
                    let parent_id = saved_parent.as_ref().map(|p| p.id());
                    self.dn_link_add(txn, stone, parent_id)?;
                }
                None => {
                    self.entry_erase(txn, saved_entry.id())?;
                }
            }

            let parent_new = match &saved_parent {
                Some(parent) => {
                    let mut updated = parent.clone();
                    parent_update_on_childchange(&mut updated, ChildChange::Removed)?;
                    self.entry_store(txn, &updated)?;
                    Some(updated)
                }
                None => None,
            };
            self.ruv_piggyback(txn, ctx.csn())?;
            self.plugins().run(HookPoint::TxnPost, &info)?;
            Ok(parent_new)
        });

        match result {
            Ok(parent_new) => {
                match &stone {
                    Some(stone) => drop(self.cache().replace(id, stone.clone())),
                    None => self.cache().remove(id),
                }
                if let Some(updated) = parent_new {
                    let pid = updated.id();
                    drop(self.cache().replace(pid, updated));
                }
                let info = OpInfo {
                    kind: OpKind::Delete,
                    dn,
                    entry: None,
                };
                let _ = self.plugins().run(HookPoint::PostOp, &info);
                debug!(%id, tombstoned = stone.is_some(), "entry deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
