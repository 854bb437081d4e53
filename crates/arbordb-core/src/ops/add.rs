//! The add operation.
//!
//! Three shapes share the envelope:
//!
//! - **Normal add**: fresh ID, tentative cache reservation of the DN
//!   slot, full indexing, parent subordinate-count bump.
//! - **Tombstone add** (replication): the DN is rewritten to
//!   `nsuniqueid=<uid>,<original>`, only the minimal index triple is
//!   written, parentage travels as `nsparentuniqueid`, and the hierarchy
//!   indexes are left alone.
//! - **Tombstone resurrection**: an add whose unique ID names an existing
//!   tombstone revives it in place: same ID, original DN restored, the
//!   tombstone-only index entries replaced by full indexing, glue
//!   objectclass added under the operation's CSN.

use tracing::debug;

use crate::entry::{opattr, Entry};
use crate::error::{Error, Result};
use crate::id::{EntryId, NOID};
use crate::index::IndexOp;
use crate::instance::Instance;
use crate::parents::{parent_update_on_childchange, ChildChange};
use crate::plugin::{HookPoint, OpInfo, OpKind};
use crate::txn::OpContext;

impl Instance {
    /// Adds `entry` to the directory.
    ///
    /// Returns the assigned entry ID ([`NOID`] when a pre-op plugin voted
    /// NOOP and the operation committed as a no-op success).
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] for an occupied DN,
    /// [`Error::NoSuchObject`] for a missing parent,
    /// [`Error::MaxIdReached`] on ID exhaustion, [`Error::Busy`] when the
    /// retry budget runs out, plus store failures.
    pub fn add(&self, ctx: &OpContext, entry: Entry) -> Result<EntryId> {
        self.check_writable()?;
        {
            let info = OpInfo {
                kind: OpKind::Add,
                dn: entry.dn(),
                entry: Some(&entry),
            };
            if self.plugins().run(HookPoint::PreOp, &info)? {
                return Ok(NOID);
            }
        }

        // An add whose unique ID names an existing tombstone is a
        // resurrection; a live holder of the ID is a conflict.
        {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let holder = self.uniqueid2entry(&probe, entry.unique_id())?;
            probe.abort();
            if let Some(holder) = holder {
                if holder.is_tombstone() && !entry.is_tombstone() {
                    return self.resurrect_tombstone(ctx, &holder);
                }
                return Err(Error::AlreadyExists(holder.dn().to_string()));
            }
        }

        if entry.is_tombstone() {
            return self.add_tombstone(ctx, entry);
        }
        self.add_normal(ctx, entry)
    }

    fn add_normal(&self, ctx: &OpContext, mut entry: Entry) -> Result<EntryId> {
        if !self.config().suffix.is_empty() {
            let suffix = crate::entry::Dn::parse(&self.config().suffix)?;
            if !entry.dn().is_below(&suffix) {
                return Err(Error::NoSuchObject(entry.dn().to_string()));
            }
        }

        // Resolve the parent and check the target slot.
        let (parent_entry, parent_id) = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            if self.dn2entry(&probe, entry.dn())?.is_some() {
                probe.abort();
                return Err(Error::AlreadyExists(entry.dn().to_string()));
            }
            let out = match entry.dn().parent() {
                Some(parent_dn) => {
                    let parent = self.dn2entry(&probe, &parent_dn)?.ok_or_else(|| {
                        Error::NoSuchObject(parent_dn.to_string())
                    })?;
                    let pid = parent.id();
                    (Some(parent), Some(pid))
                }
                None => (None, None),
            };
            probe.abort();
            out
        };

        let id = self.next_id().next()?;
        entry.set_bookkeeping(id, parent_id);

        // Reserve the cache slots before the transaction; a racing add of
        // the same DN fails here instead of deadlocking below.
        let tentative = self.cache().add_tentative(entry.clone())?;

        let parent_lock = parent_id.map(|pid| self.cache().entry_lock(pid));
        let _parent_guard = parent_lock.as_ref().map(|l| l.lock());

        let saved_entry = entry;
        let saved_parent = parent_entry;
        let result = self.run_write(|txn| {
            let info = OpInfo {
                kind: OpKind::Add,
                dn: saved_entry.dn(),
                entry: Some(&saved_entry),
            };
            self.plugins().run(HookPoint::TxnPre, &info)?;

            self.entry_store(txn, &saved_entry)?;
            self.dn_link_add(txn, &saved_entry, parent_id)?;
            self.index_addordel_entry(txn, &saved_entry, IndexOp::Add)?;
            self.ancestorid_index_entry(txn, &saved_entry, IndexOp::Add)?;

            let parent_new = match &saved_parent {
                Some(parent) => {
                    let mut updated = parent.clone();
                    parent_update_on_childchange(&mut updated, ChildChange::Added)?;
                    self.entry_store(txn, &updated)?;
                    Some(updated)
                }
                None => None,
            };
            self.ruv_piggyback(txn, ctx.csn())?;
            self.plugins().run(HookPoint::TxnPost, &info)?;
            Ok(parent_new)
        });

        drop(tentative);
        match result {
            Ok(parent_new) => {
                self.cache().confirm(id);
                if let Some(updated) = parent_new {
                    let pid = updated.id();
                    drop(self.cache().replace(pid, updated));
                }
                let committed = self
                    .cache()
                    .find_by_id(id)
                    .map(|pinned| (*pinned).clone());
                if let Some(committed) = committed {
                    let info = OpInfo {
                        kind: OpKind::Add,
                        dn: committed.dn(),
                        entry: Some(&committed),
                    };
                    let _ = self.plugins().run(HookPoint::PostOp, &info);
                }
                debug!(%id, "entry added");
                Ok(id)
            }
            Err(err) => {
                self.cache().remove(id);
                self.next_id().give_back(id);
                Err(err)
            }
        }
    }

    fn add_tombstone(&self, ctx: &OpContext, mut entry: Entry) -> Result<EntryId> {
        // Replicated tombstones may arrive with the original DN; rewrite.
        let already_rewritten = entry
            .dn()
            .rdn()
            .is_some_and(|rdn| rdn.starts_with("nsuniqueid="));
        if !already_rewritten {
            let parent_uid = entry
                .first_value_str(opattr::NSPARENTUNIQUEID)
                .map(str::to_string);
            entry = entry.to_tombstone(parent_uid.as_deref());
        }

        let id = self.next_id().next()?;
        entry.set_id(id);
        entry.set_single_str(opattr::ENTRYID, &id.to_string());
        entry.remove_attr(opattr::PARENTID);

        // Link under the parent named by nsparentuniqueid, when it still
        // exists; the tombstone stays resolvable by unique ID regardless.
        let parent_id = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let pid = match entry.first_value_str(opattr::NSPARENTUNIQUEID) {
                Some(uid) => {
                    let uid = uid.to_string();
                    self.uniqueid2entry(&probe, &uid)?.map(|p| p.id())
                }
                None => None,
            };
            probe.abort();
            pid
        };

        let tentative = self.cache().add_tentative(entry.clone())?;
        let saved = entry;
        let result = self.run_write(|txn| {
            self.entry_store(txn, &saved)?;
            self.dn_link_add(txn, &saved, parent_id)?;
            self.index_addordel_entry(txn, &saved, IndexOp::Add)?;
            self.ruv_piggyback(txn, ctx.csn())?;
            Ok(())
        });

        drop(tentative);
        match result {
            Ok(()) => {
                self.cache().confirm(id);
                debug!(%id, "tombstone added");
                Ok(id)
            }
            Err(err) => {
                self.cache().remove(id);
                self.next_id().give_back(id);
                Err(err)
            }
        }
    }

    fn resurrect_tombstone(&self, ctx: &OpContext, stone: &Entry) -> Result<EntryId> {
        let id = stone.id();
        let entry_lock = self.cache().entry_lock(id);
        let _entry_guard = entry_lock.lock();

        let mut revived = stone.resurrect(ctx.csn())?;

        // Reattach to the hierarchy.
        let (parent_entry, parent_id) = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let out = match revived.dn().parent() {
                Some(parent_dn) => {
                    let parent = self.dn2entry(&probe, &parent_dn)?.ok_or_else(|| {
                        Error::NoSuchObject(parent_dn.to_string())
                    })?;
                    let pid = parent.id();
                    (Some(parent), Some(pid))
                }
                None => (None, None),
            };
            probe.abort();
            out
        };
        revived.set_bookkeeping(id, parent_id);

        let parent_lock = parent_id.map(|pid| self.cache().entry_lock(pid));
        let _parent_guard = parent_lock.as_ref().map(|l| l.lock());

        let saved_stone = stone.clone();
        let saved_revived = revived;
        let saved_parent = parent_entry;
        let result = self.run_write(|txn| {
            // Drop the three tombstone-only index entries, then index the
            // revived entry in full.
            self.index_addordel_entry(txn, &saved_stone, IndexOp::Del)?;
            self.dn_link_remove(txn, &saved_stone)?;

            self.entry_store(txn, &saved_revived)?;
            self.dn_link_add(txn, &saved_revived, parent_id)?;
            self.index_addordel_entry(txn, &saved_revived, IndexOp::Add)?;
            self.ancestorid_index_entry(txn, &saved_revived, IndexOp::Add)?;

            let parent_new = match &saved_parent {
                Some(parent) => {
                    let mut updated = parent.clone();
                    parent_update_on_childchange(&mut updated, ChildChange::Added)?;
                    self.entry_store(txn, &updated)?;
                    Some(updated)
                }
                None => None,
            };
            self.ruv_piggyback(txn, ctx.csn())?;
            Ok((saved_revived.clone(), parent_new))
        });

        match result {
            Ok((revived, parent_new)) => {
                drop(self.cache().replace(id, revived));
                if let Some(updated) = parent_new {
                    let pid = updated.id();
                    drop(self.cache().replace(pid, updated));
                }
                debug!(%id, "tombstone resurrected");
                Ok(id)
            }
            Err(err) => Err(err),
        }
    }
}
