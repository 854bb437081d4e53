//! The modrdn operation: rename, and optionally move, an entry.
//!
//! The easy half is the entry itself: new DN, RDN attribute values added
//! (and the old ones removed when `deleteoldrdn`), `entrydn`/`parentid`
//! bookkeeping refreshed, indexes updated from the difference.
//!
//! The hard half is the subtree. The moved entry's descendants keep their
//! IDs but their DNs all change: in subtree-rename mode one pointer
//! update on the DN tree covers them; in flat mode every descendant's
//! stored DN and `entrydn` key is rewritten. Either way `ancestorid` is
//! repaired by removing the moved set from the ancestors exclusive to the
//! old chain and adding it along the new one, and both parents' counts
//! move when the superior changed.

use tracing::debug;

use crate::entry::{opattr, Dn, Entry};
use crate::error::{Error, Result};
use crate::id::EntryId;
use crate::idl::IdList;
use crate::index::IndexOp;
use crate::instance::Instance;
use crate::parents::{parent_update_on_childchange, ChildChange};
use crate::plugin::{HookPoint, OpInfo, OpKind};
use crate::txn::OpContext;

impl Instance {
    /// Renames the entry at `dn` to `newrdn`, moving it under
    /// `new_superior` when given.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] for an unknown source or superior,
    /// [`Error::AlreadyExists`] for an occupied target DN,
    /// [`Error::InvalidDnSyntax`] for a malformed new RDN,
    /// [`Error::Busy`] on retry exhaustion, plus store failures.
    pub fn modrdn(
        &self,
        ctx: &OpContext,
        dn: &Dn,
        newrdn: &str,
        deleteoldrdn: bool,
        new_superior: Option<&Dn>,
    ) -> Result<()> {
        self.check_writable()?;

        let entry = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            let found = self.dn2entry(&probe, dn)?;
            probe.abort();
            found.ok_or_else(|| Error::NoSuchObject(dn.to_string()))?
        };
        let id = entry.id();

        // Normalize and validate the new RDN by parsing it as a DN.
        let newrdn_dn = Dn::parse(newrdn)?;
        let newrdn_norm = newrdn_dn
            .rdn()
            .ok_or_else(|| Error::InvalidDnSyntax(newrdn.to_string()))?
            .to_string();

        let old_parent_dn = dn.parent();
        let target_parent_dn = match new_superior {
            Some(superior) => Some(superior.clone()),
            None => old_parent_dn.clone(),
        };
        let new_dn = match &target_parent_dn {
            Some(parent) => parent.child(&newrdn_norm),
            None => Dn::parse(&newrdn_norm)?,
        };
        if new_dn == *dn {
            return Ok(());
        }

        {
            let info = OpInfo {
                kind: OpKind::Modrdn,
                dn,
                entry: Some(&entry),
            };
            if self.plugins().run(HookPoint::PreOp, &info)? {
                return Ok(());
            }
        }

        // Resolve both parents and check the target slot.
        let (old_parent, new_parent) = {
            let probe = self.store().begin(None).map_err(Error::from)?;
            if self.dn2entry(&probe, &new_dn)?.is_some() {
                probe.abort();
                return Err(Error::AlreadyExists(new_dn.to_string()));
            }
            let old_parent = match &old_parent_dn {
                Some(pdn) => self.dn2entry(&probe, pdn)?,
                None => None,
            };
            let new_parent = match &target_parent_dn {
                Some(pdn) => {
                    let found = self.dn2entry(&probe, pdn)?;
                    if found.is_none() && new_superior.is_some() {
                        probe.abort();
                        return Err(Error::NoSuchObject(pdn.to_string()));
                    }
                    found
                }
                None => None,
            };
            probe.abort();
            (old_parent, new_parent)
        };
        let old_parent_id = old_parent.as_ref().map(Entry::id);
        let new_parent_id = new_parent.as_ref().map(Entry::id);
        let parent_changed = old_parent_id != new_parent_id;

        // Lock the entry and both parents in ascending ID order.
        let mut lock_ids: Vec<EntryId> = [Some(id), old_parent_id, new_parent_id]
            .into_iter()
            .flatten()
            .collect();
        lock_ids.sort_unstable();
        lock_ids.dedup();
        let locks: Vec<_> = lock_ids
            .iter()
            .map(|&lid| self.cache().entry_lock(lid))
            .collect();
        let _guards: Vec<_> = locks.iter().map(|l| l.lock()).collect();

        // Build the post image: new DN, RDN attribute values updated.
        let mut new_entry = entry.clone();
        new_entry.set_dn(new_dn.clone());
        let old_avas = dn.rdn_avas();
        let new_avas = new_dn.rdn_avas();
        let mut touched: Vec<String> = vec![
            opattr::ENTRYDN.to_string(),
            opattr::PARENTID.to_string(),
        ];
        if deleteoldrdn {
            for (attr, value) in &old_avas {
                let kept = new_avas
                    .iter()
                    .any(|(a, v)| a == attr && v.eq_ignore_ascii_case(value));
                if !kept && new_entry.has_value(attr, value) {
                    new_entry.delete_values(attr, &[value.clone()])?;
                    touched.push(attr.clone());
                }
            }
        }
        for (attr, value) in &new_avas {
            if !new_entry.has_value(attr, value) {
                new_entry.add_values(attr, std::slice::from_ref(value))?;
                touched.push(attr.clone());
            }
        }
        new_entry.set_bookkeeping(id, new_parent_id);

        let saved_old = entry;
        let saved_new = new_entry;
        let saved_old_parent = old_parent;
        let saved_new_parent = new_parent;
        let result = self.run_write(|txn| {
            let info = OpInfo {
                kind: OpKind::Modrdn,
                dn,
                entry: Some(&saved_new),
            };
            self.plugins().run(HookPoint::TxnPre, &info)?;

            self.entry_store(txn, &saved_new)?;
            self.index_entry_delta(txn, &saved_old, &saved_new, &touched)?;

            // The descendant set, as it stands inside this transaction.
            let subtree = self.ancestorid_read(txn, id)?;
            self.ancestorid_move_subtree(txn, dn, &new_dn, id, Some(&subtree))?;

            let mut moved_descendants: Vec<EntryId> = Vec::new();
            if self.config().subtree_rename {
                self.dn_link_move(
                    txn,
                    id,
                    new_parent_id,
                    saved_new.dn().rdn().unwrap_or(&newrdn_norm),
                )?;
                // Iterate the IDL itself: an AllIds subtree synthesizes
                // the full live ID range, so every possibly-cached
                // descendant still gets its stale DN evicted below.
                moved_descendants.extend(&subtree);
            } else {
                moved_descendants.extend(self.rewrite_descendant_dns(
                    txn,
                    &subtree,
                    dn,
                    &new_dn,
                )?);
            }

            let parents_new = if parent_changed {
                let mut out = Vec::new();
                if let Some(parent) = &saved_old_parent {
                    let mut updated = parent.clone();
                    parent_update_on_childchange(&mut updated, ChildChange::Removed)?;
                    self.entry_store(txn, &updated)?;
                    out.push(updated);
                }
                if let Some(parent) = &saved_new_parent {
                    let mut updated = parent.clone();
                    parent_update_on_childchange(&mut updated, ChildChange::Added)?;
                    self.entry_store(txn, &updated)?;
                    out.push(updated);
                }
                out
            } else {
                Vec::new()
            };

            self.ruv_piggyback(txn, ctx.csn())?;
            self.plugins().run(HookPoint::TxnPost, &info)?;
            Ok((parents_new, moved_descendants))
        });

        match result {
            Ok((parents_new, moved_descendants)) => {
                drop(self.cache().replace(id, saved_new.clone()));
                for updated in parents_new {
                    let pid = updated.id();
                    drop(self.cache().replace(pid, updated));
                }
                // Cached descendants carry stale DNs now; drop them and
                // let reads refill.
                for desc in moved_descendants {
                    self.cache().remove(desc);
                }
                let info = OpInfo {
                    kind: OpKind::Modrdn,
                    dn: saved_new.dn(),
                    entry: Some(&saved_new),
                };
                let _ = self.plugins().run(HookPoint::PostOp, &info);
                debug!(%id, from = %dn, to = %new_dn, "entry renamed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Flat-mode descendant rewrite: every entry under the moved apex gets
    /// its stored DN rebased and its `entrydn` key reindexed.
    fn rewrite_descendant_dns(
        &self,
        txn: &crate::store::Txn,
        subtree: &IdList,
        old_base: &Dn,
        new_base: &Dn,
    ) -> Result<Vec<EntryId>> {
        let mut moved = Vec::new();
        for desc in subtree {
            let mut child = match self.entry_fetch(txn, desc) {
                Ok(child) => child,
                // AllIds subtrees iterate over ID-space holes.
                Err(Error::NoSuchObject(_)) => continue,
                Err(err) => return Err(err),
            };
            let Some(rebased) = child.dn().rebase(old_base, new_base) else {
                continue;
            };
            let before = child.clone();
            child.set_dn(rebased.clone());
            child.set_single_str(opattr::ENTRYDN, rebased.as_str());
            self.entry_store(txn, &child)?;
            self.index_entry_delta(txn, &before, &child, &[opattr::ENTRYDN.to_string()])?;
            moved.push(desc);
        }
        Ok(moved)
    }
}
