//! The operation API: what the front-end calls.
//!
//! One submodule per mutation (`add`, `modify`, `delete`, `modrdn`), the
//! search entry points here, the sequential scan in [`seq`], and the
//! administrative operations (`import`, `export`, `backup`, `restore`,
//! `rebuild-index`, `upgrade`, `bind`, `compare`, `abandon`, `unbind`) in
//! [`admin`].
//!
//! All four mutations share the same envelope: fence checks, the optional
//! serializing writer lock, per-entry cache locks, pre-computed "original"
//! copies of every input, the deadlock retry loop, and cache switching
//! only after commit.

pub mod add;
pub mod admin;
pub mod delete;
pub mod modify;
pub mod modrdn;
pub mod seq;

#[cfg(test)]
mod tests;

use tracing::debug;

use crate::entry::{opattr, Csn, Dn, Entry, Mod, ModOp};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::id::EntryId;
use crate::idl::{IdList, IdListSet};
use crate::instance::{Instance, RUV_UNIQUEID};
use crate::store::Txn;
use crate::txn::{with_retry, OpContext};

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The base entry only.
    Base,
    /// Direct children of the base.
    One,
    /// The base and all of its descendants.
    Subtree,
}

impl Instance {
    /// Runs a write operation under the standard envelope: writability
    /// check, optional serialized-writer lock, deadlock retry, fatal-error
    /// latching.
    pub(crate) fn run_write<T>(&self, body: impl FnMut(&Txn) -> Result<T>) -> Result<T> {
        self.check_writable()?;
        let _serial = self.serial_guard();
        let out = with_retry(self.store(), None, body);
        if let Err(err) = &out {
            self.note_fatal(err);
        }
        out
    }

    /// Resolves a DN to its entry: cache first, then the store. Tombstone
    /// DNs (`nsuniqueid=...`) resolve through the unique-ID index, since
    /// tombstones keep only their minimal index set.
    ///
    /// # Errors
    ///
    /// Store failures propagate; a missing entry is `None`.
    pub fn dn2entry(&self, txn: &Txn, dn: &Dn) -> Result<Option<Entry>> {
        if let Some(found) = self.cache().find_by_dn(dn) {
            return Ok(Some((*found).clone()));
        }
        if let Some(rdn) = dn.rdn() {
            if let Some(uid) = rdn.strip_prefix("nsuniqueid=") {
                return self.uniqueid2entry(txn, uid);
            }
        }
        match self.dn2id(txn, dn)? {
            Some(id) => Ok(Some(self.fetch_entry_with_dn(txn, id)?)),
            None => Ok(None),
        }
    }

    /// Resolves a unique ID to its entry through the `nsuniqueid` index.
    ///
    /// # Errors
    ///
    /// Store failures propagate; a missing entry is `None`.
    pub fn uniqueid2entry(&self, txn: &Txn, unique_id: &str) -> Result<Option<Entry>> {
        if let Some(found) = self.cache().find_by_uuid(unique_id) {
            return Ok(Some((*found).clone()));
        }
        let ctx = OpContext::new();
        let idl = self.index_read(
            txn,
            &ctx,
            opattr::NSUNIQUEID,
            crate::index::IndexKind::Equality,
            unique_id.as_bytes(),
        )?;
        match idl.first_id() {
            Some(id) if !idl.is_allids() => Ok(Some(self.fetch_entry_with_dn(txn, id)?)),
            _ => Ok(None),
        }
    }

    /// Fetches an entry by ID: cache first, then the store (filling the
    /// cache on miss).
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] when the row does not exist.
    pub fn id2entry(&self, txn: &Txn, id: EntryId) -> Result<Entry> {
        if let Some(found) = self.cache().find_by_id(id) {
            return Ok((*found).clone());
        }
        let entry = self.fetch_entry_with_dn(txn, id)?;
        // The RUV entry changes inside every CSN-carrying transaction;
        // caching it would serve stale replication state.
        if !entry.is_ruv() {
            drop(self.cache().add(entry.clone()));
        }
        Ok(entry)
    }

    /// Piggybacks the operation CSN onto the replication update vector
    /// entry inside the write transaction. A no-op without a CSN or
    /// without a RUV entry.
    ///
    /// The RUV entry is deliberately never cached: this runs inside the
    /// transaction body, where a cache update would leak uncommitted
    /// state on abort.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub(crate) fn ruv_piggyback(&self, txn: &Txn, csn: Option<&Csn>) -> Result<()> {
        let Some(csn) = csn else {
            return Ok(());
        };
        let Some(mut ruv) = self.ruv_entry(txn)? else {
            return Ok(());
        };
        let current = ruv
            .first_value_str("nsruvelement")
            .map(str::to_string);
        if current.as_deref() < Some(csn.0.as_str()) {
            ruv.apply_mods(
                &[Mod::new(
                    ModOp::Replace,
                    "nsruvelement",
                    vec![csn.0.clone().into_bytes()],
                )],
                Some(csn),
            )?;
            self.entry_store(txn, &ruv)?;
        }
        Ok(())
    }

    /// Reads the replication update vector entry straight from the store.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn ruv_entry(&self, txn: &Txn) -> Result<Option<Entry>> {
        let ctx = OpContext::new();
        let idl = self.index_read(
            txn,
            &ctx,
            opattr::NSUNIQUEID,
            crate::index::IndexKind::Equality,
            RUV_UNIQUEID.as_bytes(),
        )?;
        match idl.first_id() {
            Some(id) if !idl.is_allids() => Ok(Some(self.entry_fetch(txn, id)?)),
            _ => Ok(None),
        }
    }

    /// Creates the replication update vector entry for this instance if
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn ensure_ruv_entry(&self) -> Result<EntryId> {
        let probe = self.store().begin(None).map_err(Error::from)?;
        if let Some(ruv) = self.ruv_entry(&probe)? {
            probe.abort();
            return Ok(ruv.id());
        }
        probe.abort();

        let id = self.next_id().next()?;
        let suffix = Dn::parse(&self.config().suffix)?;
        let dn = suffix.child(&format!("nsuniqueid={RUV_UNIQUEID}"));
        let mut ruv = Entry::new(dn);
        ruv.set_unique_id(RUV_UNIQUEID.to_string());
        ruv.set_ruv(true);
        ruv.set_bookkeeping(id, None);
        self.run_write(|txn| {
            self.entry_store(txn, &ruv)?;
            self.index_addordel_entry(txn, &ruv, crate::index::IndexOp::Add)?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Computes the candidate IDL for a search: the scope set intersected
    /// with the filter's candidates. The boolean is the filter-test
    /// verdict (`true` = candidates are a superset, verify each one).
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchObject`] for an unknown base; store failures and
    /// limits propagate.
    pub fn search_candidates(
        &self,
        txn: &Txn,
        ctx: &OpContext,
        base: &Dn,
        scope: Scope,
        filter: &Filter,
    ) -> Result<IdList> {
        let base_id = self
            .dn2id(txn, base)?
            .ok_or_else(|| Error::NoSuchObject(base.to_string()))?;

        let scope_idl = match scope {
            Scope::Base => IdList::from_ids(vec![base_id]),
            Scope::One => self.parentid_read(txn, base_id)?,
            Scope::Subtree => {
                let descendants = self.ancestorid_read(txn, base_id)?;
                IdList::union(&descendants, &IdList::from_ids(vec![base_id]))
            }
        };

        let filter_idl = self.filter_candidates(txn, ctx, filter)?;
        let mut set = IdListSet::new();
        set.insert(scope_idl);
        set.insert(filter_idl);
        let (candidates, dont_bypass) = set.intersect(self.next_id_value());
        if dont_bypass {
            ctx.set_dont_bypass_filter_test();
        }
        debug!(
            base = %base,
            candidates = candidates.length(),
            filter_test = ctx.dont_bypass_filter_test(),
            "search candidates computed"
        );
        Ok(candidates)
    }

    /// Runs a search, streaming matching entries through `callback`.
    ///
    /// Candidates are verified against the filter whenever the candidate
    /// IDL is a superset; tombstones and the RUV entry are skipped unless
    /// the filter asks for tombstones explicitly. The lookthrough limit,
    /// abandonment and the stop time bound the scan.
    ///
    /// # Errors
    ///
    /// Limit and store failures propagate; callback errors abort the
    /// scan.
    pub fn search(
        &self,
        ctx: &OpContext,
        base: &Dn,
        scope: Scope,
        filter: &Filter,
        mut callback: impl FnMut(&Entry) -> Result<()>,
    ) -> Result<usize> {
        let txn = self.store().begin(None).map_err(Error::from)?;
        let out = self.search_inner(&txn, ctx, base, scope, filter, &mut callback);
        txn.abort();
        out
    }

    fn search_inner(
        &self,
        txn: &Txn,
        ctx: &OpContext,
        base: &Dn,
        scope: Scope,
        filter: &Filter,
        callback: &mut impl FnMut(&Entry) -> Result<()>,
    ) -> Result<usize> {
        let candidates = self.search_candidates(txn, ctx, base, scope, filter)?;
        let must_test = ctx.dont_bypass_filter_test() || candidates.is_allids();
        let wants_tombstones = filter_wants_tombstones(filter);
        let lookthrough = self.config().lookthroughlimit;

        let mut looked = 0usize;
        let mut returned = 0usize;
        for id in &candidates {
            looked += 1;
            ctx.check_limits(looked)?;
            if lookthrough > 0 && looked > lookthrough {
                return Err(Error::AdminLimitExceeded);
            }
            let entry = match self.id2entry(txn, id) {
                Ok(entry) => entry,
                // AllIds iterates over holes in the ID space.
                Err(Error::NoSuchObject(_)) => continue,
                Err(err) => return Err(err),
            };
            if entry.is_ruv() {
                continue;
            }
            if entry.is_tombstone() && !wants_tombstones {
                continue;
            }
            if must_test && !filter.matches(&entry) {
                continue;
            }
            callback(&entry)?;
            returned += 1;
        }
        Ok(returned)
    }
}

fn filter_wants_tombstones(filter: &Filter) -> bool {
    match filter {
        Filter::And(subs) | Filter::Or(subs) => subs.iter().any(filter_wants_tombstones),
        Filter::Not(sub) => filter_wants_tombstones(sub),
        Filter::Equality { attr, value } => {
            attr == opattr::OBJECTCLASS
                && value.eq_ignore_ascii_case(opattr::OC_TOMBSTONE.as_bytes())
        }
        _ => false,
    }
}
