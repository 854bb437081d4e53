//! The attribute index layer.
//!
//! Maps attribute values to IDLs under prefixed keys (see [`keys`]),
//! dispatching storage through the active IDL encoding. Reads degrade
//! gracefully: an untracked or OFFLINE attribute produces AllIds and
//! raises the unindexed signal so the search layer re-checks candidates.
//!
//! Writers come in three granularities, all transactional:
//!
//! - [`Instance::index_addordel_values`]: one attribute, explicit kinds.
//! - [`Instance::index_addordel_entry`]: every attribute of an entry
//!   (tombstones and the RUV entry get their minimal special set).
//! - [`Instance::index_entry_delta`]: the modify path. Diffs the pre- and
//!   post-image per touched base type, so a value that survives under a
//!   different subtype keeps its equality key, and presence comes and goes
//!   only when the whole base type does.

pub mod attrinfo;
pub mod buffer;
pub mod keys;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::debug;

use crate::entry::{opattr, value_eq, value_normalize, Entry};
use crate::error::{Error, Result};
use crate::id::EntryId;
use crate::idl::old::DeleteOutcome;
use crate::idl::IdList;
use crate::instance::Instance;
use crate::store::{CursorOp, StoreError, Txn};
use crate::txn::OpContext;
use attrinfo::{AttrInfo, IndexMask};

/// Whether an index write adds or removes the ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    /// Insert the ID under the derived keys.
    Add,
    /// Remove the ID from the derived keys.
    Del,
}

/// Which single index a read consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind<'a> {
    /// Presence (`+`).
    Presence,
    /// Equality (`=`).
    Equality,
    /// Approximate (`~`).
    Approx,
    /// One substring gram (`*`).
    Substring,
    /// A matching-rule index (`:<oid>:`).
    Rules(&'a str),
}

impl IndexKind<'_> {
    fn mask(&self) -> IndexMask {
        match self {
            Self::Presence => IndexMask::PRESENCE,
            Self::Equality => IndexMask::EQUALITY,
            Self::Approx => IndexMask::APPROX,
            Self::Substring => IndexMask::SUBSTRING,
            Self::Rules(_) => IndexMask::RULES,
        }
    }
}

impl Instance {
    /// Derives the keys one value produces for the given kinds.
    ///
    /// Equality keys of encrypted attributes pass the value through the
    /// provider (deterministically) unless `dont_encrypt`; substring and
    /// approximate indexes are never maintained for encrypted attributes.
    fn keys_for_value(
        &self,
        ai: &Arc<AttrInfo>,
        kinds: IndexMask,
        value: &[u8],
        dont_encrypt: bool,
    ) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let crypt = ai.crypt();
        let encrypted = ai.wants_crypt();

        if kinds.contains(IndexMask::EQUALITY) {
            let norm = value_normalize(value);
            let material = if encrypted && !dont_encrypt {
                let provider = crypt.as_ref().ok_or_else(|| {
                    Error::Crypt(format!("no encryption provider installed for {}", ai.attr()))
                })?;
                provider.encrypt_index_key(&norm)?
            } else {
                norm
            };
            out.push(keys::eq_key(&material));
        }
        if kinds.contains(IndexMask::APPROX) && !encrypted {
            out.push(keys::approx_key(value));
        }
        if kinds.contains(IndexMask::SUBSTRING) && !encrypted {
            out.extend(keys::substring_keys(value));
        }
        if kinds.contains(IndexMask::RULES) {
            for oid in ai.matching_rules() {
                for derived in self.plugins().rule_keys(oid, value) {
                    out.push(keys::rules_key(oid, &derived));
                }
            }
        }
        Ok(out)
    }

    /// Reads one index key's IDL.
    ///
    /// An untracked, OFFLINE or kind-disabled attribute returns AllIds and
    /// raises the filter-test signal on `ctx`. A missing key is the empty
    /// list. Lists longer than `idlistscanlimit` collapse to AllIds.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn index_read(
        &self,
        txn: &Txn,
        ctx: &OpContext,
        attr: &str,
        kind: IndexKind<'_>,
        value: &[u8],
    ) -> Result<IdList> {
        let next_id = self.next_id_value();
        let Some(ai) = self.attrinfo().get(attr) else {
            ctx.set_dont_bypass_filter_test();
            return Ok(IdList::allids(next_id));
        };
        if ai.is_offline() || !ai.mask().contains(kind.mask()) {
            ctx.set_dont_bypass_filter_test();
            return Ok(IdList::allids(next_id));
        }

        let derived: Vec<Vec<u8>> = match kind {
            IndexKind::Presence => vec![keys::presence_key()],
            IndexKind::Equality => {
                let norm = value_normalize(value);
                let material = if ai.wants_crypt() {
                    let provider = ai.crypt().ok_or_else(|| {
                        Error::Crypt(format!(
                            "no encryption provider installed for {}",
                            ai.attr()
                        ))
                    })?;
                    provider.encrypt_index_key(&norm)?
                } else {
                    norm
                };
                vec![keys::eq_key(&material)]
            }
            IndexKind::Approx => vec![keys::approx_key(value)],
            // The caller hands one already-derived gram.
            IndexKind::Substring => vec![keys::sub_key(value)],
            IndexKind::Rules(oid) => {
                let derived: Vec<Vec<u8>> = self
                    .plugins()
                    .rule_keys(oid, value)
                    .into_iter()
                    .map(|d| keys::rules_key(oid, &d))
                    .collect();
                if derived.is_empty() {
                    // No indexer for this rule: unindexed.
                    ctx.set_dont_bypass_filter_test();
                    return Ok(IdList::allids(next_id));
                }
                derived
            }
        };

        let db = self.index_db(ai.attr())?;
        let mut idl = IdList::alloc(0);
        for key in &derived {
            if let Some(found) = self.config().idl_switch.fetch(txn, db, key, next_id)? {
                idl = IdList::union(&idl, &found);
            }
        }

        let scanlimit = self.config().idlistscanlimit;
        if scanlimit > 0 && !idl.is_allids() && idl.length() > scanlimit {
            debug!(attr, "IDL over scan limit, using AllIds");
            ctx.set_dont_bypass_filter_test();
            return Ok(IdList::allids(next_id));
        }
        Ok(idl)
    }

    /// Range read over the equality key space: unions the IDLs of every
    /// key in `[lower, upper]` (bounds optional and inclusive per flag).
    /// Honors the lookthrough limit and the operation's abandon/stop-time
    /// sampling.
    ///
    /// # Errors
    ///
    /// [`Error::AdminLimitExceeded`] past the lookthrough limit, plus the
    /// limits surfaced by [`OpContext::check_limits`].
    #[allow(clippy::too_many_arguments)]
    pub fn index_range_read(
        &self,
        txn: &Txn,
        ctx: &OpContext,
        attr: &str,
        lower: Option<&[u8]>,
        lower_inclusive: bool,
        upper: Option<&[u8]>,
        upper_inclusive: bool,
    ) -> Result<IdList> {
        let next_id = self.next_id_value();
        let Some(ai) = self.attrinfo().get(attr) else {
            ctx.set_dont_bypass_filter_test();
            return Ok(IdList::allids(next_id));
        };
        if ai.is_offline() || !ai.mask().contains(IndexMask::EQUALITY) {
            ctx.set_dont_bypass_filter_test();
            return Ok(IdList::allids(next_id));
        }

        let db = self.index_db(ai.attr())?;
        let start = lower.map_or_else(
            || vec![keys::EQ_PREFIX],
            |v| keys::eq_key(&value_normalize(v)),
        );
        // One past the '=' prefix bounds the scan when no upper is given.
        let sentinel = vec![keys::EQ_PREFIX + 1];
        let upper_key = upper.map(|v| keys::eq_key(&value_normalize(v)));

        let mut cursor = txn.cursor(db).map_err(Error::from)?;
        let mut position = cursor.seek(CursorOp::SetRange, Some(&start));
        let mut result = IdList::alloc(0);
        let mut looked = 0usize;
        let lookthrough = self.config().lookthroughlimit;

        loop {
            let (key, _) = match position {
                Ok(pair) => pair,
                Err(StoreError::NotFound) => break,
                Err(err) => return Err(err.into()),
            };
            if key.first() != Some(&keys::EQ_PREFIX) || key >= sentinel {
                break;
            }
            let in_lower = match (lower, lower_inclusive) {
                (Some(_), false) => key != start,
                _ => true,
            };
            if let Some(upper_key) = &upper_key {
                match key.cmp(upper_key) {
                    std::cmp::Ordering::Greater => break,
                    std::cmp::Ordering::Equal if !upper_inclusive => break,
                    _ => {}
                }
            }

            if in_lower {
                looked += 1;
                ctx.check_limits(looked)?;
                if lookthrough > 0 && looked > lookthrough {
                    return Err(Error::AdminLimitExceeded);
                }
                if let Some(idl) =
                    self.config().idl_switch.fetch(txn, db, &key, next_id)?
                {
                    result = IdList::union(&result, &idl);
                    if result.is_allids() {
                        ctx.set_dont_bypass_filter_test();
                        return Ok(result);
                    }
                }
                let scanlimit = self.config().idlistscanlimit;
                if scanlimit > 0 && result.length() > scanlimit {
                    ctx.set_dont_bypass_filter_test();
                    return Ok(IdList::allids(next_id));
                }
            }
            position = cursor.seek(CursorOp::NextNoDup, None);
        }
        Ok(result)
    }

    /// Adds or removes `id` under the keys the given values derive, for
    /// the kinds enabled on the attribute intersected with `kinds`.
    ///
    /// Untracked and OFFLINE attributes are a no-op (the attribute acts
    /// unindexed). Deletes of absent IDs are consumed silently; the
    /// callers are idempotent.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn index_addordel_values(
        &self,
        txn: &Txn,
        attr: &str,
        values: &[&[u8]],
        id: EntryId,
        op: IndexOp,
        kinds: IndexMask,
        dont_encrypt: bool,
    ) -> Result<()> {
        let Some(ai) = self.attrinfo().get(attr) else {
            return Ok(());
        };
        if ai.is_offline() {
            return Ok(());
        }
        let effective = ai.mask().intersect(kinds);
        if effective.is_none() {
            return Ok(());
        }

        let db = self.index_db(ai.attr())?;
        let tuning = *ai.tuning();
        let next_id = self.next_id_value();
        let encoding = self.config().idl_switch;

        let mut all_keys = Vec::new();
        if effective.contains(IndexMask::PRESENCE) {
            all_keys.push(keys::presence_key());
        }
        let value_kinds = effective.intersect(
            IndexMask::EQUALITY
                .with(IndexMask::APPROX)
                .with(IndexMask::SUBSTRING)
                .with(IndexMask::RULES),
        );
        if !value_kinds.is_none() {
            for value in values {
                all_keys.extend(self.keys_for_value(&ai, value_kinds, value, dont_encrypt)?);
            }
        }

        for key in all_keys {
            match op {
                IndexOp::Add => {
                    encoding.insert_key(txn, db, &key, id, &tuning, next_id)?;
                }
                IndexOp::Del => {
                    if encoding.delete_key(txn, db, &key, id)? == DeleteOutcome::Absent {
                        debug!(
                            attr,
                            key = %keys::render_key(&key),
                            %id,
                            "delete of absent id ignored"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Indexes (or unindexes) every attribute of `entry`.
    ///
    /// Tombstones write only their minimal triple (`objectclass` =
    /// tombstone, `nsuniqueid`, `nscpentrydn`); the RUV entry only its
    /// `nsuniqueid`. The caller owns the companion hierarchy updates.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn index_addordel_entry(&self, txn: &Txn, entry: &Entry, op: IndexOp) -> Result<()> {
        let id = entry.id();
        if entry.is_ruv() {
            return self.index_addordel_values(
                txn,
                opattr::NSUNIQUEID,
                &[entry.unique_id().as_bytes()],
                id,
                op,
                IndexMask::EQUALITY,
                false,
            );
        }
        if entry.is_tombstone() {
            self.index_addordel_values(
                txn,
                opattr::OBJECTCLASS,
                &[opattr::OC_TOMBSTONE.as_bytes()],
                id,
                op,
                IndexMask::EQUALITY,
                false,
            )?;
            self.index_addordel_values(
                txn,
                opattr::NSUNIQUEID,
                &[entry.unique_id().as_bytes()],
                id,
                op,
                IndexMask::EQUALITY,
                false,
            )?;
            if let Some(dn) = entry.first_value(opattr::NSCPENTRYDN) {
                self.index_addordel_values(
                    txn,
                    opattr::NSCPENTRYDN,
                    &[dn],
                    id,
                    op,
                    IndexMask::EQUALITY,
                    false,
                )?;
            }
            return Ok(());
        }

        let all_kinds = IndexMask::PRESENCE
            .with(IndexMask::EQUALITY)
            .with(IndexMask::APPROX)
            .with(IndexMask::SUBSTRING)
            .with(IndexMask::RULES);
        for attr in entry.attributes() {
            let values: Vec<&[u8]> = attr.values.iter().map(Vec::as_slice).collect();
            self.index_addordel_values(
                txn,
                attr.base_type(),
                &values,
                id,
                op,
                all_kinds,
                false,
            )?;
        }
        Ok(())
    }

    /// The modify path: updates indexes from the difference between the
    /// pre- and post-image, per touched base type.
    ///
    /// A value removed from one subtype keeps its keys while it survives
    /// under another; presence is deleted only when the base type emptied,
    /// and added only when it appeared.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn index_entry_delta(
        &self,
        txn: &Txn,
        old_entry: &Entry,
        new_entry: &Entry,
        touched: &[String],
    ) -> Result<()> {
        let id = new_entry.id();
        let value_kinds = IndexMask::EQUALITY
            .with(IndexMask::APPROX)
            .with(IndexMask::SUBSTRING)
            .with(IndexMask::RULES);

        let mut bases: Vec<String> = touched
            .iter()
            .map(|t| {
                t.split(';')
                    .next()
                    .unwrap_or(t.as_str())
                    .to_ascii_lowercase()
            })
            .collect();
        bases.sort();
        bases.dedup();

        for base in &bases {
            let old_values = old_entry.values_of_base(base);
            let new_values = new_entry.values_of_base(base);

            let removed: Vec<&[u8]> = old_values
                .iter()
                .filter(|ov| !new_values.iter().any(|nv| value_eq(nv, ov)))
                .copied()
                .collect();
            let added: Vec<&[u8]> = new_values
                .iter()
                .filter(|nv| !old_values.iter().any(|ov| value_eq(ov, nv)))
                .copied()
                .collect();

            if !removed.is_empty() {
                self.index_addordel_values(
                    txn, base, &removed, id, IndexOp::Del, value_kinds, false,
                )?;
            }
            if !added.is_empty() {
                self.index_addordel_values(
                    txn, base, &added, id, IndexOp::Add, value_kinds, false,
                )?;
            }
            if !old_values.is_empty() && new_values.is_empty() {
                self.index_addordel_values(
                    txn,
                    base,
                    &[],
                    id,
                    IndexOp::Del,
                    IndexMask::PRESENCE,
                    false,
                )?;
            } else if old_values.is_empty() && !new_values.is_empty() {
                self.index_addordel_values(
                    txn,
                    base,
                    &[],
                    id,
                    IndexOp::Add,
                    IndexMask::PRESENCE,
                    false,
                )?;
            }
        }
        Ok(())
    }
}
