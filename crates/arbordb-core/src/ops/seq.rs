//! The sequential scan: cursor access over one attribute's equality keys.
//!
//! Given a value and a direction, position on the equality portion of the
//! attribute's index (`=` keys, bounded above by the next prefix byte),
//! optionally advance one step, then stream the entries of the IDL found
//! there. Callers use this for first/next-style enumeration without a
//! filter.

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::index::attrinfo::IndexMask;
use crate::index::keys;
use crate::instance::Instance;
use crate::store::{CursorOp, StoreError};
use crate::txn::OpContext;

/// Where to position the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqType {
    /// The smallest key at or after the value (or the first key).
    First,
    /// The smallest key strictly after the value.
    Next,
    /// The greatest key strictly before the value.
    Prev,
    /// The largest equality key; the value is ignored.
    Last,
}

impl Instance {
    /// Runs a sequential scan over `attr`, streaming each entry of the
    /// selected key's IDL through `callback`. Returns how many entries
    /// were delivered.
    ///
    /// # Errors
    ///
    /// [`Error::UnwillingToPerform`] when the attribute has no equality
    /// index; store failures and context limits propagate.
    pub fn seq(
        &self,
        ctx: &OpContext,
        attr: &str,
        seq_type: SeqType,
        value: Option<&[u8]>,
        mut callback: impl FnMut(&Entry) -> Result<()>,
    ) -> Result<usize> {
        let ai = self
            .attrinfo()
            .get(attr)
            .filter(|ai| ai.mask().contains(IndexMask::EQUALITY))
            .ok_or_else(|| {
                Error::UnwillingToPerform(format!("unindexed seq access to {attr}"))
            })?;

        let db = self.index_db(ai.attr())?;
        let txn = self.store().begin(None).map_err(Error::from)?;
        let mut cursor = txn.cursor(db).map_err(Error::from)?;
        // One past the '=' prefix bounds the equality key space.
        let sentinel = vec![keys::EQ_PREFIX + 1];

        let start = value.map(|v| keys::eq_key(&crate::entry::value_normalize(v)));
        let position = match seq_type {
            SeqType::First => {
                let from = start.clone().unwrap_or_else(|| vec![keys::EQ_PREFIX]);
                cursor.seek(CursorOp::SetRange, Some(&from))
            }
            SeqType::Next => {
                let from = start
                    .clone()
                    .ok_or_else(|| Error::ProtocolError("seq NEXT without a value".into()))?;
                match cursor.seek(CursorOp::SetRange, Some(&from)) {
                    Ok((found, _)) if found == from => cursor.seek(CursorOp::NextNoDup, None),
                    other => other,
                }
            }
            SeqType::Prev => {
                let from = start
                    .ok_or_else(|| Error::ProtocolError("seq PREV without a value".into()))?;
                match cursor.seek(CursorOp::SetRange, Some(&from)) {
                    Ok(_) => cursor.seek(CursorOp::Prev, None),
                    Err(StoreError::NotFound) => cursor.seek(CursorOp::Last, None),
                    Err(err) => Err(err),
                }
            }
            SeqType::Last => match cursor.seek(CursorOp::SetRange, Some(&sentinel)) {
                Ok(_) => cursor.seek(CursorOp::Prev, None),
                Err(StoreError::NotFound) => cursor.seek(CursorOp::Last, None),
                Err(err) => Err(err),
            },
        };

        let key = match position {
            Ok((key, _)) => key,
            Err(StoreError::NotFound) => {
                txn.abort();
                return Ok(0);
            }
            Err(err) => {
                txn.abort();
                return Err(err.into());
            }
        };
        if key.first() != Some(&keys::EQ_PREFIX) || key >= sentinel {
            txn.abort();
            return Ok(0);
        }

        let idl = self
            .config()
            .idl_switch
            .fetch(&txn, db, &key, self.next_id_value())?
            .unwrap_or_else(|| crate::idl::IdList::alloc(0));

        let mut returned = 0usize;
        for (iteration, id) in idl.iter().enumerate() {
            ctx.check_limits(iteration)?;
            let entry = match self.id2entry(&txn, id) {
                Ok(entry) => entry,
                Err(Error::NoSuchObject(_)) => continue,
                Err(err) => {
                    txn.abort();
                    return Err(err);
                }
            };
            if entry.is_tombstone() || entry.is_ruv() {
                continue;
            }
            callback(&entry)?;
            returned += 1;
        }
        txn.abort();
        Ok(returned)
    }
}
