//! Candidate ordering for sorted searches and VLV-style consumers.
//!
//! Takes a candidate IDL and produces the IDs ordered by attribute
//! values. Entries without the sort attribute order after those with it;
//! ties fall through to the next key and finally to ID order, which keeps
//! the result stable. The scan honors the operation's abandon flag and
//! stop time like any other long-running walk.

use std::cmp::Ordering;

use crate::entry::value_normalize;
use crate::error::{Error, Result};
use crate::id::EntryId;
use crate::idl::IdList;
use crate::instance::Instance;
use crate::store::Txn;
use crate::txn::OpContext;

/// One sort component.
#[derive(Debug, Clone)]
pub struct SortKey {
    /// Attribute whose first value orders the entries.
    pub attr: String,
    /// Descending when set.
    pub reverse: bool,
}

impl SortKey {
    /// An ascending sort on `attr`.
    #[must_use]
    pub fn asc(attr: &str) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            reverse: false,
        }
    }

    /// A descending sort on `attr`.
    #[must_use]
    pub fn desc(attr: &str) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            reverse: true,
        }
    }
}

impl Instance {
    /// Orders `candidates` by the given keys, returning the sorted IDs.
    ///
    /// # Errors
    ///
    /// [`Error::UnwillingToPerform`] for an AllIds candidate list (the
    /// caller narrows first), [`Error::ProtocolError`] for an empty key
    /// list, plus the context limits.
    pub fn sort_candidates(
        &self,
        txn: &Txn,
        ctx: &OpContext,
        candidates: &IdList,
        sort_keys: &[SortKey],
    ) -> Result<Vec<EntryId>> {
        if sort_keys.is_empty() {
            return Err(Error::ProtocolError("sort with no keys".into()));
        }
        if candidates.is_allids() {
            return Err(Error::UnwillingToPerform(
                "refusing to sort an AllIds candidate list".into(),
            ));
        }

        let mut rows: Vec<(EntryId, Vec<Option<Vec<u8>>>)> = Vec::new();
        for (iteration, id) in candidates.iter().enumerate() {
            ctx.check_limits(iteration)?;
            let entry = match self.id2entry(txn, id) {
                Ok(entry) => entry,
                Err(Error::NoSuchObject(_)) => continue,
                Err(err) => return Err(err),
            };
            let key_values = sort_keys
                .iter()
                .map(|key| {
                    entry
                        .values_of_base(&key.attr)
                        .iter()
                        .map(|v| value_normalize(v))
                        .min()
                })
                .collect();
            rows.push((id, key_values));
        }

        rows.sort_by(|(a_id, a_keys), (b_id, b_keys)| {
            for (at, key) in sort_keys.iter().enumerate() {
                let ordering = match (&a_keys[at], &b_keys[at]) {
                    // Absent values order after present ones.
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Greater,
                    (Some(_), None) => Ordering::Less,
                    (Some(a), Some(b)) => {
                        if key.reverse {
                            b.cmp(a)
                        } else {
                            a.cmp(b)
                        }
                    }
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a_id.cmp(b_id)
        });
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }
}
