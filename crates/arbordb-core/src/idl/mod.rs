//! ID lists: the compressed set-of-IDs primitive under every index.
//!
//! An [`IdList`] is either a *regular* list (strictly increasing IDs with a
//! capacity) or the *AllIds* sentinel meaning "every live ID". AllIds is
//! produced whenever a set would grow past the attribute's `allidslimit` or
//! would come from an untracked attribute; it is a deliberate superset, and
//! consumers re-check candidates against the filter when they see it.
//!
//! Submodules:
//!
//! - [`old`]: the block on-disk encoding (header + `#`-keyed continuation
//!   blocks, indirect headers, AllIds blocks).
//! - [`new`]: the per-ID duplicate-record encoding.
//! - [`shim`]: dispatch between the two, selected at instance open.
//! - [`set`]: the k-way union/intersection engine the filter layer feeds.

pub mod new;
pub mod old;
pub mod set;
pub mod shim;

#[cfg(test)]
mod tests;

pub use set::{IdListSet, FILTER_TEST_THRESHOLD};
pub use shim::IdlKind;

use crate::id::{EntryId, NOID};

/// Result of [`IdList::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The ID was appended.
    Appended,
    /// The ID is already the last element (or the list is AllIds).
    AlreadyLast,
    /// The list is at capacity.
    CapacityExceeded,
}

/// Result of [`IdList::insert_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Inserted in sorted position.
    Inserted,
    /// The ID was already present.
    AlreadyPresent,
    /// The list is AllIds; nothing to do.
    AllIds,
}

/// Result of [`IdList::delete_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    /// Deleted.
    Deleted,
    /// Deleted, and the first ID of the list changed.
    DeletedFirstChanged,
    /// Deleted, and the list is now empty.
    Emptied,
    /// The ID was not in the list.
    Absent,
    /// Cannot delete from an AllIds list.
    AllIds,
}

/// A set of entry IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdList {
    /// Ordered, duplicate-free IDs with an explicit capacity.
    Regular {
        /// Capacity; [`IdList::insert_id`] grows it, [`IdList::append`]
        /// respects it.
        nmax: usize,
        /// Strictly increasing IDs.
        ids: Vec<EntryId>,
    },
    /// Sentinel for "every ID up to the backend's next ID".
    AllIds {
        /// The backend's next-ID value at creation; iteration yields
        /// `1..nids`.
        nids: u32,
    },
}

impl IdList {
    /// An empty regular list with capacity `nmax`.
    #[must_use]
    pub fn alloc(nmax: usize) -> Self {
        Self::Regular {
            nmax: nmax.max(1),
            ids: Vec::with_capacity(nmax.max(1)),
        }
    }

    /// A regular list over `ids`, which must be strictly increasing.
    #[must_use]
    pub fn from_ids(ids: Vec<EntryId>) -> Self {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        Self::Regular {
            nmax: ids.len().max(1),
            ids,
        }
    }

    /// The AllIds sentinel; `nids` is the backend's next-ID value.
    #[must_use]
    pub fn allids(nids: u32) -> Self {
        Self::AllIds { nids }
    }

    /// True for the AllIds sentinel.
    #[must_use]
    pub fn is_allids(&self) -> bool {
        matches!(self, Self::AllIds { .. })
    }

    /// True for a regular list with no IDs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Regular { ids, .. } => ids.is_empty(),
            Self::AllIds { .. } => false,
        }
    }

    /// Number of IDs; AllIds reports `u32::MAX` (it stands for every ID).
    #[must_use]
    pub fn length(&self) -> usize {
        match self {
            Self::Regular { ids, .. } => ids.len(),
            Self::AllIds { .. } => u32::MAX as usize,
        }
    }

    /// The regular IDs, or `None` for AllIds.
    #[must_use]
    pub fn ids(&self) -> Option<&[EntryId]> {
        match self {
            Self::Regular { ids, .. } => Some(ids),
            Self::AllIds { .. } => None,
        }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        if id == NOID {
            return false;
        }
        match self {
            Self::Regular { ids, .. } => ids.binary_search(&id).is_ok(),
            Self::AllIds { .. } => true,
        }
    }

    /// The first ID, or `None` for an empty list.
    #[must_use]
    pub fn first_id(&self) -> Option<EntryId> {
        match self {
            Self::Regular { ids, .. } => ids.first().copied(),
            Self::AllIds { nids } => (*nids > 1).then_some(EntryId(1)),
        }
    }

    /// The smallest ID strictly greater than `id`.
    #[must_use]
    pub fn next_id_after(&self, id: EntryId) -> Option<EntryId> {
        match self {
            Self::Regular { ids, .. } => {
                let at = ids.partition_point(|&x| x <= id);
                ids.get(at).copied()
            }
            Self::AllIds { nids } => {
                let next = id.0 + 1;
                (next < *nids).then_some(EntryId(next))
            }
        }
    }

    /// Iterates the IDs in increasing order. AllIds yields `1..nids`.
    pub fn iter(&self) -> IdListIter<'_> {
        IdListIter { idl: self, at: 0 }
    }

    /// Appends `id`, which the caller knows is the largest so far.
    pub fn append(&mut self, id: EntryId) -> AppendResult {
        match self {
            Self::AllIds { .. } => AppendResult::AlreadyLast,
            Self::Regular { nmax, ids } => {
                if ids.last() == Some(&id) {
                    return AppendResult::AlreadyLast;
                }
                if ids.len() >= *nmax {
                    return AppendResult::CapacityExceeded;
                }
                ids.push(id);
                AppendResult::Appended
            }
        }
    }

    /// Inserts `id` in sorted position, doubling the capacity when full.
    pub fn insert_id(&mut self, id: EntryId) -> InsertResult {
        match self {
            Self::AllIds { .. } => InsertResult::AllIds,
            Self::Regular { nmax, ids } => match ids.binary_search(&id) {
                Ok(_) => InsertResult::AlreadyPresent,
                Err(at) => {
                    if ids.len() >= *nmax {
                        *nmax = (*nmax).max(1) * 2;
                    }
                    ids.insert(at, id);
                    InsertResult::Inserted
                }
            },
        }
    }

    /// Removes `id`, reporting how the list changed.
    pub fn delete_id(&mut self, id: EntryId) -> DeleteResult {
        match self {
            Self::AllIds { .. } => DeleteResult::AllIds,
            Self::Regular { ids, .. } => match ids.binary_search(&id) {
                Err(_) => DeleteResult::Absent,
                Ok(at) => {
                    ids.remove(at);
                    if ids.is_empty() {
                        DeleteResult::Emptied
                    } else if at == 0 {
                        DeleteResult::DeletedFirstChanged
                    } else {
                        DeleteResult::Deleted
                    }
                }
            },
        }
    }

    /// Sorted-merge union. AllIds dominates.
    #[must_use]
    pub fn union(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (Self::AllIds { nids }, Self::AllIds { nids: other }) => Self::AllIds {
                nids: (*nids).max(*other),
            },
            (Self::AllIds { nids }, _) | (_, Self::AllIds { nids }) => {
                Self::AllIds { nids: *nids }
            }
            (Self::Regular { ids: x, .. }, Self::Regular { ids: y, .. }) => {
                let mut merged = Vec::with_capacity(x.len() + y.len());
                let (mut i, mut j) = (0, 0);
                while i < x.len() && j < y.len() {
                    match x[i].cmp(&y[j]) {
                        std::cmp::Ordering::Less => {
                            merged.push(x[i]);
                            i += 1;
                        }
                        std::cmp::Ordering::Greater => {
                            merged.push(y[j]);
                            j += 1;
                        }
                        std::cmp::Ordering::Equal => {
                            merged.push(x[i]);
                            i += 1;
                            j += 1;
                        }
                    }
                }
                merged.extend_from_slice(&x[i..]);
                merged.extend_from_slice(&y[j..]);
                Self::from_ids(merged)
            }
        }
    }

    /// Sorted-merge intersection. AllIds is the identity; the caller is
    /// responsible for keeping the filter-test signal when it sees an
    /// AllIds operand.
    #[must_use]
    pub fn intersection(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (Self::AllIds { .. }, other) | (other, Self::AllIds { .. }) => other.clone(),
            (Self::Regular { ids: x, .. }, Self::Regular { ids: y, .. }) => {
                let (small, large) = if x.len() <= y.len() { (x, y) } else { (y, x) };
                let mut out = Vec::with_capacity(small.len());
                let mut j = 0;
                for &id in small {
                    while j < large.len() && large[j] < id {
                        j += 1;
                    }
                    if j == large.len() {
                        break;
                    }
                    if large[j] == id {
                        out.push(id);
                    }
                }
                Self::from_ids(out)
            }
        }
    }

    /// `a \ b`, with a fast path when the ranges are disjoint.
    ///
    /// Subtracting AllIds returns `a` unchanged; the engine cannot
    /// enumerate AllIds, so the result stays a conservative superset for
    /// the filter test to trim.
    #[must_use]
    pub fn notin(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (_, Self::AllIds { .. }) => a.clone(),
            (Self::AllIds { nids }, Self::Regular { ids: excl, .. }) => {
                let mut out = Vec::new();
                let mut j = 0;
                for raw in 1..*nids {
                    let id = EntryId(raw);
                    while j < excl.len() && excl[j] < id {
                        j += 1;
                    }
                    if j < excl.len() && excl[j] == id {
                        continue;
                    }
                    out.push(id);
                }
                Self::from_ids(out)
            }
            (Self::Regular { ids: x, .. }, Self::Regular { ids: y, .. }) => {
                if x.is_empty() || y.is_empty() {
                    return a.clone();
                }
                // Disjoint ranges: nothing to subtract.
                if x[x.len() - 1] < y[0] || x[0] > y[y.len() - 1] {
                    return a.clone();
                }
                let mut out = Vec::with_capacity(x.len());
                let mut j = 0;
                for &id in x {
                    while j < y.len() && y[j] < id {
                        j += 1;
                    }
                    if j < y.len() && y[j] == id {
                        continue;
                    }
                    out.push(id);
                }
                Self::from_ids(out)
            }
        }
    }
}

/// Iterator over an [`IdList`].
pub struct IdListIter<'a> {
    idl: &'a IdList,
    at: usize,
}

impl Iterator for IdListIter<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        match self.idl {
            IdList::Regular { ids, .. } => {
                let id = ids.get(self.at).copied()?;
                self.at += 1;
                Some(id)
            }
            IdList::AllIds { nids } => {
                let next = u32::try_from(self.at).ok()? + 1;
                if next < *nids {
                    self.at += 1;
                    Some(EntryId(next))
                } else {
                    None
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a IdList {
    type Item = EntryId;
    type IntoIter = IdListIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
