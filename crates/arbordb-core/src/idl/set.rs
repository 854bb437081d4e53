//! The k-way IDL set engine.
//!
//! Compound filters accumulate their component lists here and finish with
//! one union or one intersection, instead of chaining pairwise operations
//! and materializing every intermediate. The union is a heap-driven k-way
//! merge (`O(N log k)` for `N` total IDs across `k` lists); the
//! intersection drives candidates from the smallest list.
//!
//! Both finishers can decide that the produced list is a conservative
//! *superset* of the true match set: any AllIds component, or a smallest
//! list short enough that verifying candidates beats merging. That verdict
//! travels back as the "don't bypass the filter test" flag; the search
//! layer then re-checks every candidate against the filter.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::IdList;
use crate::id::EntryId;

/// Below this length the intersection returns the smallest component
/// outright and asks for the filter test.
pub const FILTER_TEST_THRESHOLD: usize = 10;

/// Accumulator for one compound filter node.
#[derive(Debug, Default)]
pub struct IdListSet {
    lists: Vec<Vec<EntryId>>,
    complements: Vec<IdList>,
    allids: bool,
    complement_allids: bool,
}

impl IdListSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a positive component. AllIds components only raise the flag;
    /// there is nothing to merge.
    pub fn insert(&mut self, idl: IdList) {
        match idl {
            IdList::AllIds { .. } => self.allids = true,
            IdList::Regular { ids, .. } => self.lists.push(ids),
        }
    }

    /// Adds a complement (NOT) component, subtracted after the positive
    /// sets combine. A complement of AllIds empties the result outright.
    pub fn insert_complement(&mut self, idl: IdList) {
        if idl.is_allids() {
            self.complement_allids = true;
        } else {
            self.complements.push(idl);
        }
    }

    /// Number of positive components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    /// True when no positive component (not even AllIds) was inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty() && !self.allids
    }

    /// K-way union of the positive components.
    ///
    /// `next_id` sizes the AllIds sentinel when one dominates the result.
    #[must_use]
    pub fn union(self, next_id: u32) -> IdList {
        if self.allids {
            return IdList::allids(next_id);
        }

        let total: usize = self.lists.iter().map(Vec::len).sum();
        let mut out: Vec<EntryId> = Vec::with_capacity(total);
        let mut positions = vec![0usize; self.lists.len()];
        let mut heap: BinaryHeap<Reverse<(EntryId, usize)>> = self
            .lists
            .iter()
            .enumerate()
            .filter_map(|(li, ids)| ids.first().map(|&id| Reverse((id, li))))
            .collect();

        while let Some(Reverse((id, li))) = heap.pop() {
            if out.last() != Some(&id) {
                out.push(id);
            }
            positions[li] += 1;
            if let Some(&next) = self.lists[li].get(positions[li]) {
                heap.push(Reverse((next, li)));
            }
        }
        IdList::from_ids(out)
    }

    /// K-way intersection of the positive components, complements applied
    /// last. Returns the candidate list and whether the caller must keep
    /// the filter test (the list is a superset of the true matches).
    #[must_use]
    pub fn intersect(self, next_id: u32) -> (IdList, bool) {
        let mut dont_bypass = self.allids;

        let mut result = if self.lists.is_empty() {
            if self.allids {
                IdList::allids(next_id)
            } else {
                IdList::alloc(0)
            }
        } else if self.lists.len() == 1 {
            let mut lists = self.lists;
            IdList::from_ids(lists.swap_remove(0))
        } else {
            let smallest = self
                .lists
                .iter()
                .enumerate()
                .min_by_key(|(_, ids)| ids.len())
                .map_or(0, |(li, _)| li);

            if self.lists[smallest].len() <= FILTER_TEST_THRESHOLD {
                // Cheaper to test a handful of candidates than to merge.
                dont_bypass = true;
                IdList::from_ids(self.lists[smallest].clone())
            } else {
                let mut positions = vec![0usize; self.lists.len()];
                let mut out = Vec::with_capacity(self.lists[smallest].len());
                'candidates: for &id in &self.lists[smallest] {
                    for (li, ids) in self.lists.iter().enumerate() {
                        if li == smallest {
                            continue;
                        }
                        let pos = &mut positions[li];
                        while *pos < ids.len() && ids[*pos] < id {
                            *pos += 1;
                        }
                        if *pos == ids.len() {
                            break 'candidates; // one list drained: done
                        }
                        if ids[*pos] != id {
                            continue 'candidates;
                        }
                    }
                    out.push(id);
                }
                IdList::from_ids(out)
            }
        };

        if self.complement_allids {
            return (IdList::alloc(0), dont_bypass);
        }
        if !result.is_empty() {
            for complement in &self.complements {
                result = IdList::notin(&result, complement);
            }
        }
        (result, dont_bypass)
    }
}
