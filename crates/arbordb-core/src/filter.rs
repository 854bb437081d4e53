//! Filter trees and the candidate layer.
//!
//! The front-end hands the engine an already-parsed filter tree. Each leaf
//! maps to one or more index reads; compound nodes feed their component
//! IDLs into the k-way [`IdListSet`] engine. Whenever a leaf cannot be
//! answered exactly from an index (an unindexed attribute, substring
//! grams, a NOT that cannot be enumerated), the
//! candidate list degrades to a superset and the "don't bypass the filter
//! test" flag on the operation context tells the search layer to verify
//! every candidate against [`Filter::matches`].

use crate::entry::{value_eq, value_normalize, Entry};
use crate::error::Result;
use crate::idl::{IdList, IdListSet};
use crate::index::keys;
use crate::index::IndexKind;
use crate::instance::Instance;
use crate::store::Txn;
use crate::txn::OpContext;

/// An already-parsed search filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Every subfilter matches.
    And(Vec<Filter>),
    /// At least one subfilter matches.
    Or(Vec<Filter>),
    /// The subfilter does not match.
    Not(Box<Filter>),
    /// `(attr=value)`
    Equality {
        /// Attribute base type.
        attr: String,
        /// Asserted value.
        value: Vec<u8>,
    },
    /// `(attr=*)`
    Presence {
        /// Attribute base type.
        attr: String,
    },
    /// `(attr~=value)`
    Approx {
        /// Attribute base type.
        attr: String,
        /// Asserted value.
        value: Vec<u8>,
    },
    /// `(attr=initial*middle*final)`
    Substring {
        /// Attribute base type.
        attr: String,
        /// Leading run, when anchored at the start.
        initial: Option<Vec<u8>>,
        /// Unanchored middle runs, in order.
        middles: Vec<Vec<u8>>,
        /// Trailing run, when anchored at the end.
        final_: Option<Vec<u8>>,
    },
    /// `(attr>=value)`
    Ge {
        /// Attribute base type.
        attr: String,
        /// Lower bound (inclusive).
        value: Vec<u8>,
    },
    /// `(attr<=value)`
    Le {
        /// Attribute base type.
        attr: String,
        /// Upper bound (inclusive).
        value: Vec<u8>,
    },
    /// `(attr:oid:=value)` extensible match.
    Extensible {
        /// Attribute base type.
        attr: String,
        /// Matching rule OID.
        oid: String,
        /// Asserted value.
        value: Vec<u8>,
    },
}

impl Filter {
    /// `(attr=value)`
    #[must_use]
    pub fn eq(attr: &str, value: &[u8]) -> Self {
        Self::Equality {
            attr: attr.to_ascii_lowercase(),
            value: value.to_vec(),
        }
    }

    /// `(attr=*)`
    #[must_use]
    pub fn pres(attr: &str) -> Self {
        Self::Presence {
            attr: attr.to_ascii_lowercase(),
        }
    }

    /// `(attr=*value*)`
    #[must_use]
    pub fn contains(attr: &str, value: &[u8]) -> Self {
        Self::Substring {
            attr: attr.to_ascii_lowercase(),
            initial: None,
            middles: vec![value.to_vec()],
            final_: None,
        }
    }

    /// Evaluates the filter against an in-memory entry: the post-filter
    /// test applied to every candidate of a superset IDL.
    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Self::And(subs) => subs.iter().all(|f| f.matches(entry)),
            Self::Or(subs) => subs.iter().any(|f| f.matches(entry)),
            Self::Not(sub) => !sub.matches(entry),
            Self::Equality { attr, value } => entry.has_value(attr, value),
            Self::Presence { attr } => !entry.values_of_base(attr).is_empty(),
            Self::Approx { attr, value } => {
                let wanted = keys::soundex(value);
                entry
                    .values_of_base(attr)
                    .iter()
                    .any(|v| keys::soundex(v) == wanted)
            }
            Self::Substring {
                attr,
                initial,
                middles,
                final_,
            } => entry
                .values_of_base(attr)
                .iter()
                .any(|v| substring_matches(v, initial.as_deref(), middles, final_.as_deref())),
            Self::Ge { attr, value } => {
                let bound = value_normalize(value);
                entry
                    .values_of_base(attr)
                    .iter()
                    .any(|v| value_normalize(v) >= bound)
            }
            Self::Le { attr, value } => {
                let bound = value_normalize(value);
                entry
                    .values_of_base(attr)
                    .iter()
                    .any(|v| value_normalize(v) <= bound)
            }
            // Without the rule implementation, fall back to equality.
            Self::Extensible { attr, value, .. } => entry
                .values_of_base(attr)
                .iter()
                .any(|v| value_eq(v, value)),
        }
    }
}

fn substring_matches(
    value: &[u8],
    initial: Option<&[u8]>,
    middles: &[Vec<u8>],
    final_: Option<&[u8]>,
) -> bool {
    let hay = value_normalize(value);
    let mut at = 0usize;
    if let Some(initial) = initial {
        let needle = value_normalize(initial);
        if !hay.starts_with(needle.as_slice()) {
            return false;
        }
        at = needle.len();
    }
    for middle in middles {
        let needle = value_normalize(middle);
        match find_from(&hay, &needle, at) {
            Some(found) => at = found + needle.len(),
            None => return false,
        }
    }
    if let Some(final_) = final_ {
        let needle = value_normalize(final_);
        if hay.len() < at + needle.len() || !hay.ends_with(needle.as_slice()) {
            return false;
        }
    }
    true
}

fn find_from(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from);
    }
    hay.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

impl Instance {
    /// Turns a filter tree into a candidate IDL.
    ///
    /// The result can be a superset of the true match set; `ctx` then
    /// carries the raised filter-test flag and the caller verifies each
    /// candidate with [`Filter::matches`].
    ///
    /// # Errors
    ///
    /// Store failures and scan limits propagate unchanged.
    pub fn filter_candidates(
        &self,
        txn: &Txn,
        ctx: &OpContext,
        filter: &Filter,
    ) -> Result<IdList> {
        let next_id = self.next_id_value();
        match filter {
            Filter::Equality { attr, value } => {
                self.index_read(txn, ctx, attr, IndexKind::Equality, value)
            }
            Filter::Presence { attr } => {
                self.index_read(txn, ctx, attr, IndexKind::Presence, b"")
            }
            Filter::Approx { attr, value } => {
                self.index_read(txn, ctx, attr, IndexKind::Approx, value)
            }
            Filter::Extensible { attr, oid, value } => {
                self.index_read(txn, ctx, attr, IndexKind::Rules(oid), value)
            }
            Filter::Ge { attr, value } => {
                self.index_range_read(txn, ctx, attr, Some(value), true, None, true)
            }
            Filter::Le { attr, value } => {
                self.index_range_read(txn, ctx, attr, None, true, Some(value), true)
            }
            Filter::Substring {
                attr,
                initial,
                middles,
                final_,
            } => {
                // Gram candidates are always a superset of the true
                // matches; the filter test is mandatory.
                ctx.set_dont_bypass_filter_test();
                let grams = keys::substring_pattern_keys(
                    initial.as_deref(),
                    middles,
                    final_.as_deref(),
                );
                if grams.is_empty() {
                    return Ok(IdList::allids(next_id));
                }
                let mut set = IdListSet::new();
                for gram_key in &grams {
                    // Strip the prefix and terminator back off: index_read
                    // derives the stored key from the bare gram.
                    let gram = &gram_key[1..gram_key.len() - 1];
                    set.insert(self.index_read(txn, ctx, attr, IndexKind::Substring, gram)?);
                }
                let (idl, _) = set.intersect(next_id);
                Ok(idl)
            }
            Filter::Or(subs) => {
                let mut set = IdListSet::new();
                for sub in subs {
                    if matches!(sub, Filter::Not(_)) {
                        // A negation inside OR cannot be enumerated.
                        ctx.set_dont_bypass_filter_test();
                        return Ok(IdList::allids(next_id));
                    }
                    set.insert(self.filter_candidates(txn, ctx, sub)?);
                }
                Ok(set.union(next_id))
            }
            Filter::And(subs) => {
                let mut set = IdListSet::new();
                for sub in subs {
                    match sub {
                        Filter::Not(inner) => {
                            ctx.set_dont_bypass_filter_test();
                            set.insert_complement(self.filter_candidates(txn, ctx, inner)?);
                        }
                        _ => set.insert(self.filter_candidates(txn, ctx, sub)?),
                    }
                }
                let (idl, dont_bypass) = set.intersect(next_id);
                if dont_bypass {
                    ctx.set_dont_bypass_filter_test();
                }
                Ok(idl)
            }
            Filter::Not(_) => {
                // A bare negation has no index form.
                ctx.set_dont_bypass_filter_test();
                Ok(IdList::allids(next_id))
            }
        }
    }
}
