//! Per-attribute index configuration (`AttrInfo`).
//!
//! One record per attribute the instance knows about: which index kinds are
//! maintained, the IDL tuning, matching-rule OIDs, the optional encryption
//! provider, and the OFFLINE bit bulk rebuilds use to fence normal writers
//! (writes treat an OFFLINE attribute as unindexed for the duration).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{IndexConfig, InstanceConfig};
use crate::crypt::AttrCrypt;
use crate::idl::shim::IdlTuning;

/// Which index kinds an attribute maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexMask(u16);

impl IndexMask {
    /// Presence index (`+`).
    pub const PRESENCE: Self = Self(1);
    /// Equality index (`=`).
    pub const EQUALITY: Self = Self(2);
    /// Approximate (phonetic) index (`~`).
    pub const APPROX: Self = Self(4);
    /// Substring index (`*`).
    pub const SUBSTRING: Self = Self(8);
    /// Matching-rule indexes (`:`).
    pub const RULES: Self = Self(16);

    /// The empty mask (attribute not indexed).
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Union of two masks.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no kind is enabled.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Intersection of two masks.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

/// Per-attribute index state.
pub struct AttrInfo {
    attr: String,
    mask: IndexMask,
    tuning: IdlTuning,
    matching_rules: Vec<String>,
    crypt: parking_lot::RwLock<Option<Arc<dyn AttrCrypt>>>,
    wants_crypt: bool,
    offline: AtomicBool,
}

impl AttrInfo {
    /// Creates the record for `attr` with the given kinds and tuning.
    #[must_use]
    pub fn new(attr: &str, mask: IndexMask, tuning: IdlTuning) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            mask,
            tuning,
            matching_rules: Vec::new(),
            crypt: parking_lot::RwLock::new(None),
            wants_crypt: false,
            offline: AtomicBool::new(false),
        }
    }

    fn from_config(index: &IndexConfig, tuning: IdlTuning) -> Self {
        let mut mask = IndexMask::none();
        for kind in &index.kinds {
            mask = mask.with(match kind.as_str() {
                "pres" => IndexMask::PRESENCE,
                "eq" => IndexMask::EQUALITY,
                "approx" => IndexMask::APPROX,
                "sub" => IndexMask::SUBSTRING,
                _ => IndexMask::none(),
            });
        }
        if !index.matching_rules.is_empty() {
            mask = mask.with(IndexMask::RULES);
        }
        let mut ai = Self::new(&index.attr, mask, tuning);
        ai.matching_rules = index.matching_rules.clone();
        ai.wants_crypt = index.attrcrypt.is_some();
        ai
    }

    /// The attribute base type.
    #[must_use]
    pub fn attr(&self) -> &str {
        &self.attr
    }

    /// The enabled index kinds.
    #[must_use]
    pub fn mask(&self) -> IndexMask {
        self.mask
    }

    /// The IDL tuning for this attribute's index file.
    #[must_use]
    pub fn tuning(&self) -> &IdlTuning {
        &self.tuning
    }

    /// Matching-rule OIDs indexed for this attribute.
    #[must_use]
    pub fn matching_rules(&self) -> &[String] {
        &self.matching_rules
    }

    /// True while a bulk rebuild owns the attribute; writers then treat it
    /// as unindexed.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Flips the OFFLINE fence.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Whether the configuration asks for attribute encryption.
    #[must_use]
    pub fn wants_crypt(&self) -> bool {
        self.wants_crypt
    }

    /// The installed encryption provider, if any.
    #[must_use]
    pub fn crypt(&self) -> Option<Arc<dyn AttrCrypt>> {
        self.crypt.read().clone()
    }

    /// Installs the encryption provider.
    pub fn install_crypt(&self, provider: Arc<dyn AttrCrypt>) {
        *self.crypt.write() = Some(provider);
    }
}

/// System attributes every instance indexes for equality regardless of the
/// configured table.
const SYSTEM_EQ_ATTRS: &[&str] = &[
    "entrydn",
    "parentid",
    "ancestorid",
    "nsuniqueid",
    "nscpentrydn",
    "objectclass",
];

/// The instance's attribute-info table.
pub struct AttrInfoRegistry {
    map: DashMap<String, Arc<AttrInfo>>,
}

impl AttrInfoRegistry {
    /// Builds the table from the configured index list plus the system
    /// attributes.
    #[must_use]
    pub fn from_config(config: &InstanceConfig) -> Self {
        let tuning = IdlTuning::derive(config.pagesize, config.allidsthreshold);
        let map = DashMap::new();
        for attr in SYSTEM_EQ_ATTRS {
            // In subtree-rename mode the DN map lives in the entryrdn
            // table, not the flat entrydn index.
            if *attr == "entrydn" && config.subtree_rename {
                continue;
            }
            map.insert(
                (*attr).to_string(),
                Arc::new(AttrInfo::new(attr, IndexMask::EQUALITY, tuning)),
            );
        }
        for index in &config.index {
            let ai = AttrInfo::from_config(index, tuning);
            map.insert(ai.attr.clone(), Arc::new(ai));
        }
        Self { map }
    }

    /// Looks up the record for `attr` (base type, case-insensitive).
    #[must_use]
    pub fn get(&self, attr: &str) -> Option<Arc<AttrInfo>> {
        self.map.get(&attr.to_ascii_lowercase()).map(|e| e.clone())
    }

    /// Registers (or replaces) a record.
    pub fn register(&self, ai: AttrInfo) {
        self.map.insert(ai.attr.clone(), Arc::new(ai));
    }

    /// All known attribute names.
    #[must_use]
    pub fn attrs(&self) -> Vec<String> {
        let mut attrs: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        attrs.sort();
        attrs
    }
}
