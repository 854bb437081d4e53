//! Bulk-import index buffering.
//!
//! Writing one IDL insert per derived key is fine for single operations
//! but ruinous for imports, where thousands of entries hit the same
//! substring grams. The buffer hashes each derived key into a bounded
//! table of bins, batches the IDs per key, and flushes each bin as one
//! union with the on-disk IDL.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::entry::Entry;
use crate::error::Result;
use crate::id::EntryId;
use crate::idl::IdList;
use crate::index::attrinfo::IndexMask;
use crate::instance::Instance;
use crate::store::Txn;

/// Number of bins; derived keys hash into one byte.
pub const BIN_COUNT: usize = 256;

/// Default number of buffered (key, id) pairs before a flush is due.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// One attribute's import-time index buffer.
pub struct IndexBuffer {
    attr: String,
    bins: Vec<FxHashMap<Vec<u8>, IdList>>,
    pending: usize,
    flush_threshold: usize,
}

impl IndexBuffer {
    /// A buffer for `attr` flushing after `flush_threshold` buffered
    /// pairs (0 = only on demand).
    #[must_use]
    pub fn new(attr: &str, flush_threshold: usize) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            bins: (0..BIN_COUNT).map(|_| FxHashMap::default()).collect(),
            pending: 0,
            flush_threshold,
        }
    }

    /// The attribute this buffer serves.
    #[must_use]
    pub fn attr(&self) -> &str {
        &self.attr
    }

    fn bin_of(key: &[u8]) -> usize {
        key.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) as usize
    }

    /// Buffers `entry`'s contribution to this attribute's index: every
    /// derived key (all enabled kinds) maps to the entry's ID.
    ///
    /// # Errors
    ///
    /// Key derivation (encryption) failures propagate.
    pub fn collect_entry(&mut self, instance: &Instance, entry: &Entry) -> Result<()> {
        let Some(ai) = instance.attrinfo().get(&self.attr) else {
            return Ok(());
        };
        let values = entry.values_of_base(&self.attr);
        if values.is_empty() {
            return Ok(());
        }
        let id = entry.id();

        if ai.mask().contains(IndexMask::PRESENCE) {
            self.push(crate::index::keys::presence_key(), id);
        }
        let value_kinds = ai.mask().intersect(
            IndexMask::EQUALITY
                .with(IndexMask::APPROX)
                .with(IndexMask::SUBSTRING)
                .with(IndexMask::RULES),
        );
        if !value_kinds.is_none() {
            for value in values {
                for key in instance.keys_for_value(&ai, value_kinds, value, false)? {
                    self.push(key, id);
                }
            }
        }
        Ok(())
    }

    /// Buffers one pre-derived key → ID pair (rebuild paths that derive
    /// their own keys use this directly).
    pub(crate) fn push(&mut self, key: Vec<u8>, id: EntryId) {
        let bin = Self::bin_of(&key);
        let idl = self.bins[bin]
            .entry(key)
            .or_insert_with(|| IdList::alloc(4));
        idl.insert_id(id);
        self.pending += 1;
    }

    /// True once the buffer crossed its flush threshold.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.flush_threshold > 0 && self.pending >= self.flush_threshold
    }

    /// Flushes every bin: each buffered key becomes one union with the
    /// on-disk IDL (a fresh key is stored as a whole block; an existing
    /// key absorbs the IDs one by one so its block shape stays
    /// consistent).
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn flush(&mut self, instance: &Instance, txn: &Txn) -> Result<()> {
        let Some(ai) = instance.attrinfo().get(&self.attr) else {
            return Ok(());
        };
        let db = instance.index_db(&self.attr)?;
        let tuning = *ai.tuning();
        let encoding = instance.config().idl_switch;
        let next_id = instance.next_id_value();

        let mut keys_flushed = 0usize;
        for bin in &mut self.bins {
            for (key, idl) in bin.drain() {
                keys_flushed += 1;
                match encoding.fetch(txn, db, &key, next_id)? {
                    None => encoding.store_block(txn, db, &key, &idl, &tuning, next_id)?,
                    Some(_) => {
                        for id in &idl {
                            encoding.insert_key(txn, db, &key, id, &tuning, next_id)?;
                        }
                    }
                }
            }
        }
        debug!(attr = %self.attr, keys_flushed, pending = self.pending, "index buffer flushed");
        self.pending = 0;
        Ok(())
    }
}
