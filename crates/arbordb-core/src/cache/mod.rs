//! The entry cache.
//!
//! Three coordinated maps (by ID, by normalized DN, by unique ID) share
//! the same [`CachedEntry`] objects. Entries are immutable snapshots:
//! mutators build a new entry and [`EntryCache::replace`] swaps it in after
//! the transaction commits, so readers never observe a half-applied write.
//!
//! The protocol around writes:
//!
//! - [`EntryCache::add_tentative`] reserves the DN/ID/unique-ID slots
//!   before the transaction commits; a concurrent add of the same DN gets
//!   "already exists" instead of racing.
//! - On commit, [`EntryCache::replace`] atomically swaps old for new.
//! - On abort, [`EntryCache::remove`] drops the tentative entry (or the
//!   old entry is simply left in place).
//!
//! Eviction is LRU over the ID map (front = least recent) bounded by both
//! an entry count and a byte budget; pinned and tentative entries are
//! never evicted.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::entry::{Dn, Entry};
use crate::error::{Error, Result};
use crate::id::EntryId;

/// One cached entry: an immutable snapshot plus cache bookkeeping.
pub struct CachedEntry {
    entry: Entry,
    pins: AtomicUsize,
    tentative: AtomicBool,
    size: usize,
}

impl CachedEntry {
    fn new(entry: Entry, tentative: bool) -> Arc<Self> {
        let size = entry.size_bytes();
        Arc::new(Self {
            entry,
            pins: AtomicUsize::new(0),
            tentative: AtomicBool::new(tentative),
            size,
        })
    }

    /// The entry snapshot.
    #[must_use]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }
}

/// A pinned reference to a cached entry; the pin blocks eviction and is
/// released on drop.
pub struct PinnedEntry {
    cached: Arc<CachedEntry>,
}

impl PinnedEntry {
    fn new(cached: Arc<CachedEntry>) -> Self {
        cached.pins.fetch_add(1, Ordering::AcqRel);
        Self { cached }
    }
}

impl std::ops::Deref for PinnedEntry {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.cached.entry
    }
}

impl Drop for PinnedEntry {
    fn drop(&mut self) {
        self.cached.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cache counters, for monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that found their entry.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Entries evicted under memory pressure.
    pub evictions: u64,
}

struct CacheInner {
    /// Insertion order doubles as recency: front = LRU, back = MRU.
    by_id: IndexMap<EntryId, Arc<CachedEntry>>,
    by_dn: HashMap<Dn, Arc<CachedEntry>>,
    by_uuid: HashMap<String, Arc<CachedEntry>>,
    bytes: usize,
}

/// The instance's entry cache.
pub struct EntryCache {
    inner: Mutex<CacheInner>,
    locks: DashMap<EntryId, Arc<Mutex<()>>>,
    max_entries: usize,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EntryCache {
    /// Creates a cache bounded by `max_entries` and `max_bytes` (either
    /// may be 0 for "unbounded").
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                by_id: IndexMap::new(),
                by_dn: HashMap::new(),
                by_uuid: HashMap::new(),
                bytes: 0,
            }),
            locks: DashMap::new(),
            max_entries,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The per-entry mutation lock. Mutators hold it across their whole
    /// read-modify-write-commit sequence.
    #[must_use]
    pub fn entry_lock(&self, id: EntryId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes accounted to cached entries.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn touch(inner: &mut CacheInner, id: EntryId) {
        if let Some(cached) = inner.by_id.shift_remove(&id) {
            inner.by_id.insert(id, cached);
        }
    }

    fn lookup(&self, found: Option<Arc<CachedEntry>>) -> Option<PinnedEntry> {
        match found {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(PinnedEntry::new(cached))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Finds by internal ID, refreshing recency.
    #[must_use]
    pub fn find_by_id(&self, id: EntryId) -> Option<PinnedEntry> {
        let mut inner = self.inner.lock();
        let found = inner.by_id.get(&id).cloned();
        if found.is_some() {
            Self::touch(&mut inner, id);
        }
        drop(inner);
        self.lookup(found)
    }

    /// Finds by normalized DN, refreshing recency.
    #[must_use]
    pub fn find_by_dn(&self, dn: &Dn) -> Option<PinnedEntry> {
        let mut inner = self.inner.lock();
        let found = inner.by_dn.get(dn).cloned();
        if let Some(cached) = &found {
            Self::touch(&mut inner, cached.entry.id());
        }
        drop(inner);
        self.lookup(found)
    }

    /// Finds by unique ID, refreshing recency.
    #[must_use]
    pub fn find_by_uuid(&self, unique_id: &str) -> Option<PinnedEntry> {
        let mut inner = self.inner.lock();
        let found = inner.by_uuid.get(unique_id).cloned();
        if let Some(cached) = &found {
            Self::touch(&mut inner, cached.entry.id());
        }
        drop(inner);
        self.lookup(found)
    }

    fn insert_locked(inner: &mut CacheInner, cached: &Arc<CachedEntry>) {
        inner.bytes += cached.size;
        inner.by_id.insert(cached.entry.id(), Arc::clone(cached));
        inner
            .by_dn
            .insert(cached.entry.dn().clone(), Arc::clone(cached));
        inner
            .by_uuid
            .insert(cached.entry.unique_id().to_string(), Arc::clone(cached));
    }

    fn unlink_locked(inner: &mut CacheInner, cached: &Arc<CachedEntry>) {
        if inner.by_id.shift_remove(&cached.entry.id()).is_some() {
            inner.bytes = inner.bytes.saturating_sub(cached.size);
        }
        inner.by_dn.remove(cached.entry.dn());
        inner.by_uuid.remove(cached.entry.unique_id());
    }

    /// Inserts a committed entry (read-miss fill or post-commit add) and
    /// returns it pinned.
    #[must_use]
    pub fn add(&self, entry: Entry) -> PinnedEntry {
        let cached = CachedEntry::new(entry, false);
        let mut inner = self.inner.lock();
        Self::insert_locked(&mut inner, &cached);
        self.evict_locked(&mut inner);
        drop(inner);
        PinnedEntry::new(cached)
    }

    /// Reserves the DN, ID and unique-ID slots for an add still inside its
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] when any slot is already occupied,
    /// typically a concurrent add racing on the same DN.
    pub fn add_tentative(&self, entry: Entry) -> Result<PinnedEntry> {
        let mut inner = self.inner.lock();
        if inner.by_dn.contains_key(entry.dn()) {
            return Err(Error::AlreadyExists(entry.dn().to_string()));
        }
        if inner.by_id.contains_key(&entry.id()) || inner.by_uuid.contains_key(entry.unique_id())
        {
            return Err(Error::AlreadyExists(entry.dn().to_string()));
        }
        let cached = CachedEntry::new(entry, true);
        Self::insert_locked(&mut inner, &cached);
        drop(inner);
        Ok(PinnedEntry::new(cached))
    }

    /// The post-commit switch: drops every mapping of the old entry under
    /// `id` and installs `new` (whose DN/UUID may differ after modrdn).
    #[must_use]
    pub fn replace(&self, id: EntryId, new: Entry) -> PinnedEntry {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.by_id.get(&id).cloned() {
            Self::unlink_locked(&mut inner, &old);
        }
        let cached = CachedEntry::new(new, false);
        Self::insert_locked(&mut inner, &cached);
        self.evict_locked(&mut inner);
        drop(inner);
        PinnedEntry::new(cached)
    }

    /// Drops the entry under `id` from every map (delete commit, or
    /// tentative rollback after an aborted add).
    pub fn remove(&self, id: EntryId) {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.by_id.get(&id).cloned() {
            Self::unlink_locked(&mut inner, &cached);
        }
        drop(inner);
        self.locks.remove(&id);
    }

    /// Marks a tentative entry as committed without changing its content.
    pub fn confirm(&self, id: EntryId) {
        let inner = self.inner.lock();
        if let Some(cached) = inner.by_id.get(&id) {
            cached.tentative.store(false, Ordering::Release);
        }
    }

    fn evict_locked(&self, inner: &mut CacheInner) {
        let over = |inner: &CacheInner| {
            (self.max_entries > 0 && inner.by_id.len() > self.max_entries)
                || (self.max_bytes > 0 && inner.bytes > self.max_bytes)
        };
        if !over(inner) {
            return;
        }
        // Walk from the LRU end, skipping pinned and tentative entries.
        let victims: Vec<Arc<CachedEntry>> = inner
            .by_id
            .values()
            .filter(|c| c.pins.load(Ordering::Acquire) == 0 && !c.tentative.load(Ordering::Acquire))
            .cloned()
            .collect();
        for victim in victims {
            if !over(inner) {
                break;
            }
            Self::unlink_locked(inner, &victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
