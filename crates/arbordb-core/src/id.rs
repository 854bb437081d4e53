//! Entry identifiers and the next-ID allocator.
//!
//! Every entry is known to the rest of the engine by a non-zero 32-bit ID.
//! Indexes, the hierarchy tables and the cache all key on IDs, which keeps
//! ownership simple: the cache owns entry objects, everyone else owns IDs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Internal 32-bit identifier of an entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EntryId(pub u32);

/// The null ID. Never assigned to an entry; terminates indirect-block
/// pointer arrays in the old IDL encoding.
pub const NOID: EntryId = EntryId(0);

/// The largest representable ID. Reaching it is fatal for further adds.
pub const MAXID: EntryId = EntryId(u32::MAX);

/// IDs at or above this value trigger a warning that the database should be
/// rebuilt soon.
pub const ID_WARNING_THRESHOLD: u32 = u32::MAX - 4096;

impl EntryId {
    /// True for the null ID.
    #[must_use]
    pub const fn is_noid(self) -> bool {
        self.0 == 0
    }

    /// Big-endian key form used by `id2entry` and the IDL encodings.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Inverse of [`EntryId::to_be_bytes`].
    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for EntryId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Monotonic ID allocator for one backend instance.
///
/// The counter holds the next ID to hand out and is guarded by a dedicated
/// mutex; [`NextId::next`] and [`NextId::give_back`] are the only mutators.
/// State is recovered at open time from the last key of `id2entry`.
#[derive(Debug)]
pub struct NextId {
    inner: Mutex<u32>,
}

impl NextId {
    /// Creates an allocator whose next handed-out ID is `next`.
    ///
    /// `next` is clamped up to 1; ID 0 is reserved as [`NOID`].
    #[must_use]
    pub fn new(next: u32) -> Self {
        Self {
            inner: Mutex::new(next.max(1)),
        }
    }

    /// Allocates a fresh ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxIdReached`] once the ID space is exhausted.
    pub fn next(&self) -> Result<EntryId> {
        let mut next = self.inner.lock();
        if *next >= MAXID.0 {
            return Err(Error::MaxIdReached);
        }
        let id = *next;
        *next += 1;
        drop(next);

        if id >= ID_WARNING_THRESHOLD {
            warn!(id, "backend may run out of IDs soon, plan a rebuild");
        }
        Ok(EntryId(id))
    }

    /// Returns an ID that ended up unused (the add was aborted).
    ///
    /// Advisory: if another operation already consumed a higher ID the
    /// return is ignored.
    pub fn give_back(&self, id: EntryId) {
        let mut next = self.inner.lock();
        if id.0 == *next - 1 {
            *next -= 1;
        }
    }

    /// The ID the next call to [`NextId::next`] would return.
    #[must_use]
    pub fn peek(&self) -> EntryId {
        EntryId(*self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let alloc = NextId::new(1);
        assert_eq!(alloc.next().unwrap(), EntryId(1));
        assert_eq!(alloc.next().unwrap(), EntryId(2));
        assert_eq!(alloc.peek(), EntryId(3));
    }

    #[test]
    fn give_back_is_advisory() {
        let alloc = NextId::new(5);
        let id = alloc.next().unwrap();
        alloc.give_back(id);
        assert_eq!(alloc.next().unwrap(), id);

        // A stale return is ignored.
        let a = alloc.next().unwrap();
        let _b = alloc.next().unwrap();
        alloc.give_back(a);
        assert_eq!(alloc.peek(), EntryId(8));
    }

    #[test]
    fn exhaustion_is_fatal() {
        let alloc = NextId::new(MAXID.0);
        assert!(matches!(alloc.next(), Err(Error::MaxIdReached)));
    }

    #[test]
    fn zero_start_is_clamped() {
        let alloc = NextId::new(0);
        assert_eq!(alloc.next().unwrap(), EntryId(1));
    }

    #[test]
    fn be_bytes_round_trip() {
        let id = EntryId(0x0102_0304);
        assert_eq!(id.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(EntryId::from_be_bytes([1, 2, 3, 4]), id);
    }
}
