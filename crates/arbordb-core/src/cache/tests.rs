use super::*;
use crate::entry::opattr;

fn entry(id: u32, dn: &str) -> Entry {
    let mut e = Entry::new(Dn::parse(dn).unwrap());
    e.add_values(opattr::OBJECTCLASS, &[b"person".to_vec()])
        .unwrap();
    e.set_bookkeeping(EntryId(id), None);
    e
}

#[test]
fn three_maps_share_one_object() {
    let cache = EntryCache::new(0, 0);
    let e = entry(1, "cn=a,o=x");
    let uuid = e.unique_id().to_string();
    drop(cache.add(e));

    let by_id = cache.find_by_id(EntryId(1)).unwrap();
    let by_dn = cache.find_by_dn(&Dn::parse("cn=a,o=x").unwrap()).unwrap();
    let by_uuid = cache.find_by_uuid(&uuid).unwrap();
    assert_eq!(by_id.id(), EntryId(1));
    assert_eq!(by_dn.id(), EntryId(1));
    assert_eq!(by_uuid.id(), EntryId(1));

    let stats = cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 0);
}

#[test]
fn tentative_add_reserves_the_dn_slot() {
    let cache = EntryCache::new(0, 0);
    let first = cache.add_tentative(entry(1, "cn=a,o=x")).unwrap();

    // A racing add of the same DN is refused.
    let racing = cache.add_tentative(entry(2, "cn=a,o=x"));
    assert!(matches!(racing, Err(Error::AlreadyExists(_))));

    // Abort path: the tentative entry is removed, freeing the slot.
    drop(first);
    cache.remove(EntryId(1));
    assert!(cache.add_tentative(entry(2, "cn=a,o=x")).is_ok());
}

#[test]
fn replace_swaps_all_mappings() {
    let cache = EntryCache::new(0, 0);
    drop(cache.add(entry(1, "cn=a,o=x")));

    // Simulate a modrdn commit: same ID, new DN.
    let renamed = entry(1, "cn=c,o=x");
    let new_uuid = renamed.unique_id().to_string();
    drop(cache.replace(EntryId(1), renamed));

    assert!(cache.find_by_dn(&Dn::parse("cn=a,o=x").unwrap()).is_none());
    let found = cache.find_by_dn(&Dn::parse("cn=c,o=x").unwrap()).unwrap();
    assert_eq!(found.id(), EntryId(1));
    assert!(cache.find_by_uuid(&new_uuid).is_some());
    assert_eq!(cache.len(), 1);
}

#[test]
fn eviction_is_lru_and_skips_pinned() {
    let cache = EntryCache::new(3, 0);
    drop(cache.add(entry(1, "cn=a,o=x")));
    drop(cache.add(entry(2, "cn=b,o=x")));
    let pinned = cache.add(entry(3, "cn=c,o=x"));

    // Touch 1 so that 2 becomes the least recently used.
    assert!(cache.find_by_id(EntryId(1)).is_some());
    drop(cache.add(entry(4, "cn=d,o=x")));

    assert_eq!(cache.len(), 3);
    assert!(cache.find_by_id(EntryId(2)).is_none());
    assert!(cache.find_by_id(EntryId(1)).is_some());
    assert!(cache.find_by_id(EntryId(4)).is_some());
    drop(pinned);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn byte_budget_drives_eviction() {
    let first = entry(1, "cn=a,o=x");
    let budget = first.size_bytes() + 10;
    let cache = EntryCache::new(0, budget);
    drop(cache.add(first));
    drop(cache.add(entry(2, "cn=b,o=x")));
    assert_eq!(cache.len(), 1);
    assert!(cache.bytes() <= budget);
}

#[test]
fn entry_lock_serializes_mutators() {
    let cache = EntryCache::new(0, 0);
    let lock = cache.entry_lock(EntryId(1));
    let guard = lock.lock();
    let again = cache.entry_lock(EntryId(1));
    assert!(again.try_lock().is_none());
    drop(guard);
    assert!(again.try_lock().is_some());
}
