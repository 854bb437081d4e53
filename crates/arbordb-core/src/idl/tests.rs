use proptest::prelude::*;

use super::old::InsertDisposition;
use super::shim::IdlTuning;
use super::*;
use crate::id::EntryId;
use crate::store::{Db, Store, Txn};

fn ids(raw: &[u32]) -> IdList {
    IdList::from_ids(raw.iter().copied().map(EntryId).collect())
}

fn raw(idl: &IdList) -> Vec<u32> {
    idl.ids().map(|s| s.iter().map(|id| id.0).collect()).unwrap_or_default()
}

#[test]
fn insert_delete_restores() {
    let mut idl = ids(&[2, 5, 9]);
    assert_eq!(idl.insert_id(EntryId(7)), InsertResult::Inserted);
    assert_eq!(idl.insert_id(EntryId(7)), InsertResult::AlreadyPresent);
    assert_eq!(idl.delete_id(EntryId(7)), DeleteResult::Deleted);
    assert_eq!(raw(&idl), vec![2, 5, 9]);

    assert_eq!(idl.delete_id(EntryId(2)), DeleteResult::DeletedFirstChanged);
    assert_eq!(idl.delete_id(EntryId(3)), DeleteResult::Absent);
    assert_eq!(idl.delete_id(EntryId(5)), DeleteResult::Deleted);
    assert_eq!(idl.delete_id(EntryId(9)), DeleteResult::Emptied);
}

#[test]
fn append_respects_capacity() {
    let mut idl = IdList::alloc(2);
    assert_eq!(idl.append(EntryId(1)), AppendResult::Appended);
    assert_eq!(idl.append(EntryId(1)), AppendResult::AlreadyLast);
    assert_eq!(idl.append(EntryId(2)), AppendResult::Appended);
    assert_eq!(idl.append(EntryId(3)), AppendResult::CapacityExceeded);

    let mut all = IdList::allids(10);
    assert_eq!(all.append(EntryId(3)), AppendResult::AlreadyLast);
}

#[test]
fn allids_length_and_iteration() {
    let all = IdList::allids(4);
    assert!(all.is_allids());
    assert_eq!(all.length(), u32::MAX as usize);
    assert_eq!(all.first_id(), Some(EntryId(1)));
    assert_eq!(all.next_id_after(EntryId(1)), Some(EntryId(2)));
    assert_eq!(all.next_id_after(EntryId(3)), None);
    let seen: Vec<u32> = all.iter().map(|id| id.0).collect();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[test]
fn union_allids_dominates() {
    let a = ids(&[1, 2]);
    let all = IdList::allids(9);
    assert!(IdList::union(&a, &all).is_allids());
    assert!(IdList::union(&all, &a).is_allids());
}

#[test]
fn intersection_allids_is_identity() {
    let a = ids(&[1, 2, 8]);
    let all = IdList::allids(9);
    assert_eq!(IdList::intersection(&a, &all), a);
    assert_eq!(IdList::intersection(&all, &a), a);
}

#[test]
fn notin_laws() {
    let a = ids(&[1, 3, 5, 7]);
    let b = ids(&[3, 7, 9]);
    assert_eq!(raw(&IdList::notin(&a, &b)), vec![1, 5]);

    // Subtracting AllIds leaves the list for the filter test to trim.
    assert_eq!(IdList::notin(&a, &IdList::allids(20)), a);

    // Disjoint ranges: untouched.
    let low = ids(&[1, 2, 3]);
    let high = ids(&[10, 11]);
    assert_eq!(IdList::notin(&low, &high), low);

    // AllIds minus a regular list enumerates the live range.
    let all = IdList::allids(6);
    assert_eq!(raw(&IdList::notin(&all, &ids(&[2, 4]))), vec![1, 3, 5]);
}

proptest! {
    #[test]
    fn union_is_commutative(mut xs in proptest::collection::vec(1u32..5000, 0..60),
                            mut ys in proptest::collection::vec(1u32..5000, 0..60)) {
        xs.sort_unstable();
        xs.dedup();
        ys.sort_unstable();
        ys.dedup();
        let (a, b) = (ids(&xs), ids(&ys));
        prop_assert_eq!(IdList::union(&a, &b), IdList::union(&b, &a));
        prop_assert_eq!(IdList::intersection(&a, &b), IdList::intersection(&b, &a));
    }

    #[test]
    fn union_is_associative(mut xs in proptest::collection::vec(1u32..2000, 0..40),
                            mut ys in proptest::collection::vec(1u32..2000, 0..40),
                            mut zs in proptest::collection::vec(1u32..2000, 0..40)) {
        xs.sort_unstable();
        xs.dedup();
        ys.sort_unstable();
        ys.dedup();
        zs.sort_unstable();
        zs.dedup();
        let (a, b, c) = (ids(&xs), ids(&ys), ids(&zs));
        prop_assert_eq!(
            IdList::union(&IdList::union(&a, &b), &c),
            IdList::union(&a, &IdList::union(&b, &c))
        );
    }

    #[test]
    fn notin_is_disjoint_subset(mut xs in proptest::collection::vec(1u32..5000, 0..60),
                                mut ys in proptest::collection::vec(1u32..5000, 0..60)) {
        xs.sort_unstable();
        xs.dedup();
        ys.sort_unstable();
        ys.dedup();
        let (a, b) = (ids(&xs), ids(&ys));
        let diff = IdList::notin(&a, &b);
        for id in &diff {
            prop_assert!(a.contains(id));
            prop_assert!(!b.contains(id));
        }
    }
}

// ---- on-disk codecs ----

fn open(kind: IdlKind) -> (Store, Db) {
    let store = Store::in_memory();
    let db = store.open_db("cn", kind.dup_sort()).unwrap();
    (store, db)
}

fn in_txn<T>(store: &Store, f: impl FnOnce(&Txn) -> T) -> T {
    let txn = store.begin(None).unwrap();
    let out = f(&txn);
    txn.commit().unwrap();
    out
}

fn codec_round_trip(kind: IdlKind) {
    let (store, db) = open(kind);
    let tuning = IdlTuning {
        maxids: 4,
        maxindirect: 8,
        allidslimit: 32,
    };
    let key = b"=alice\0";

    in_txn(&store, |txn| {
        for id in [9u32, 1, 5, 3, 7, 2, 8] {
            kind.insert_key(txn, db, key, EntryId(id), &tuning, 100).unwrap();
        }
    });
    let fetched = in_txn(&store, |txn| kind.fetch(txn, db, key, 100).unwrap().unwrap());
    assert_eq!(raw(&fetched), vec![1, 2, 3, 5, 7, 8, 9]);

    in_txn(&store, |txn| {
        kind.delete_key(txn, db, key, EntryId(5)).unwrap();
        // Deleting the first ID of a block forces the rewrite path.
        kind.delete_key(txn, db, key, EntryId(1)).unwrap();
    });
    let fetched = in_txn(&store, |txn| kind.fetch(txn, db, key, 100).unwrap().unwrap());
    assert_eq!(raw(&fetched), vec![2, 3, 7, 8, 9]);

    // Deleting everything removes the key.
    in_txn(&store, |txn| {
        for id in [2u32, 3, 7, 8, 9] {
            kind.delete_key(txn, db, key, EntryId(id)).unwrap();
        }
    });
    assert!(in_txn(&store, |txn| kind.fetch(txn, db, key, 100).unwrap()).is_none());
}

#[test]
fn old_codec_round_trip() {
    codec_round_trip(IdlKind::Old);
}

#[test]
fn new_codec_round_trip() {
    codec_round_trip(IdlKind::New);
}

#[test]
fn old_codec_promotes_past_indirect_budget() {
    let (store, db) = open(IdlKind::Old);
    let tuning = IdlTuning {
        maxids: 4,
        maxindirect: 3,
        allidslimit: 12,
    };
    let key = b"=busy\0";

    let mut promoted = false;
    in_txn(&store, |txn| {
        for id in 1..=50u32 {
            let disposition = IdlKind::Old
                .insert_key(txn, db, key, EntryId(id), &tuning, 51)
                .unwrap();
            if disposition == InsertDisposition::NowAllIds {
                promoted = true;
            }
        }
    });
    assert!(promoted);
    let fetched = in_txn(&store, |txn| IdlKind::Old.fetch(txn, db, key, 51).unwrap().unwrap());
    assert!(fetched.is_allids());
}

#[test]
fn new_codec_promotes_past_allidslimit() {
    let (store, db) = open(IdlKind::New);
    let tuning = IdlTuning {
        maxids: 4,
        maxindirect: 3,
        allidslimit: 12,
    };
    let key = b"=busy\0";

    in_txn(&store, |txn| {
        for id in 1..=20u32 {
            IdlKind::New
                .insert_key(txn, db, key, EntryId(id), &tuning, 21)
                .unwrap();
        }
    });
    let fetched = in_txn(&store, |txn| IdlKind::New.fetch(txn, db, key, 21).unwrap().unwrap());
    assert!(fetched.is_allids());
    assert_eq!(fetched.first_id(), Some(EntryId(1)));
    assert_eq!(fetched.next_id_after(EntryId(1)), Some(EntryId(2)));
}

fn codec_store_block(kind: IdlKind) {
    let (store, db) = open(kind);
    let tuning = IdlTuning {
        maxids: 4,
        maxindirect: 10,
        allidslimit: 40,
    };

    let wanted: Vec<u32> = (1..=17).collect();
    let idl = ids(&wanted);
    in_txn(&store, |txn| {
        kind.store_block(txn, db, b"=bulk\0", &idl, &tuning, 100).unwrap();
    });
    let fetched = in_txn(&store, |txn| kind.fetch(txn, db, b"=bulk\0", 100).unwrap().unwrap());
    assert_eq!(raw(&fetched), wanted);

    // Oversized blocks land as AllIds.
    let oversized: Vec<u32> = (1..=41).collect();
    in_txn(&store, |txn| {
        kind.store_block(txn, db, b"=big\0", &ids(&oversized), &tuning, 100).unwrap();
    });
    assert!(in_txn(&store, |txn| kind.fetch(txn, db, b"=big\0", 100).unwrap().unwrap()).is_allids());
}

#[test]
fn old_codec_store_block() {
    codec_store_block(IdlKind::Old);
}

#[test]
fn new_codec_store_block() {
    codec_store_block(IdlKind::New);
}

// ---- k-way set engine ----

#[test]
fn kway_union_merges_without_intermediates() {
    let mut set = IdListSet::new();
    set.insert(ids(&[1, 4, 7]));
    set.insert(ids(&[2, 4, 5]));
    set.insert(ids(&[3]));
    assert_eq!(raw(&set.union(100)), vec![1, 2, 3, 4, 5, 7]);
}

#[test]
fn kway_union_allids_short_circuits() {
    let mut set = IdListSet::new();
    set.insert(ids(&[1, 2]));
    set.insert(IdList::allids(50));
    assert!(set.union(50).is_allids());
}

#[test]
fn kway_intersect_small_list_requests_filter_test() {
    let mut set = IdListSet::new();
    set.insert(ids(&(1..=40).collect::<Vec<u32>>()));
    set.insert(ids(&[2, 4, 99]));
    let (result, dont_bypass) = set.intersect(100);
    // Below the threshold the smallest list comes back as-is.
    assert_eq!(raw(&result), vec![2, 4, 99]);
    assert!(dont_bypass);
}

#[test]
fn kway_intersect_full_merge() {
    let big_a: Vec<u32> = (1..=40).collect();
    let big_b: Vec<u32> = (1..=40).filter(|x| x % 2 == 0).collect();
    let big_c: Vec<u32> = (1..=40).filter(|x| x % 3 == 0).collect();
    let mut set = IdListSet::new();
    set.insert(ids(&big_a));
    set.insert(ids(&big_b));
    set.insert(ids(&big_c));
    let (result, dont_bypass) = set.intersect(100);
    assert_eq!(raw(&result), vec![6, 12, 18, 24, 30, 36]);
    assert!(!dont_bypass);
}

#[test]
fn kway_intersect_allids_only() {
    let mut set = IdListSet::new();
    set.insert(IdList::allids(5));
    let (result, dont_bypass) = set.intersect(5);
    assert!(result.is_allids());
    assert!(dont_bypass);
}

#[test]
fn kway_intersect_applies_complements() {
    let a: Vec<u32> = (1..=30).collect();
    let b: Vec<u32> = (1..=30).collect();
    let mut set = IdListSet::new();
    set.insert(ids(&a));
    set.insert(ids(&b));
    set.insert_complement(ids(&(1..=10).collect::<Vec<u32>>()));
    let (result, _) = set.intersect(100);
    assert_eq!(raw(&result), (11..=30).collect::<Vec<u32>>());
}

#[test]
fn kway_intersect_complement_allids_empties() {
    let mut set = IdListSet::new();
    set.insert(ids(&(1..=30).collect::<Vec<u32>>()));
    set.insert_complement(IdList::allids(100));
    let (result, _) = set.intersect(100);
    assert!(result.is_empty());
}
