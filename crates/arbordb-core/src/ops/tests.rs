use super::seq::SeqType;
use super::*;
use crate::config::{IndexConfig, InstanceConfig};
use crate::entry::ModOp;
use crate::index::IndexKind;

fn config(subtree_rename: bool) -> InstanceConfig {
    InstanceConfig {
        suffix: "o=x".into(),
        subtree_rename,
        index: vec![
            IndexConfig {
                attr: "cn".into(),
                kinds: vec!["pres".into(), "eq".into()],
                ..IndexConfig::default()
            },
            IndexConfig {
                attr: "sn".into(),
                kinds: vec!["eq".into()],
                ..IndexConfig::default()
            },
            IndexConfig {
                attr: "description".into(),
                kinds: vec!["sub".into()],
                ..IndexConfig::default()
            },
        ],
        ..InstanceConfig::default()
    }
}

fn instance() -> Instance {
    let instance = Instance::in_memory(config(true)).unwrap();
    let ctx = OpContext::new();
    let mut root = Entry::new(Dn::parse("o=x").unwrap());
    root.add_values("objectclass", &[b"organization".to_vec()])
        .unwrap();
    instance.add(&ctx, root).unwrap();
    instance
}

fn person(dn: &str, cn: &str) -> Entry {
    let mut e = Entry::new(Dn::parse(dn).unwrap());
    e.add_values("objectclass", &[b"person".to_vec()]).unwrap();
    e.add_values("cn", &[cn.as_bytes().to_vec()]).unwrap();
    e
}

fn eq_ids(instance: &Instance, attr: &str, value: &[u8]) -> Vec<u32> {
    let ctx = OpContext::new();
    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, attr, IndexKind::Equality, value)
        .unwrap();
    txn.abort();
    idl.ids()
        .map(|s| s.iter().map(|id| id.0).collect())
        .unwrap_or_default()
}

#[test]
fn add_assigns_ids_and_indexes() {
    let instance = instance();
    let ctx = OpContext::new();
    let id = instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();
    assert_eq!(id, EntryId(2));

    assert_eq!(eq_ids(&instance, "cn", b"a"), vec![2]);

    // Parent bookkeeping moved.
    let txn = instance.store().begin(None).unwrap();
    let root = instance.dn2entry(&txn, &Dn::parse("o=x").unwrap()).unwrap().unwrap();
    txn.abort();
    assert_eq!(root.first_value_str("numsubordinates"), Some("1"));

    // Double add of the same DN is refused.
    let again = instance.add(&ctx, person("cn=a,o=x", "a"));
    assert!(matches!(again, Err(Error::AlreadyExists(_))));

    // Adding under a missing parent is refused.
    let orphan = instance.add(&ctx, person("cn=b,ou=void,o=x", "b"));
    assert!(matches!(orphan, Err(Error::NoSuchObject(_))));
}

#[test]
fn search_finds_by_filter() {
    let instance = instance();
    let ctx = OpContext::new();
    instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();
    instance.add(&ctx, person("cn=b,o=x", "b")).unwrap();

    let mut seen = Vec::new();
    let base = Dn::parse("o=x").unwrap();
    let count = instance
        .search(&ctx, &base, Scope::Subtree, &Filter::eq("cn", b"a"), |e| {
            seen.push(e.dn().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(seen, vec!["cn=a,o=x"]);

    // One-level scope from the root sees both children.
    let count = instance
        .search(&ctx, &base, Scope::One, &Filter::pres("cn"), |_| Ok(()))
        .unwrap();
    assert_eq!(count, 2);

    // Unknown base errors.
    let missing = Dn::parse("o=missing").unwrap();
    assert!(matches!(
        instance.search(&ctx, &missing, Scope::Base, &Filter::pres("cn"), |_| Ok(())),
        Err(Error::NoSuchObject(_))
    ));
}

#[test]
fn modify_updates_indexes_per_law() {
    let instance = instance();
    let ctx = OpContext::new();
    let dn = Dn::parse("cn=a,o=x").unwrap();
    let mut e = person("cn=a,o=x", "a");
    e.add_values("sn", &[b"one".to_vec()]).unwrap();
    let id = instance.add(&ctx, e).unwrap();

    instance
        .modify(
            &ctx,
            &dn,
            &[Mod::new(ModOp::Replace, "sn", vec![b"two".to_vec()])],
        )
        .unwrap();
    assert!(eq_ids(&instance, "sn", b"one").is_empty());
    assert_eq!(eq_ids(&instance, "sn", b"two"), vec![id.0]);

    // The cache serves the post image.
    let txn = instance.store().begin(None).unwrap();
    let entry = instance.dn2entry(&txn, &dn).unwrap().unwrap();
    txn.abort();
    assert!(entry.has_value("sn", b"two"));

    // Modifying a missing entry errors.
    let missing = Dn::parse("cn=void,o=x").unwrap();
    assert!(matches!(
        instance.modify(&ctx, &missing, &[]),
        Err(Error::NoSuchObject(_))
    ));
}

#[test]
fn delete_removes_everything() {
    let instance = instance();
    let ctx = OpContext::new();
    let dn = Dn::parse("cn=a,o=x").unwrap();
    let id = instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();

    instance.delete(&ctx, &dn).unwrap();
    assert!(eq_ids(&instance, "cn", b"a").is_empty());

    let txn = instance.store().begin(None).unwrap();
    assert!(instance.dn2entry(&txn, &dn).unwrap().is_none());
    assert!(matches!(
        instance.entry_fetch(&txn, id),
        Err(Error::NoSuchObject(_))
    ));
    let root = instance.dn2entry(&txn, &Dn::parse("o=x").unwrap()).unwrap().unwrap();
    assert!(root.first_value_str("numsubordinates").is_none());
    txn.abort();
}

#[test]
fn delete_refuses_nonleaf() {
    let instance = instance();
    let ctx = OpContext::new();
    instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();
    instance.add(&ctx, person("cn=b,cn=a,o=x", "b")).unwrap();

    let parent = Dn::parse("cn=a,o=x").unwrap();
    assert!(matches!(
        instance.delete(&ctx, &parent),
        Err(Error::NotAllowedOnNonleaf(_))
    ));
}

#[test]
fn replicated_delete_tombstones_and_resurrects() {
    let instance = instance();
    let plain = OpContext::new();
    let dn = Dn::parse("cn=a,o=x").unwrap();
    let id = instance.add(&plain, person("cn=a,o=x", "a")).unwrap();

    let uid = {
        let txn = instance.store().begin(None).unwrap();
        let entry = instance.dn2entry(&txn, &dn).unwrap().unwrap();
        txn.abort();
        entry.unique_id().to_string()
    };

    // A delete with the tombstone flag leaves a tombstone behind.
    let replicated = OpContext::new()
        .with_csn(Csn("5f000001".into()))
        .with_tombstone();
    instance.delete(&replicated, &dn).unwrap();

    assert!(eq_ids(&instance, "cn", b"a").is_empty());
    let stone_ids = eq_ids(&instance, "objectclass", b"nstombstone");
    assert_eq!(stone_ids, vec![id.0]);

    let txn = instance.store().begin(None).unwrap();
    let stone = instance.uniqueid2entry(&txn, &uid).unwrap().unwrap();
    txn.abort();
    assert!(stone.is_tombstone());
    assert_eq!(stone.dn().as_str(), format!("nsuniqueid={uid},cn=a,o=x"));

    // An add with the same unique ID resurrects in place.
    let mut revived = person("cn=a,o=x", "a");
    revived.set_unique_id(uid.clone());
    let back = instance.add(&replicated, revived).unwrap();
    assert_eq!(back, id);

    assert_eq!(eq_ids(&instance, "cn", b"a"), vec![id.0]);
    assert!(eq_ids(&instance, "objectclass", b"nstombstone").is_empty());
    let txn = instance.store().begin(None).unwrap();
    let entry = instance.dn2entry(&txn, &dn).unwrap().unwrap();
    txn.abort();
    assert!(entry.has_objectclass("glue"));
}

#[test]
fn csn_alone_does_not_tombstone() {
    let instance = instance();
    let ctx = OpContext::new();
    let dn = Dn::parse("cn=a,o=x").unwrap();
    let id = instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();

    // A CSN without the tombstone flag still removes the row outright.
    let stamped = OpContext::new().with_csn(Csn("5f000001".into()));
    instance.delete(&stamped, &dn).unwrap();

    let txn = instance.store().begin(None).unwrap();
    assert!(matches!(
        instance.entry_fetch(&txn, id),
        Err(Error::NoSuchObject(_))
    ));
    txn.abort();
    assert!(eq_ids(&instance, "objectclass", b"nstombstone").is_empty());
}

#[test]
fn tombstone_reap_is_physical() {
    let instance = instance();
    let plain = OpContext::new();
    let dn = Dn::parse("cn=a,o=x").unwrap();
    let id = instance.add(&plain, person("cn=a,o=x", "a")).unwrap();

    let replicated = OpContext::new()
        .with_csn(Csn("5f000001".into()))
        .with_tombstone();
    instance.delete(&replicated, &dn).unwrap();

    let txn = instance.store().begin(None).unwrap();
    let stone = instance.entry_fetch(&txn, id).unwrap();
    txn.abort();
    let stone_dn = stone.dn().clone();

    // Deleting the tombstone itself removes the row.
    instance.delete(&plain, &stone_dn).unwrap();
    let txn = instance.store().begin(None).unwrap();
    assert!(matches!(
        instance.entry_fetch(&txn, id),
        Err(Error::NoSuchObject(_))
    ));
    txn.abort();
    assert!(eq_ids(&instance, "objectclass", b"nstombstone").is_empty());
}

#[test]
fn modrdn_renames_and_reindexes() {
    let instance = instance();
    let ctx = OpContext::new();
    let dn = Dn::parse("cn=a,o=x").unwrap();
    let id = instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();

    instance.modrdn(&ctx, &dn, "cn=c", true, None).unwrap();

    assert!(eq_ids(&instance, "cn", b"a").is_empty());
    assert_eq!(eq_ids(&instance, "cn", b"c"), vec![id.0]);

    let txn = instance.store().begin(None).unwrap();
    assert!(instance.dn2entry(&txn, &dn).unwrap().is_none());
    let entry = instance
        .dn2entry(&txn, &Dn::parse("cn=c,o=x").unwrap())
        .unwrap()
        .unwrap();
    txn.abort();
    assert_eq!(entry.id(), id);
    assert_eq!(entry.dn().as_str(), "cn=c,o=x");
    assert!(entry.has_value("cn", b"c"));
    assert!(!entry.has_value("cn", b"a"));
}

#[test]
fn modrdn_refuses_occupied_target() {
    let instance = instance();
    let ctx = OpContext::new();
    instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();
    instance.add(&ctx, person("cn=b,o=x", "b")).unwrap();

    let dn = Dn::parse("cn=a,o=x").unwrap();
    assert!(matches!(
        instance.modrdn(&ctx, &dn, "cn=b", true, None),
        Err(Error::AlreadyExists(_))
    ));
}

fn subtree_move_scenario(subtree_rename: bool) {
    let instance = Instance::in_memory(config(subtree_rename)).unwrap();
    let ctx = OpContext::new();
    let mut root = Entry::new(Dn::parse("o=x").unwrap());
    root.add_values("objectclass", &[b"organization".to_vec()])
        .unwrap();
    instance.add(&ctx, root).unwrap();

    instance.add(&ctx, person("ou=east,o=x", "east")).unwrap();
    instance.add(&ctx, person("ou=west,o=x", "west")).unwrap();
    let apex = instance.add(&ctx, person("cn=team,ou=east,o=x", "team")).unwrap();
    let leaf = instance
        .add(&ctx, person("cn=dev,cn=team,ou=east,o=x", "dev"))
        .unwrap();

    // Move the team subtree from east to west.
    let dn = Dn::parse("cn=team,ou=east,o=x").unwrap();
    let west = Dn::parse("ou=west,o=x").unwrap();
    instance.modrdn(&ctx, &dn, "cn=team", false, Some(&west)).unwrap();

    let txn = instance.store().begin(None).unwrap();

    // The whole subtree resolves under the new superior.
    let moved = instance
        .dn2entry(&txn, &Dn::parse("cn=team,ou=west,o=x").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(moved.id(), apex);
    let moved_leaf = instance
        .dn2entry(&txn, &Dn::parse("cn=dev,cn=team,ou=west,o=x").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(moved_leaf.id(), leaf);
    assert!(instance.dn2entry(&txn, &dn).unwrap().is_none());

    // ancestorid followed the move: east lost the pair, west gained it.
    let east_id = instance
        .dn2id(&txn, &Dn::parse("ou=east,o=x").unwrap())
        .unwrap()
        .unwrap();
    let west_id = instance.dn2id(&txn, &west).unwrap().unwrap();
    let east_desc = instance.ancestorid_read(&txn, east_id).unwrap();
    let west_desc = instance.ancestorid_read(&txn, west_id).unwrap();
    assert!(east_desc.is_empty());
    assert!(west_desc.contains(apex));
    assert!(west_desc.contains(leaf));

    // Parent counters moved with it.
    let east = instance.entry_fetch(&txn, east_id).unwrap();
    let west_entry = instance.entry_fetch(&txn, west_id).unwrap();
    assert!(east.first_value_str("numsubordinates").is_none());
    assert_eq!(west_entry.first_value_str("numsubordinates"), Some("1"));
    txn.abort();
}

#[test]
fn subtree_move_with_entryrdn_tree() {
    subtree_move_scenario(true);
}

#[test]
fn subtree_move_with_flat_entrydn() {
    subtree_move_scenario(false);
}

#[test]
fn seq_walks_equality_keys() {
    let instance = instance();
    let ctx = OpContext::new();
    for name in ["alice", "bob", "carol"] {
        instance
            .add(&ctx, person(&format!("cn={name},o=x"), name))
            .unwrap();
    }

    let mut first = Vec::new();
    instance
        .seq(&ctx, "cn", SeqType::First, Some(b"b"), |e| {
            first.push(e.dn().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(first, vec!["cn=bob,o=x"]);

    let mut next = Vec::new();
    instance
        .seq(&ctx, "cn", SeqType::Next, Some(b"bob"), |e| {
            next.push(e.dn().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(next, vec!["cn=carol,o=x"]);

    let mut prev = Vec::new();
    instance
        .seq(&ctx, "cn", SeqType::Prev, Some(b"bob"), |e| {
            prev.push(e.dn().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(prev, vec!["cn=alice,o=x"]);

    let mut last = Vec::new();
    instance
        .seq(&ctx, "cn", SeqType::Last, None, |e| {
            last.push(e.dn().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(last, vec!["cn=carol,o=x"]);

    // Unindexed attributes refuse seq access.
    assert!(matches!(
        instance.seq(&ctx, "description", SeqType::First, None, |_| Ok(())),
        Err(Error::UnwillingToPerform(_))
    ));
}

#[test]
fn ruv_piggybacks_on_writes() {
    let instance = instance();
    instance.ensure_ruv_entry().unwrap();

    let ctx = OpContext::new().with_csn(Csn("5f00000a".into()));
    instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();

    let txn = instance.store().begin(None).unwrap();
    let ruv = instance
        .uniqueid2entry(&txn, crate::instance::RUV_UNIQUEID)
        .unwrap()
        .unwrap();
    txn.abort();
    assert!(ruv.is_ruv());
    assert_eq!(ruv.first_value_str("nsruvelement"), Some("5f00000a"));

    // An older CSN does not move the vector backwards.
    let older = OpContext::new().with_csn(Csn("5e000001".into()));
    instance.add(&older, person("cn=b,o=x", "b")).unwrap();
    let txn = instance.store().begin(None).unwrap();
    let ruv = instance
        .uniqueid2entry(&txn, crate::instance::RUV_UNIQUEID)
        .unwrap()
        .unwrap();
    txn.abort();
    assert_eq!(ruv.first_value_str("nsruvelement"), Some("5f00000a"));

    // The RUV entry never surfaces in searches.
    let found = instance
        .search(
            &OpContext::new(),
            &Dn::parse("o=x").unwrap(),
            Scope::Subtree,
            &Filter::pres("nsuniqueid"),
            |_| Ok(()),
        )
        .unwrap();
    assert_eq!(found, 3); // root, a, b
}

#[test]
fn fences_refuse_writes() {
    let instance = instance();
    let ctx = OpContext::new();

    instance.set_read_only(true);
    assert!(matches!(
        instance.add(&ctx, person("cn=a,o=x", "a")),
        Err(Error::UnwillingToPerform(_))
    ));
    instance.set_read_only(false);

    assert!(instance.set_busy());
    assert!(matches!(
        instance.add(&ctx, person("cn=a,o=x", "a")),
        Err(Error::UnwillingToPerform(_))
    ));
    instance.clear_busy();

    instance.add(&ctx, person("cn=a,o=x", "a")).unwrap();
}

#[test]
fn bind_and_compare() {
    let instance = instance();
    let ctx = OpContext::new();
    let mut e = person("cn=a,o=x", "a");
    e.add_values("userpassword", &[b"{SSHA}sealed".to_vec()])
        .unwrap();
    instance.add(&ctx, e).unwrap();

    let dn = Dn::parse("cn=a,o=x").unwrap();
    let creds = instance.bind(&ctx, &dn).unwrap();
    assert_eq!(creds, vec![b"{SSHA}sealed".to_vec()]);

    assert!(instance.compare(&ctx, &dn, "cn", b"A").unwrap());
    assert!(!instance.compare(&ctx, &dn, "cn", b"z").unwrap());
    assert!(matches!(
        instance.bind(&ctx, &Dn::parse("cn=ghost,o=x").unwrap()),
        Err(Error::NoSuchObject(_))
    ));
    instance.unbind();
}

#[test]
fn abandoned_search_stops() {
    let instance = instance();
    let ctx = OpContext::new();
    for i in 0..30 {
        instance
            .add(&ctx, person(&format!("cn=p{i},o=x"), &format!("p{i}")))
            .unwrap();
    }

    let abandoned = OpContext::new();
    instance.abandon(&abandoned);
    let out = instance.search(
        &abandoned,
        &Dn::parse("o=x").unwrap(),
        Scope::Subtree,
        &Filter::pres("cn"),
        |_| Ok(()),
    );
    assert!(matches!(out, Err(Error::Abandoned)));
}
