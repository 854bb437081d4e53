use std::sync::Arc;

use super::*;
use crate::config::{IndexConfig, InstanceConfig};
use crate::crypt::AesGcmCrypt;
use crate::entry::Dn;
use crate::id::EntryId;

fn test_config() -> InstanceConfig {
    InstanceConfig {
        suffix: "o=x".into(),
        index: vec![
            IndexConfig {
                attr: "cn".into(),
                kinds: vec!["pres".into(), "eq".into()],
                ..IndexConfig::default()
            },
            IndexConfig {
                attr: "sn".into(),
                kinds: vec!["eq".into(), "approx".into()],
                ..IndexConfig::default()
            },
            IndexConfig {
                attr: "description".into(),
                kinds: vec!["sub".into()],
                ..IndexConfig::default()
            },
            IndexConfig {
                attr: "telephonenumber".into(),
                kinds: vec!["eq".into()],
                attrcrypt: Some("aes-256-gcm".into()),
                ..IndexConfig::default()
            },
        ],
        ..InstanceConfig::default()
    }
}

fn test_instance() -> Instance {
    let instance = Instance::in_memory(test_config()).unwrap();
    instance
        .install_attrcrypt("telephonenumber", Arc::new(AesGcmCrypt::new(&[9u8; 32])))
        .unwrap();
    instance
}

fn entry(id: u32, dn: &str, attrs: &[(&str, &[&str])]) -> Entry {
    let mut e = Entry::new(Dn::parse(dn).unwrap());
    for (name, values) in attrs {
        let values: Vec<Vec<u8>> = values.iter().map(|v| v.as_bytes().to_vec()).collect();
        e.add_values(name, &values).unwrap();
    }
    e.set_bookkeeping(EntryId(id), None);
    e
}

fn ids_of(idl: &IdList) -> Vec<u32> {
    idl.ids()
        .map(|s| s.iter().map(|id| id.0).collect())
        .unwrap_or_default()
}

#[test]
fn add_entry_then_read_equality() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let e = entry(1, "cn=alice,o=x", &[("cn", &["Alice"]), ("sn", &["Smith"])]);

    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "cn", IndexKind::Equality, b"alice")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);

    // Values are case-folded into the key.
    let idl = instance
        .index_read(&txn, &ctx, "cn", IndexKind::Equality, b"ALICE")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);

    let idl = instance
        .index_read(&txn, &ctx, "cn", IndexKind::Presence, b"")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);

    // Approximate lookup matches phonetically.
    let idl = instance
        .index_read(&txn, &ctx, "sn", IndexKind::Approx, b"Smyth")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);
    txn.abort();
    assert!(!ctx.dont_bypass_filter_test());
}

#[test]
fn delete_entry_removes_keys() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let e = entry(1, "cn=alice,o=x", &[("cn", &["alice"])]);

    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    instance.index_addordel_entry(&txn, &e, IndexOp::Del).unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "cn", IndexKind::Equality, b"alice")
        .unwrap();
    assert!(idl.is_empty());
    txn.abort();
}

#[test]
fn unindexed_attribute_reads_allids() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "unindexedattr", IndexKind::Equality, b"x")
        .unwrap();
    assert!(idl.is_allids());
    assert!(ctx.dont_bypass_filter_test());
    txn.abort();
}

#[test]
fn offline_attribute_acts_unindexed() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let ai = instance.attrinfo().get("cn").unwrap();
    ai.set_offline(true);

    let e = entry(1, "cn=alice,o=x", &[("cn", &["alice"])]);
    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "cn", IndexKind::Equality, b"alice")
        .unwrap();
    assert!(idl.is_allids());
    assert!(ctx.dont_bypass_filter_test());
    txn.abort();

    // Back online: the write above was skipped entirely.
    ai.set_offline(false);
    let ctx = OpContext::new();
    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "cn", IndexKind::Equality, b"alice")
        .unwrap();
    assert!(idl.is_empty());
    txn.abort();
}

#[test]
fn substring_grams_are_readable() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let e = entry(
        1,
        "cn=a,o=x",
        &[("description", &["hello world"]), ("cn", &["a"])],
    );

    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "description", IndexKind::Substring, b"ell")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);
    let idl = instance
        .index_read(&txn, &ctx, "description", IndexKind::Substring, b"^he")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);
    let idl = instance
        .index_read(&txn, &ctx, "description", IndexKind::Substring, b"zzz")
        .unwrap();
    assert!(idl.is_empty());
    txn.abort();
}

#[test]
fn range_read_unions_keys_in_order() {
    let instance = test_instance();
    let ctx = OpContext::new();

    let txn = instance.store().begin(None).unwrap();
    for (id, name) in [(1u32, "alice"), (2, "bob"), (3, "carol"), (4, "dave")] {
        let e = entry(id, &format!("cn={name},o=x"), &[("cn", &[name])]);
        instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    }
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    // cn >= bob
    let idl = instance
        .index_range_read(&txn, &ctx, "cn", Some(b"bob"), true, None, true)
        .unwrap();
    assert_eq!(ids_of(&idl), vec![2, 3, 4]);

    // bob < cn <= dave
    let idl = instance
        .index_range_read(&txn, &ctx, "cn", Some(b"bob"), false, Some(b"dave"), true)
        .unwrap();
    assert_eq!(ids_of(&idl), vec![3, 4]);
    txn.abort();
}

#[test]
fn range_read_honors_lookthrough_limit() {
    let mut config = test_config();
    config.lookthroughlimit = 2;
    let instance = Instance::in_memory(config).unwrap();
    let ctx = OpContext::new();

    let txn = instance.store().begin(None).unwrap();
    for (id, name) in [(1u32, "alice"), (2, "bob"), (3, "carol")] {
        let e = entry(id, &format!("cn={name},o=x"), &[("cn", &[name])]);
        instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    }
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let out = instance.index_range_read(&txn, &ctx, "cn", None, true, None, true);
    assert!(matches!(out, Err(Error::AdminLimitExceeded)));
    txn.abort();
}

#[test]
fn delta_keeps_value_surviving_under_subtype() {
    let instance = test_instance();
    let ctx = OpContext::new();

    let mut old = entry(1, "cn=a,o=x", &[("cn", &["a"])]);
    old.add_values("sn", &[b"smith".to_vec()]).unwrap();
    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &old, IndexOp::Add).unwrap();
    txn.commit().unwrap();

    // The plain sn value is deleted but the same value appears under a
    // subtype; the equality key must survive.
    let mut new = old.clone();
    new.delete_values("sn", &[b"smith".to_vec()]).unwrap();
    new.add_values("sn;lang-en", &[b"smith".to_vec()]).unwrap();

    let txn = instance.store().begin(None).unwrap();
    instance
        .index_entry_delta(&txn, &old, &new, &["sn".into(), "sn;lang-en".into()])
        .unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "sn", IndexKind::Equality, b"smith")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);
    txn.abort();

    // Now the value goes away entirely.
    let mut gone = new.clone();
    gone.delete_values("sn;lang-en", &[b"smith".to_vec()]).unwrap();
    let txn = instance.store().begin(None).unwrap();
    instance
        .index_entry_delta(&txn, &new, &gone, &["sn;lang-en".into()])
        .unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "sn", IndexKind::Equality, b"smith")
        .unwrap();
    assert!(idl.is_empty());
    txn.abort();
}

#[test]
fn encrypted_attribute_keys_are_opaque_but_searchable() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let e = entry(
        1,
        "cn=a,o=x",
        &[("cn", &["a"]), ("telephonenumber", &["555-0100"])],
    );

    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &e, IndexOp::Add).unwrap();
    txn.commit().unwrap();

    // Equality search still works through deterministic key encryption.
    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "telephonenumber", IndexKind::Equality, b"555-0100")
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);

    // The raw plaintext never appears as a key.
    let db = instance.index_db("telephonenumber").unwrap();
    let plain = keys::eq_key(b"555-0100");
    assert!(txn.get(db, &plain).is_err());
    txn.abort();
}

#[test]
fn tombstones_index_only_the_minimal_triple() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let mut e = entry(1, "cn=a,o=x", &[("cn", &["a"]), ("sn", &["smith"])]);
    e.set_bookkeeping(EntryId(1), Some(EntryId(7)));
    let stone = e.to_tombstone(None);

    let txn = instance.store().begin(None).unwrap();
    instance.index_addordel_entry(&txn, &stone, IndexOp::Add).unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "sn", IndexKind::Equality, b"smith")
        .unwrap();
    assert!(idl.is_empty());
    let idl = instance
        .index_read(
            &txn,
            &ctx,
            "objectclass",
            IndexKind::Equality,
            b"nstombstone",
        )
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);
    let idl = instance
        .index_read(
            &txn,
            &ctx,
            "nsuniqueid",
            IndexKind::Equality,
            stone.unique_id().as_bytes(),
        )
        .unwrap();
    assert_eq!(ids_of(&idl), vec![1]);
    txn.abort();
}

#[test]
fn import_buffer_flushes_batched_unions() {
    let instance = test_instance();
    let ctx = OpContext::new();
    let mut buf = buffer::IndexBuffer::new("description", 0);

    let txn = instance.store().begin(None).unwrap();
    for id in 1..=20u32 {
        let e = entry(
            id,
            &format!("cn=e{id},o=x"),
            &[("description", &["shared text"]), ("cn", &["x"])],
        );
        buf.collect_entry(&instance, &e).unwrap();
    }
    buf.flush(&instance, &txn).unwrap();
    txn.commit().unwrap();

    let txn = instance.store().begin(None).unwrap();
    let idl = instance
        .index_read(&txn, &ctx, "description", IndexKind::Substring, b"sha")
        .unwrap();
    assert_eq!(ids_of(&idl), (1..=20).collect::<Vec<u32>>());
    txn.abort();
}
