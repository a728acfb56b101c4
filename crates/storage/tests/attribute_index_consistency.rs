//! Integration-level consistency checks across the name index, the
//! attribute index, and the ID-keyed entry store: the three tables a
//! single write transaction must keep in lockstep.

use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;

use dirstore_core::EntryId;
use dirstore_storage::{AttributeIndex, EntryStore, IdAllocator, KvEngine, NameIndex, Tokenizer};

fn engine() -> KvEngine {
    KvEngine::new(Duration::from_millis(200))
}

#[test]
fn name_index_attribute_index_and_entry_store_agree_after_a_batch_of_adds() {
    let e = engine();
    let alloc = IdAllocator::new(&e);

    let names = ["alice", "alicia", "bob", "bobby", "carol"];
    let mut ids = Vec::new();
    for name in names {
        let id = alloc.next_id().unwrap();
        ids.push(id);

        let mut t = e.begin();
        let dn = format!("cn={name},dc=example,dc=com");
        NameIndex::add(&mut t, &dn, id, None).unwrap();
        AttributeIndex::add_value(&mut t, "cn", Tokenizer::Exact, name, id).unwrap();
        EntryStore::put(&mut t, id, dn.into_bytes()).unwrap();
        t.commit().unwrap();
    }

    for (name, id) in names.iter().zip(&ids) {
        let mut t = e.begin();
        let dn = format!("cn={name},dc=example,dc=com");
        assert_eq!(NameIndex::lookup(&mut t, &dn).unwrap(), Some(*id));
        let hits = AttributeIndex::lookup(&mut t, "cn", name).unwrap();
        assert!(hits.contains(id));
        assert!(EntryStore::get(&mut t, *id).unwrap().is_some());
        t.commit().unwrap();
    }

    let all = EntryStore::scan_all(&e);
    assert_eq!(all.len(), names.len());
}

#[test]
fn deleting_an_entry_removes_it_from_every_index() {
    let e = engine();
    let mut t = e.begin();
    let id = EntryId(1);
    NameIndex::add(&mut t, "cn=alice,dc=example,dc=com", id, None).unwrap();
    AttributeIndex::add_value(&mut t, "cn", Tokenizer::Exact, "alice", id).unwrap();
    EntryStore::put(&mut t, id, b"body".to_vec()).unwrap();
    t.commit().unwrap();

    let mut t = e.begin();
    NameIndex::delete(&mut t, "cn=alice,dc=example,dc=com", id, None).unwrap();
    AttributeIndex::remove_value(&mut t, "cn", Tokenizer::Exact, "alice", id).unwrap();
    EntryStore::delete(&mut t, id).unwrap();
    t.commit().unwrap();

    let mut t = e.begin();
    assert_eq!(NameIndex::lookup(&mut t, "cn=alice,dc=example,dc=com").unwrap(), None);
    assert!(AttributeIndex::lookup(&mut t, "cn", "alice").unwrap().is_empty());
    assert_eq!(EntryStore::get(&mut t, id).unwrap(), None);
    t.commit().unwrap();
}

#[test]
fn renaming_an_entry_updates_name_index_while_attribute_index_is_untouched() {
    let e = engine();
    let id = EntryId(1);
    let mut t = e.begin();
    NameIndex::add(&mut t, "cn=alice,dc=example,dc=com", id, None).unwrap();
    AttributeIndex::add_value(&mut t, "cn", Tokenizer::Exact, "alice", id).unwrap();
    t.commit().unwrap();

    let mut t = e.begin();
    NameIndex::rename(
        &mut t,
        "cn=alice,dc=example,dc=com",
        "cn=alice,ou=people,dc=example,dc=com",
        id,
        None,
        None,
    )
    .unwrap();
    t.commit().unwrap();

    let mut t = e.begin();
    assert_eq!(NameIndex::lookup(&mut t, "cn=alice,dc=example,dc=com").unwrap(), None);
    assert_eq!(
        NameIndex::lookup(&mut t, "cn=alice,ou=people,dc=example,dc=com").unwrap(),
        Some(id)
    );
    // Attribute index keys on the attribute value alone, not the DN, so a
    // rename that doesn't touch `cn` leaves this index entry in place.
    assert!(AttributeIndex::lookup(&mut t, "cn", "alice").unwrap().contains(&id));
    t.commit().unwrap();
}

proptest! {
    #[test]
    fn substring_index_always_finds_values_containing_an_indexed_ngram(
        value in "[a-z]{4,12}",
        id_seed in 1u32..1000,
    ) {
        let e = engine();
        let id = EntryId(id_seed);
        let mut t = e.begin();
        AttributeIndex::add_value(&mut t, "sn", Tokenizer::SubstringNgram { n: 3 }, &value, id).unwrap();
        t.commit().unwrap();

        let mut t = e.begin();
        let probe: String = value.chars().take(3).collect();
        let hits: BTreeSet<EntryId> = AttributeIndex::lookup(&mut t, "sn", &probe).unwrap();
        prop_assert!(hits.contains(&id));
        t.commit().unwrap();
    }
}
