//! End-to-end scenarios against the full transactional write stack
//! (KV engine, entry cache, write orchestrator), exercising concurrent
//! writers, the deadlock retry path, and read-after-write visibility
//! together rather than each in isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dirstore_cache::EntryCache;
use dirstore_concurrency::{FaultPoint, OpContext, WriteOrchestrator};
use dirstore_core::{AttributeValues, BackendConfig, Dn, Entry, EntryId, PlaintextVerifier, Rdn};
use dirstore_concurrency::{NoopAccessCheck, NoopSchemaCheck};
use dirstore_durability::{ModOp, ModSpec};
use dirstore_storage::KvEngine;

fn orchestrator() -> WriteOrchestrator {
    let engine = Arc::new(KvEngine::new(Duration::from_millis(500)));
    let cache = Arc::new(EntryCache::new(1_000));
    let suffix = Dn::parse("dc=example,dc=com").unwrap();
    let config = BackendConfig::builder("/tmp/dirstore-integration-test").build();
    WriteOrchestrator::new(
        engine,
        cache,
        None,
        suffix,
        &config,
        Arc::new(NoopSchemaCheck),
        Arc::new(NoopAccessCheck),
        Arc::new(PlaintextVerifier),
    )
}

fn person(dn: &str, cn: &str) -> Entry {
    let mut e = Entry::new(EntryId(0), Dn::parse(dn).unwrap());
    e.set_attr("objectClass", AttributeValues::single("person"));
    e.set_attr("cn", AttributeValues::single(cn));
    e
}

#[test]
fn concurrent_adds_under_the_same_parent_all_succeed_with_distinct_ids() {
    let orch = Arc::new(orchestrator());
    let ctx = OpContext::new();
    orch.add(person("dc=example,dc=com", "root"), &ctx).unwrap();
    orch.add(person("ou=people,dc=example,dc=com", "people"), &ctx).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let orch = orch.clone();
            thread::spawn(move || {
                let ctx = OpContext::new();
                let dn = format!("cn=user{i},ou=people,dc=example,dc=com");
                orch.add(person(&dn, &format!("user{i}")), &ctx).unwrap()
            })
        })
        .collect();

    let ids: Vec<EntryId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let distinct: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(distinct.len(), ids.len());
}

#[test]
fn a_forced_deadlock_is_retried_and_the_write_still_lands() {
    let orch = orchestrator();
    let ctx = OpContext::new();
    orch.add(person("dc=example,dc=com", "root"), &ctx).unwrap();

    orch.inject_fault(FaultPoint::Dn2IdAdd);
    let before = orch.retry_total();
    orch.add(person("cn=alice,dc=example,dc=com", "alice"), &ctx).unwrap();
    assert!(orch.retry_total() > before);

    let dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
    assert!(orch.get_by_dn(&dn).is_ok());
}

#[test]
fn modify_then_modrdn_then_delete_leaves_the_tree_consistent() {
    let orch = orchestrator();
    let ctx = OpContext::new();
    orch.add(person("dc=example,dc=com", "root"), &ctx).unwrap();
    orch.add(person("cn=alice,dc=example,dc=com", "alice"), &ctx).unwrap();

    let alice_dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
    orch.modify(
        &alice_dn,
        vec![ModSpec { op: ModOp::Add, attribute: "mail".into(), values: vec![b"alice@example.com".to_vec()] }],
        &ctx,
    )
    .unwrap();

    orch.modrdn(&alice_dn, Rdn::new("cn", "alicia"), true, None, &ctx).unwrap();
    let alicia_dn = Dn::parse("cn=alicia,dc=example,dc=com").unwrap();
    let fetched = orch.get_by_dn(&alicia_dn).unwrap();
    assert_eq!(fetched.get_attr("mail").unwrap().0[0], b"alice@example.com");
    assert!(orch.get_by_dn(&alice_dn).is_err());

    orch.delete(&alicia_dn, &ctx).unwrap();
    assert!(orch.get_by_dn(&alicia_dn).is_err());
}

#[test]
fn subtree_search_includes_descendants_added_by_concurrent_writers() {
    let orch = Arc::new(orchestrator());
    let ctx = OpContext::new();
    orch.add(person("dc=example,dc=com", "root"), &ctx).unwrap();
    orch.add(person("ou=people,dc=example,dc=com", "people"), &ctx).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..5)
        .map(|i| {
            let orch = orch.clone();
            thread::spawn(move || {
                let ctx = OpContext::new();
                let dn = format!("cn=user{i},ou=people,dc=example,dc=com");
                orch.add(person(&dn, &format!("user{i}")), &ctx).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let base = Dn::parse("dc=example,dc=com").unwrap();
    let results = orch.search(&base, dirstore_core::Scope::Subtree, |_| true).unwrap();
    for entry in &results {
        if entry.get_attr("objectClass").map(|v| v.0[0] == b"person").unwrap_or(false) {
            seen.fetch_add(1, Ordering::Relaxed);
        }
    }
    assert_eq!(seen.load(Ordering::Relaxed), 5);
}
