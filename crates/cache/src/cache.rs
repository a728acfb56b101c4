//! Entry cache: an LRU keyed by ID with a secondary normalized-DN
//! map, reader counts, per-ID locks acquired in DN-depth order, and
//! transaction-aware install/evict tied to commit/abort.
//!
//! The in-memory tree mirroring the DN hierarchy lives here too: each
//! [`Slot`] doubles as a node carrying ID, normalized RDN, parent,
//! children, and an optional loaded `Entry`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use dirstore_core::{Entry, EntryId};
use parking_lot::Mutex;

use crate::lru::Lru;

/// Hit/miss/eviction counters, logged via `tracing` rather than exported
/// through a metrics library (metrics export is out of scope; the
/// counters themselves are ambient diagnostics).
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Snapshot as `(hits, misses, evictions)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }
}

struct Slot {
    id: EntryId,
    normalized_dn: Mutex<String>,
    normalized_rdn: Mutex<String>,
    parent: Mutex<Option<EntryId>>,
    children: Mutex<BTreeSet<EntryId>>,
    depth: Mutex<usize>,
    /// `None` until a full entry is loaded: a "skeleton node" known to the
    /// name index but not yet pulled from the entry store.
    entry: Mutex<Option<Entry>>,
    readers: AtomicUsize,
    /// Per-ID write lock, acquired in DN-depth order by the orchestrator
    /// to avoid deadlock.
    write_lock: Mutex<()>,
    /// False while an add is staged but not yet committed: lookups treat
    /// the slot as absent until [`PendingInstall::confirm`] flips this,
    /// which is what keeps an aborted add's entry from ever becoming
    /// observable.
    visible: AtomicBool,
}

/// In-memory ID/DN-keyed cache of directory entries.
pub struct EntryCache {
    by_id: DashMap<EntryId, Arc<Slot>>,
    by_dn: DashMap<String, EntryId>,
    lru: Lru,
    capacity: usize,
    stats: CacheStats,
}

impl EntryCache {
    /// Create an empty cache bounded at `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        EntryCache {
            by_id: DashMap::new(),
            by_dn: DashMap::new(),
            lru: Lru::default(),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Cache hit/miss/eviction counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Insert (or refresh) a skeleton `EntryInfo` node — known to exist in
    /// the name→ID index but not necessarily loaded from the entry store.
    pub fn skeleton(
        &self,
        id: EntryId,
        normalized_dn: String,
        normalized_rdn: String,
        parent: Option<EntryId>,
        depth: usize,
    ) {
        let slot = self.by_id.entry(id).or_insert_with(|| {
            Arc::new(Slot {
                id,
                normalized_dn: Mutex::new(normalized_dn.clone()),
                normalized_rdn: Mutex::new(normalized_rdn.clone()),
                parent: Mutex::new(parent),
                children: Mutex::new(BTreeSet::new()),
                depth: Mutex::new(depth),
                entry: Mutex::new(None),
                readers: AtomicUsize::new(0),
                write_lock: Mutex::new(()),
                visible: AtomicBool::new(true),
            })
        });
        self.by_dn.insert(normalized_dn, id);
        self.lru.touch(id);
        self.evict_if_over_capacity();
    }

    /// Fill a skeleton node's loaded entry (on demand, from the entry store).
    pub fn fill(&self, id: EntryId, entry: Entry) {
        if let Some(slot) = self.by_id.get(&id) {
            *slot.entry.lock() = Some(entry);
        }
    }

    /// Stage a new entry for installation into the cache before the outer
    /// transaction commits. The returned guard must be `confirm()`-ed
    /// after the outer commit succeeds, or it evicts the entry on drop
    /// (covers abort/`Other` failure at commit).
    pub fn install<'c>(
        &'c self,
        id: EntryId,
        normalized_dn: String,
        normalized_rdn: String,
        parent: Option<EntryId>,
        depth: usize,
        entry: Entry,
    ) -> PendingInstall<'c> {
        let slot = Arc::new(Slot {
            id,
            normalized_dn: Mutex::new(normalized_dn.clone()),
            normalized_rdn: Mutex::new(normalized_rdn),
            parent: Mutex::new(parent),
            children: Mutex::new(BTreeSet::new()),
            depth: Mutex::new(depth),
            entry: Mutex::new(Some(entry)),
            readers: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
            visible: AtomicBool::new(false),
        });
        self.by_id.insert(id, slot);
        // by_dn is only populated on confirm, so concurrent lookups can't
        // observe the pending add by DN either.
        tracing::trace!(id = id.0, "cache install staged");
        PendingInstall { cache: self, id, normalized_dn, confirmed: false }
    }

    fn confirm_install(&self, id: EntryId, normalized_dn: String) {
        if let Some(slot) = self.by_id.get(&id) {
            slot.visible.store(true, Ordering::Release);
        }
        self.by_dn.insert(normalized_dn, id);
        self.lru.touch(id);
        self.evict_if_over_capacity();
        tracing::trace!(id = id.0, "cache install confirmed");
    }

    /// Remove an entry entirely (delete, or undoing a staged install).
    pub fn evict(&self, id: EntryId) {
        if let Some((_, slot)) = self.by_id.remove(&id) {
            let dn = slot.normalized_dn.lock().clone();
            self.by_dn.remove(&dn);
        }
        self.lru.forget(id);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id = id.0, "cache evict");
    }

    /// Rewrite a slot's DN-keyed identity after a modrdn commit: moves the
    /// `by_dn` entry to `new_normalized_dn`, updates the cached RDN/parent/
    /// depth, and refreshes the loaded entry if the caller has one handy.
    /// The ID-keyed slot itself is untouched (an entry's ID never changes
    /// across a rename).
    pub fn rename(
        &self,
        id: EntryId,
        new_normalized_dn: String,
        new_normalized_rdn: String,
        new_parent: Option<EntryId>,
        new_depth: usize,
        entry: Option<Entry>,
    ) {
        let Some(slot) = self.by_id.get(&id).map(|s| s.clone()) else { return };
        let old_dn = std::mem::replace(&mut *slot.normalized_dn.lock(), new_normalized_dn.clone());
        self.by_dn.remove(&old_dn);
        *slot.normalized_rdn.lock() = new_normalized_rdn;
        *slot.parent.lock() = new_parent;
        *slot.depth.lock() = new_depth;
        if let Some(entry) = entry {
            *slot.entry.lock() = Some(entry);
        }
        self.by_dn.insert(new_normalized_dn, id);
        self.lru.touch(id);
        tracing::trace!(id = id.0, "cache rename");
    }

    fn evict_if_over_capacity(&self) {
        while self.by_id.len() > self.capacity {
            match self.lru.oldest() {
                Some(id) => {
                    // Never evict an entry still being read.
                    let in_use = self
                        .by_id
                        .get(&id)
                        .map(|s| s.readers.load(Ordering::Acquire) > 0)
                        .unwrap_or(false);
                    if in_use {
                        break;
                    }
                    self.evict(id);
                }
                None => break,
            }
        }
    }

    /// Look up by ID, incrementing the slot's reader count. The returned
    /// handle must be released by the caller on every exit path, which
    /// `Drop` does automatically.
    pub fn lookup_by_id(&self, id: EntryId) -> Option<CacheHandle<'_>> {
        let slot = self.by_id.get(&id)?.clone();
        if !slot.visible.load(Ordering::Acquire) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        slot.readers.fetch_add(1, Ordering::AcqRel);
        self.lru.touch(id);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheHandle { cache: self, slot })
    }

    /// Look up by normalized DN.
    pub fn lookup_by_dn(&self, normalized_dn: &str) -> Option<CacheHandle<'_>> {
        let id = *self.by_dn.get(normalized_dn)?;
        self.lookup_by_id(id)
    }

    /// Acquire the per-ID write locks for a set of entries, always in
    /// ascending DN-depth order, to bound lock-acquisition ordering, then
    /// run `f` while holding all of them. Locks release automatically when
    /// `f` returns, in reverse acquisition order, since that's the only
    /// way `f` can observe them without a self-referential guard type.
    pub fn with_write_locks<R>(&self, ids: &[EntryId], f: impl FnOnce() -> R) -> R {
        let mut with_depth: Vec<(usize, EntryId)> = ids
            .iter()
            .map(|&id| {
                let depth = self.by_id.get(&id).map(|s| *s.depth.lock()).unwrap_or(0);
                (depth, id)
            })
            .collect();
        with_depth.sort_by_key(|(depth, id)| (*depth, id.0));

        let slots: Vec<Arc<Slot>> = with_depth
            .into_iter()
            .filter_map(|(_, id)| self.by_id.get(&id).map(|s| s.clone()))
            .collect();
        let _guards: Vec<_> = slots.iter().map(|s| s.write_lock.lock()).collect();
        f()
    }
}

/// RAII handle for a staged cache install; see [`EntryCache::install`].
pub struct PendingInstall<'c> {
    cache: &'c EntryCache,
    id: EntryId,
    normalized_dn: String,
    confirmed: bool,
}

impl<'c> PendingInstall<'c> {
    /// Confirm the install, making the entry visible to lookups. Call
    /// only after the outer transaction has committed.
    pub fn confirm(mut self) {
        self.cache.confirm_install(self.id, std::mem::take(&mut self.normalized_dn));
        self.confirmed = true;
    }
}

impl Drop for PendingInstall<'_> {
    fn drop(&mut self) {
        if !self.confirmed {
            self.cache.evict(self.id);
        }
    }
}

/// A read handle into the cache. The reader count is released on drop,
/// covering both success and error exit paths.
pub struct CacheHandle<'c> {
    cache: &'c EntryCache,
    slot: Arc<Slot>,
}

impl CacheHandle<'_> {
    /// The entry's ID.
    pub fn id(&self) -> EntryId {
        self.slot.id
    }

    /// Clone of the loaded entry, if this node isn't a bare skeleton.
    pub fn entry(&self) -> Option<Entry> {
        self.slot.entry.lock().clone()
    }

    /// The entry's parent ID, if not the suffix.
    pub fn parent(&self) -> Option<EntryId> {
        *self.slot.parent.lock()
    }

    /// Child IDs known to this node.
    pub fn children(&self) -> BTreeSet<EntryId> {
        self.slot.children.lock().clone()
    }
}

impl Drop for CacheHandle<'_> {
    fn drop(&mut self) {
        self.slot.readers.fetch_sub(1, Ordering::AcqRel);
        let _ = &self.cache;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::{AttributeValues, Dn};

    fn sample_entry(id: u32) -> Entry {
        let dn = Dn::parse("cn=x,dc=example,dc=com").unwrap();
        let mut e = Entry::new(EntryId(id), dn);
        e.set_attr("cn", AttributeValues::single("x"));
        e
    }

    #[test]
    fn skeleton_then_fill_is_visible_and_loaded() {
        let cache = EntryCache::new(10);
        cache.skeleton(EntryId(1), "cn=x,dc=com".into(), "cn=x".into(), None, 1);
        cache.fill(EntryId(1), sample_entry(1));
        let handle = cache.lookup_by_id(EntryId(1)).unwrap();
        assert!(handle.entry().is_some());
    }

    #[test]
    fn pending_install_is_invisible_until_confirmed() {
        let cache = EntryCache::new(10);
        let pending =
            cache.install(EntryId(2), "cn=y,dc=com".into(), "cn=y".into(), None, 1, sample_entry(2));
        assert!(cache.lookup_by_id(EntryId(2)).is_none());
        assert!(cache.lookup_by_dn("cn=y,dc=com").is_none());
        pending.confirm();
        assert!(cache.lookup_by_id(EntryId(2)).is_some());
        assert!(cache.lookup_by_dn("cn=y,dc=com").is_some());
    }

    #[test]
    fn dropping_unconfirmed_install_evicts() {
        let cache = EntryCache::new(10);
        {
            let _pending = cache.install(
                EntryId(3),
                "cn=z,dc=com".into(),
                "cn=z".into(),
                None,
                1,
                sample_entry(3),
            );
        }
        assert!(cache.lookup_by_id(EntryId(3)).is_none());
    }

    #[test]
    fn eviction_skips_entries_with_active_readers() {
        let cache = EntryCache::new(1);
        cache.skeleton(EntryId(1), "cn=a,dc=com".into(), "cn=a".into(), None, 1);
        cache.fill(EntryId(1), sample_entry(1));
        let handle = cache.lookup_by_id(EntryId(1)).unwrap();

        cache.skeleton(EntryId(2), "cn=b,dc=com".into(), "cn=b".into(), None, 1);

        // id 1 is still held by `handle`, so eviction must have skipped it.
        assert!(cache.by_id.contains_key(&EntryId(1)));
        drop(handle);
    }

    #[test]
    fn with_write_locks_runs_closure_while_holding_all_locks() {
        let cache = EntryCache::new(10);
        cache.skeleton(EntryId(1), "dc=com".into(), "dc=com".into(), None, 1);
        cache.skeleton(EntryId(2), "dc=example,dc=com".into(), "dc=example".into(), Some(EntryId(1)), 2);
        // Request in reverse order; with_write_locks should still acquire
        // shallow-to-deep without deadlocking against itself.
        let ran = cache.with_write_locks(&[EntryId(2), EntryId(1)], || true);
        assert!(ran);
    }

    #[test]
    fn with_write_locks_serializes_concurrent_writers_on_same_entry() {
        let cache = Arc::new(EntryCache::new(10));
        cache.skeleton(EntryId(1), "cn=a,dc=com".into(), "cn=a".into(), None, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let observed_overlap = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let counter = counter.clone();
                let observed_overlap = observed_overlap.clone();
                std::thread::spawn(move || {
                    cache.with_write_locks(&[EntryId(1)], || {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        if before != 0 {
                            observed_overlap.store(true, Ordering::SeqCst);
                        }
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(!observed_overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn rename_moves_dn_mapping_and_keeps_id() {
        let cache = EntryCache::new(10);
        cache.skeleton(EntryId(1), "cn=a,dc=com".into(), "cn=a".into(), None, 1);
        cache.fill(EntryId(1), sample_entry(1));
        cache.rename(EntryId(1), "cn=b,dc=com".into(), "cn=b".into(), None, 1, None);

        assert!(cache.lookup_by_dn("cn=a,dc=com").is_none());
        let handle = cache.lookup_by_dn("cn=b,dc=com").unwrap();
        assert_eq!(handle.id(), EntryId(1));
    }
}
