//! Embedded KV transaction substrate: begin/commit/abort, nested
//! subtransactions, locker IDs, a deadlock/not-granted error channel, and
//! checkpointing.
//!
//! Grounded in strata-concurrency's `TransactionManager`/`TransactionContext`
//! shape (atomic counters, a per-key lock table, a `commit` that validates
//! then applies), but the conflict-detection strategy is swapped:
//! optimistic validate-at-commit becomes pessimistic per-key locking with
//! first-class `Deadlock`/`NotGranted` errors. Locks are held for a
//! transaction's lifetime and deadlock is detected by walking a wait-for
//! graph at the moment a locker would block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

/// Opaque identifier for lock ownership, shared by a top-level transaction
/// and all of its nested subtransactions. Also used by the entry cache for
/// reader-lock bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locker(pub u64);

/// Errors from the KV substrate's own error channel, distinct from the
/// client-visible [`dirstore_core::DirError`] taxonomy. Callers
/// translate these with the context only they have (which DN, which
/// attribute) rather than relying on a lossy blanket conversion.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum KvError {
    /// Two lockers formed a cycle in the wait-for graph.
    #[error("deadlock")]
    Deadlock,
    /// A lock could not be granted before `idletimeout` elapsed.
    #[error("lock not granted")]
    NotGranted,
    /// `put_new` found the key already present.
    #[error("key exists")]
    KeyExists,
    /// `get`/`del` found the key absent.
    #[error("not found")]
    NotFound,
    /// Anything else (treated as fatal by callers).
    #[error("kv error: {0}")]
    Other(String),
}

type Key = (String, Vec<u8>);

#[derive(Default)]
struct LockTable {
    holders: Mutex<FxHashMap<Key, Locker>>,
    /// waiter -> locker it is blocked behind, used to detect cycles.
    waits_for: Mutex<FxHashMap<Locker, Locker>>,
    cv: Condvar,
}

impl LockTable {
    fn would_cycle(&self, waiter: Locker, holder: Locker) -> bool {
        let waits_for = self.waits_for.lock();
        let mut current = holder;
        loop {
            if current == waiter {
                return true;
            }
            match waits_for.get(&current) {
                Some(&next) => current = next,
                None => return false,
            }
        }
    }

    fn acquire(&self, locker: Locker, key: Key, timeout: Duration) -> Result<(), KvError> {
        let deadline = Instant::now() + timeout;
        let mut holders = self.holders.lock();
        loop {
            match holders.get(&key) {
                Some(&holder) if holder == locker => return Ok(()),
                None => {
                    holders.insert(key, locker);
                    self.waits_for.lock().remove(&locker);
                    return Ok(());
                }
                Some(&holder) => {
                    if self.would_cycle(locker, holder) {
                        return Err(KvError::Deadlock);
                    }
                    self.waits_for.lock().insert(locker, holder);
                    let now = Instant::now();
                    if now >= deadline {
                        self.waits_for.lock().remove(&locker);
                        return Err(KvError::NotGranted);
                    }
                    let timed_out = self.cv.wait_until(&mut holders, deadline).timed_out();
                    if timed_out {
                        self.waits_for.lock().remove(&locker);
                        return Err(KvError::NotGranted);
                    }
                }
            }
        }
    }

    fn release_all(&self, locker: Locker) {
        let mut holders = self.holders.lock();
        holders.retain(|_, &mut holder| holder != locker);
        drop(holders);
        self.waits_for.lock().retain(|waiter, _| *waiter != locker);
        self.cv.notify_all();
    }
}

/// One staged mutation, kept so a transaction (or nested subtransaction)
/// can undo itself on abort.
enum UndoOp {
    Put { key: Key, prev: Option<Vec<u8>> },
    Delete { key: Key, prev: Vec<u8> },
}

/// The in-process KV engine: a set of named tables (`id2entry`, `dn2id`,
/// `id2children`, one per indexed attribute) plus the lock table that
/// backs transactional isolation.
pub struct KvEngine {
    tables: Mutex<FxHashMap<String, FxHashMap<Vec<u8>, Vec<u8>>>>,
    locks: LockTable,
    next_locker: AtomicU64,
    lock_timeout: Duration,
    checkpoints: AtomicU64,
}

impl KvEngine {
    /// Create an empty engine. `lock_timeout` is the `idletimeout`
    /// configuration value.
    pub fn new(lock_timeout: Duration) -> Self {
        KvEngine {
            tables: Mutex::new(FxHashMap::default()),
            locks: LockTable::default(),
            next_locker: AtomicU64::new(1),
            lock_timeout,
            checkpoints: AtomicU64::new(0),
        }
    }

    /// Begin a top-level transaction with a freshly allocated locker ID.
    pub fn begin(&self) -> Transaction<'_> {
        let locker = Locker(self.next_locker.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(locker = locker.0, "begin top-level transaction");
        Transaction { engine: self, locker, undo: Vec::new(), open: true }
    }

    /// Begin a nested subtransaction sharing `parent`'s locker ID (spec
    /// §4.4: nested transactions commit into the parent; aborting the
    /// parent on subtransaction failure is not implicit, so we hand the
    /// caller the nested txn's undo log on commit instead of applying it
    /// automatically).
    pub fn begin_nested<'e>(&'e self, parent: &Transaction<'e>) -> Transaction<'e> {
        tracing::trace!(locker = parent.locker.0, "begin nested subtransaction");
        Transaction { engine: self, locker: parent.locker, undo: Vec::new(), open: true }
    }

    /// Force a checkpoint. A real embedded engine flushes its log here;
    /// this in-process engine just counts the request, which is enough
    /// for callers that only need to observe it happened.
    pub fn checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("checkpoint");
    }

    /// Number of checkpoints requested so far (test/ops visibility).
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    fn raw_get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.lock().get(table).and_then(|t| t.get(key).cloned())
    }

    fn raw_put(&self, table: &str, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.tables.lock().entry(table.to_string()).or_default().insert(key, value)
    }

    fn raw_remove(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.lock().get_mut(table).and_then(|t| t.remove(key))
    }

    /// Enumerate every `(key, value)` pair in `table`, sorted by key.
    /// Bypasses the lock table entirely: grounded in `bdb_tool_entry_next`'s
    /// raw cursor walk over `id2entry`, used by bulk load/dump rather than
    /// the transactional write/read path. Callers that need isolation
    /// should go through a [`Transaction`] instead.
    pub fn scan(&self, table: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        let tables = self.tables.lock();
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

/// A transaction or nested subtransaction against a [`KvEngine`].
pub struct Transaction<'e> {
    engine: &'e KvEngine,
    locker: Locker,
    undo: Vec<UndoOp>,
    open: bool,
}

impl<'e> Transaction<'e> {
    /// This transaction's locker ID (shared by any nested subtransactions
    /// begun under it).
    pub fn locker_id(&self) -> Locker {
        self.locker
    }

    fn acquire(&self, table: &str, key: &[u8]) -> Result<(), KvError> {
        self.engine.locks.acquire(self.locker, (table.to_string(), key.to_vec()), self.engine.lock_timeout)
    }

    /// Read a value.
    pub fn get(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.acquire(table, key)?;
        Ok(self.engine.raw_get(table, key))
    }

    /// Write (overwrite) a value.
    pub fn put(&mut self, table: &str, key: &[u8], value: Vec<u8>) -> Result<(), KvError> {
        self.acquire(table, key)?;
        let prev = self.engine.raw_put(table, key.to_vec(), value);
        self.undo.push(UndoOp::Put { key: (table.to_string(), key.to_vec()), prev });
        Ok(())
    }

    /// Write only if the key does not already exist; fails with
    /// [`KvError::KeyExists`] otherwise (used by the name→ID index's add
    /// path).
    pub fn put_new(&mut self, table: &str, key: &[u8], value: Vec<u8>) -> Result<(), KvError> {
        self.acquire(table, key)?;
        if self.engine.raw_get(table, key).is_some() {
            return Err(KvError::KeyExists);
        }
        self.engine.raw_put(table, key.to_vec(), value);
        self.undo.push(UndoOp::Put { key: (table.to_string(), key.to_vec()), prev: None });
        Ok(())
    }

    /// Delete a value; fails with [`KvError::NotFound`] if absent.
    pub fn del(&mut self, table: &str, key: &[u8]) -> Result<(), KvError> {
        self.acquire(table, key)?;
        match self.engine.raw_remove(table, key) {
            Some(prev) => {
                self.undo.push(UndoOp::Delete { key: (table.to_string(), key.to_vec()), prev });
                Ok(())
            }
            None => Err(KvError::NotFound),
        }
    }

    fn replay_undo(&mut self) {
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::Put { key: (table, key), prev } => match prev {
                    Some(value) => {
                        self.engine.raw_put(&table, key, value);
                    }
                    None => {
                        self.engine.raw_remove(&table, &key);
                    }
                },
                UndoOp::Delete { key: (table, key), prev } => {
                    self.engine.raw_put(&table, key, prev);
                }
            }
        }
    }

    /// Commit a top-level transaction, releasing all locks held by its
    /// locker.
    pub fn commit(mut self) -> Result<(), KvError> {
        self.open = false;
        self.engine.locks.release_all(self.locker);
        tracing::trace!(locker = self.locker.0, "commit top-level transaction");
        Ok(())
    }

    /// Commit a nested subtransaction into its parent: returns the undo
    /// log so the parent can replay it if the parent itself later aborts.
    /// Locks are not released since the parent (same locker) still needs
    /// them.
    pub fn commit_nested(mut self) -> Vec<NestedUndo> {
        self.open = false;
        tracing::trace!(locker = self.locker.0, "commit nested subtransaction");
        std::mem::take(&mut self.undo).into_iter().map(NestedUndo).collect()
    }

    /// Abort, undoing every staged write. For a top-level transaction this
    /// also releases all locks held by its locker; for a nested
    /// subtransaction the parent (same locker) keeps its locks.
    pub fn abort(mut self, release_locks: bool) {
        self.replay_undo();
        self.open = false;
        if release_locks {
            self.engine.locks.release_all(self.locker);
        }
        tracing::trace!(locker = self.locker.0, "abort transaction");
    }

    /// Absorb a nested subtransaction's committed undo log, so that if
    /// `self` later aborts, the nested transaction's effects are undone
    /// too.
    pub fn absorb_nested(&mut self, undo: Vec<NestedUndo>) {
        self.undo.extend(undo.into_iter().map(|n| n.0));
    }
}

impl<'e> Drop for Transaction<'e> {
    fn drop(&mut self) {
        if self.open {
            // Dropped without explicit commit/abort: treat as abort to
            // avoid leaking locks.
            self.replay_undo();
            self.engine.locks.release_all(self.locker);
        }
    }
}

/// Opaque undo log returned by [`Transaction::commit_nested`]; pass to
/// [`Transaction::absorb_nested`] on the parent.
pub struct NestedUndo(UndoOp);

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> KvEngine {
        KvEngine::new(Duration::from_millis(200))
    }

    #[test]
    fn put_then_get_within_same_transaction() {
        let e = engine();
        let mut t = e.begin();
        t.put("id2entry", b"1", b"hello".to_vec()).unwrap();
        assert_eq!(t.get("id2entry", b"1").unwrap(), Some(b"hello".to_vec()));
        t.commit().unwrap();
    }

    #[test]
    fn abort_undoes_writes() {
        let e = engine();
        let mut t = e.begin();
        t.put("id2entry", b"1", b"hello".to_vec()).unwrap();
        t.abort(true);

        let mut t2 = e.begin();
        assert_eq!(t2.get("id2entry", b"1").unwrap(), None);
        t2.commit().unwrap();
    }

    #[test]
    fn put_new_rejects_existing_key() {
        let e = engine();
        let mut t = e.begin();
        t.put_new("dn2id", b"dc=com", b"1".to_vec()).unwrap();
        let err = t.put_new("dn2id", b"dc=com", b"2".to_vec()).unwrap_err();
        assert_eq!(err, KvError::KeyExists);
        t.commit().unwrap();
    }

    #[test]
    fn del_missing_key_is_not_found() {
        let e = engine();
        let mut t = e.begin();
        let err = t.del("dn2id", b"dc=missing").unwrap_err();
        assert_eq!(err, KvError::NotFound);
        t.commit().unwrap();
    }

    #[test]
    fn nested_commit_then_parent_abort_undoes_nested_writes() {
        let e = engine();
        let mut parent = e.begin();
        {
            let mut nested = e.begin_nested(&parent);
            nested.put("id2entry", b"1", b"x".to_vec()).unwrap();
            let undo = nested.commit_nested();
            parent.absorb_nested(undo);
        }
        assert_eq!(parent.get("id2entry", b"1").unwrap(), Some(b"x".to_vec()));
        parent.abort(true);

        let mut t = e.begin();
        assert_eq!(t.get("id2entry", b"1").unwrap(), None);
        t.commit().unwrap();
    }

    #[test]
    fn second_locker_blocking_on_first_times_out_as_not_granted() {
        let e = engine();
        let mut t1 = e.begin();
        t1.put("id2entry", b"1", b"x".to_vec()).unwrap();

        let mut t2 = e.begin();
        let err = t2.get("id2entry", b"1").unwrap_err();
        assert_eq!(err, KvError::NotGranted);
        t2.abort(true);
        t1.commit().unwrap();
    }

    #[test]
    fn scan_returns_sorted_pairs_without_locking() {
        let e = engine();
        let mut t = e.begin();
        t.put("id2entry", b"\x00\x00\x00\x02", b"two".to_vec()).unwrap();
        t.put("id2entry", b"\x00\x00\x00\x01", b"one".to_vec()).unwrap();
        t.commit().unwrap();

        let pairs = e.scan("id2entry");
        assert_eq!(pairs, vec![
            (b"\x00\x00\x00\x01".to_vec(), b"one".to_vec()),
            (b"\x00\x00\x00\x02".to_vec(), b"two".to_vec()),
        ]);
    }

    #[test]
    fn direct_two_cycle_is_detected_as_deadlock() {
        let e = engine();
        let mut t1 = e.begin();
        let mut t2 = e.begin();
        t1.put("a", b"k1", b"x".to_vec()).unwrap();
        t2.put("a", b"k2", b"y".to_vec()).unwrap();

        // t2 waits on t1's key k1 first, registering the wait-for edge.
        let bg = std::thread::spawn(move || {
            let res = t2.get("a", b"k1");
            (t2, res)
        });
        std::thread::sleep(Duration::from_millis(50));
        // t1 now tries for t2's key k2, completing the cycle.
        let err = t1.get("a", b"k2").unwrap_err();
        assert_eq!(err, KvError::Deadlock);
        t1.abort(true);
        let (t2, res) = bg.join().unwrap();
        // t2's wait eventually resolves once t1 released its locks.
        let _ = res;
        t2.abort(true);
    }
}
