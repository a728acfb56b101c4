//! Transactional write orchestrator: the add/modify/modrdn/delete
//! protocol that drives the KV substrate, the three fixed-order indexes,
//! the entry cache, and the change-log writer as one coordinated unit,
//! grounded in back-bdb's `bdb_add`/`bdb_modify`/`bdb_modrdn`/`bdb_delete`
//! (pre-checks, nested subtransaction for the index writes, cache
//! install/evict tied to the outer commit) and in strata-concurrency's
//! `TransactionManager` retry-on-conflict loop for the deadlock-driven
//! backoff shape.
//!
//! Each operation follows the same skeleton: resolve identity (parent for
//! add, target for modify/modrdn/delete) from the cache or a KV fallback,
//! stage the index and entry-store writes inside a nested subtransaction,
//! commit the nested transaction into the outer one, make the cache
//! change visible only once the outer transaction has actually committed,
//! then append a change-log record and consider a checkpoint. A
//! `Deadlock`/`LockNotGranted` error at any KV step aborts both
//! transactions and retries the whole operation from scratch after a
//! jittered backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use dirstore_cache::EntryCache;
use dirstore_core::{
    entry_to_full_ldif, entry_to_ldif, parse_full_ldif, AttributeValues, BackendConfig,
    CheckpointPolicy, DirError, Dn, Entry, EntryId, IndexConfig, IndexKind, ObjectClassFlags,
    PasswordVerifier, Rdn,
};
use dirstore_durability::{ChangeLogWriter, ChangeOp, ModSpec};
use dirstore_storage::{
    AttributeIndex, DnIndexError, EntryStore, IdAllocError, IdAllocator, KvEngine, KvError,
    NameIndex, Tokenizer, Transaction,
};

use crate::backoff::{jittered_delay, OpContext};
use crate::csn::CsnGenerator;
use crate::fault::{FaultInjector, FaultPoint};
use crate::modify::apply_mod;
use crate::policy::{AccessCheck, SchemaCheck};

/// A KV-layer failure, reclassified for the retry loop: either "abort and
/// try the whole operation again" or "abort and surface this to the
/// caller".
enum StepError {
    /// `KvError::Deadlock` or `KvError::NotGranted`.
    Retryable,
    /// Everything else, already mapped to the client-visible taxonomy.
    Fatal(DirError),
}

fn kv_step_error(e: KvError) -> StepError {
    match e {
        KvError::Deadlock | KvError::NotGranted => StepError::Retryable,
        KvError::KeyExists => StepError::Fatal(DirError::TypeOrValueExists),
        KvError::NotFound => StepError::Fatal(DirError::Other),
        KvError::Other(msg) => {
            tracing::error!(error = %msg, "write orchestrator: kv engine error");
            StepError::Fatal(DirError::Other)
        }
    }
}

fn kv_step_error_dn(e: DnIndexError) -> StepError {
    match e {
        DnIndexError::Kv(kv) => kv_step_error(kv),
        DnIndexError::HasChildren => StepError::Fatal(DirError::NotAllowedOnNonLeaf),
    }
}

/// Lowercase, whitespace-collapsed form used for index tokenization —
/// matches `Rdn`'s own component normalization so the name and attribute
/// indexes treat the same text identically.
fn normalize_index_value(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase()
}

/// An entry's identity and (if loaded) body, resolved while locating a
/// write's parent. Kept as `Option<Entry>` rather than just the derived
/// flags because a referral parent's `ref` URLs live in the entry body.
struct ResolvedParent {
    id: EntryId,
    entry: Option<Entry>,
}

/// Coordinates add/modify/modrdn/delete against the embedded KV substrate
/// the KV substrate, the entry cache, and the change-log writer.
pub struct WriteOrchestrator {
    engine: Arc<KvEngine>,
    cache: Arc<EntryCache>,
    changelog: Option<Arc<ChangeLogWriter>>,
    suffix: Dn,
    indexes: Vec<IndexConfig>,
    checkpoint_policy: Option<CheckpointPolicy>,
    max_retries: Option<u32>,
    schema: Arc<dyn SchemaCheck>,
    access: Arc<dyn AccessCheck>,
    verifier: Arc<dyn PasswordVerifier>,
    csn: CsnGenerator,
    fault: FaultInjector,
    retry_total: AtomicU64,
    backoff_cap_ms: u64,
    checkpoint_bytes: AtomicU64,
    checkpoint_last: Mutex<Instant>,
}

impl WriteOrchestrator {
    /// Build an orchestrator over an already-open KV engine and cache,
    /// using `config`'s index/checkpoint/retry-cap settings.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<KvEngine>,
        cache: Arc<EntryCache>,
        changelog: Option<Arc<ChangeLogWriter>>,
        suffix: Dn,
        config: &BackendConfig,
        schema: Arc<dyn SchemaCheck>,
        access: Arc<dyn AccessCheck>,
        verifier: Arc<dyn PasswordVerifier>,
    ) -> Self {
        WriteOrchestrator {
            engine,
            cache,
            changelog,
            suffix,
            indexes: config.indexes.clone(),
            checkpoint_policy: config.checkpoint,
            max_retries: config.max_retries,
            schema,
            access,
            verifier,
            csn: CsnGenerator::default(),
            fault: FaultInjector::default(),
            retry_total: AtomicU64::new(0),
            backoff_cap_ms: 5_000,
            checkpoint_bytes: AtomicU64::new(0),
            checkpoint_last: Mutex::new(Instant::now()),
        }
    }

    /// Total deadlock-driven retries performed across every write issued
    /// through this orchestrator so far.
    pub fn retry_total(&self) -> u64 {
        self.retry_total.load(Ordering::Relaxed)
    }

    /// Number of checkpoints the underlying KV engine has performed.
    pub fn checkpoint_count(&self) -> u64 {
        self.engine.checkpoint_count()
    }

    /// Arm a one-shot fault at `point`, for exercising the retry path
    /// under test without real thread contention.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.fault.arm(point);
    }

    /// Open a bulk load/dump cursor over the underlying `id2entry` store,
    /// bypassing the write orchestrator's parent/precheck protocol.
    pub fn tool_open(&self) -> crate::tool::TxnToolSession {
        crate::tool::TxnToolSession::open(self.engine.clone())
    }

    fn wait_and_bump(&self, retry_count: &mut u32, ctx: &OpContext) -> Result<(), DirError> {
        self.retry_total.fetch_add(1, Ordering::Relaxed);
        let delay = jittered_delay(*retry_count, self.backoff_cap_ms);
        tracing::debug!(
            retry = *retry_count,
            delay_ms = delay.as_millis() as u64,
            "write orchestrator: retrying after deadlock"
        );
        std::thread::sleep(delay);
        *retry_count += 1;
        if ctx.is_abandoned() {
            return Err(DirError::Abandoned);
        }
        Ok(())
    }

    fn maybe_checkpoint(&self, bytes_written: u64) {
        let Some(policy) = &self.checkpoint_policy else { return };
        let bytes = self.checkpoint_bytes.fetch_add(bytes_written, Ordering::Relaxed) + bytes_written;
        let elapsed = self.checkpoint_last.lock().elapsed();
        let due = bytes >= policy.kbyte.saturating_mul(1024)
            || elapsed >= Duration::from_secs(policy.min_minutes.saturating_mul(60));
        if due {
            self.engine.checkpoint();
            self.checkpoint_bytes.store(0, Ordering::Relaxed);
            *self.checkpoint_last.lock() = Instant::now();
        }
    }

    fn maintain_index_add(
        &self,
        txn: &mut Transaction,
        attribute: &str,
        value: &[u8],
        id: EntryId,
    ) -> Result<(), StepError> {
        let Some(cfg) = self.indexes.iter().find(|c| c.attribute.eq_ignore_ascii_case(attribute))
        else {
            return Ok(());
        };
        let normalized = normalize_index_value(value);
        for kind in &cfg.kinds {
            let (tokenizer, token_value) = match kind {
                IndexKind::Pres => (Tokenizer::Exact, "*"),
                IndexKind::Eq => (Tokenizer::Exact, normalized.as_str()),
                IndexKind::Sub => (Tokenizer::default(), normalized.as_str()),
                IndexKind::Approx => (Tokenizer::Approximate, normalized.as_str()),
            };
            AttributeIndex::add_value(txn, attribute, tokenizer, token_value, id)
                .map_err(kv_step_error)?;
        }
        Ok(())
    }

    fn maintain_index_remove(
        &self,
        txn: &mut Transaction,
        attribute: &str,
        value: &[u8],
        id: EntryId,
    ) -> Result<(), StepError> {
        let Some(cfg) = self.indexes.iter().find(|c| c.attribute.eq_ignore_ascii_case(attribute))
        else {
            return Ok(());
        };
        let normalized = normalize_index_value(value);
        for kind in &cfg.kinds {
            let (tokenizer, token_value) = match kind {
                IndexKind::Pres => (Tokenizer::Exact, "*"),
                IndexKind::Eq => (Tokenizer::Exact, normalized.as_str()),
                IndexKind::Sub => (Tokenizer::default(), normalized.as_str()),
                IndexKind::Approx => (Tokenizer::Approximate, normalized.as_str()),
            };
            AttributeIndex::remove_value(txn, attribute, tokenizer, token_value, id)
                .map_err(kv_step_error)?;
        }
        Ok(())
    }

    /// Resolve a write's target entry by normalized DN: cache first, a KV
    /// lookup + id2entry read on miss.
    fn load_existing(
        &self,
        txn: &mut Transaction,
        normalized_dn: &str,
        dn: &Dn,
    ) -> Result<(EntryId, Entry), StepError> {
        if let Some(handle) = self.cache.lookup_by_dn(normalized_dn) {
            if let Some(entry) = handle.entry() {
                return Ok((handle.id(), entry));
            }
        }
        let id = match NameIndex::lookup(txn, normalized_dn) {
            Ok(Some(id)) => id,
            Ok(None) => return Err(StepError::Fatal(DirError::NoSuchObject(dn.to_string()))),
            Err(e) => return Err(kv_step_error(e)),
        };
        let bytes = EntryStore::get(txn, id).map_err(kv_step_error)?;
        let Some(bytes) = bytes else {
            return Err(StepError::Fatal(DirError::KvCorruption(format!(
                "id2entry missing record for {dn}"
            ))));
        };
        let entry = parse_full_ldif(id, &String::from_utf8_lossy(&bytes))
            .map_err(|e| StepError::Fatal(DirError::KvCorruption(e.to_string())))?;
        Ok((id, entry))
    }

    /// Resolve an add's parent by normalized DN, warming the cache with a
    /// skeleton (and fill, if the body was read) on a KV-path miss.
    fn resolve_parent(&self, txn: &mut Transaction, parent_dn: &Dn) -> Result<ResolvedParent, StepError> {
        let normalized = parent_dn.normalized();
        if let Some(handle) = self.cache.lookup_by_dn(&normalized) {
            return Ok(ResolvedParent { id: handle.id(), entry: handle.entry() });
        }
        let id = match NameIndex::lookup(txn, &normalized) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Err(StepError::Fatal(DirError::NoSuchObject(parent_dn.to_string())))
            }
            Err(e) => return Err(kv_step_error(e)),
        };
        let bytes = EntryStore::get(txn, id).map_err(kv_step_error)?;
        let entry =
            bytes.and_then(|b| parse_full_ldif(id, &String::from_utf8_lossy(&b)).ok());
        let rdn_norm = parent_dn.rdn().map(|r| r.normalized().to_string()).unwrap_or_default();
        self.cache.skeleton(id, normalized, rdn_norm, None, parent_dn.depth());
        if let Some(e) = &entry {
            self.cache.fill(id, e.clone());
        }
        Ok(ResolvedParent { id, entry })
    }

    /// Reject an add whose parent is a referral or alias, or whose child
    /// is a subentry parented by a non-administrative-point entry (the
    /// one structural check this orchestrator enforces; schema proper is
    /// the caller's [`SchemaCheck`] collaborator).
    fn check_parent_admits_child(&self, parent: &ResolvedParent, child: &Entry) -> Result<(), DirError> {
        if let Some(e) = &parent.entry {
            if e.flags().contains(ObjectClassFlags::REFERRAL) {
                let urls = e
                    .get_attr("ref")
                    .map(|v| v.0.iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect())
                    .unwrap_or_default();
                return Err(DirError::Referral { matched_dn: e.dn().to_string(), urls });
            }
            if e.flags().contains(ObjectClassFlags::ALIAS) {
                return Err(DirError::AliasProblem(e.dn().to_string()));
            }
        }
        if child.flags().contains(ObjectClassFlags::SUBENTRY) {
            let is_admin_point = parent
                .entry
                .as_ref()
                .map(|e| e.get_attr("administrativeRole").is_some())
                .unwrap_or(false);
            if !is_admin_point {
                return Err(DirError::ObjectClassViolation(
                    "subentry requires an administrative-point parent".into(),
                ));
            }
        }
        Ok(())
    }

    /// Fetch an entry by DN: cache first, KV fallback on miss.
    pub fn get_by_dn(&self, dn: &Dn) -> Result<Entry, DirError> {
        let normalized = dn.normalized();
        if let Some(handle) = self.cache.lookup_by_dn(&normalized) {
            if let Some(entry) = handle.entry() {
                return Ok(entry);
            }
        }
        let mut txn = self.engine.begin();
        let outcome = self.load_existing(&mut txn, &normalized, dn);
        let _ = txn.commit();
        match outcome {
            Ok((id, entry)) => {
                let rdn_norm = dn.rdn().map(|r| r.normalized().to_string()).unwrap_or_default();
                self.cache.skeleton(id, normalized, rdn_norm, None, dn.depth());
                self.cache.fill(id, entry.clone());
                Ok(entry)
            }
            Err(StepError::Fatal(e)) => Err(e),
            Err(StepError::Retryable) => Err(DirError::Busy),
        }
    }

    /// Fetch an entry by ID: cache first, KV fallback on miss.
    pub fn get_by_id(&self, id: EntryId) -> Result<Entry, DirError> {
        if let Some(handle) = self.cache.lookup_by_id(id) {
            if let Some(entry) = handle.entry() {
                return Ok(entry);
            }
        }
        let mut txn = self.engine.begin();
        let outcome: Result<Entry, StepError> =
            match EntryStore::get(&mut txn, id).map_err(kv_step_error) {
                Ok(Some(bytes)) => parse_full_ldif(id, &String::from_utf8_lossy(&bytes))
                    .map_err(|e| StepError::Fatal(DirError::KvCorruption(e.to_string()))),
                Ok(None) => Err(StepError::Fatal(DirError::NoSuchObject(format!("id {}", id.0)))),
                Err(e) => Err(e),
            };
        let _ = txn.commit();
        match outcome {
            Ok(entry) => {
                self.cache.fill(id, entry.clone());
                Ok(entry)
            }
            Err(StepError::Fatal(e)) => Err(e),
            Err(StepError::Retryable) => Err(DirError::Busy),
        }
    }

    /// Verify a bind credential, masking "no such entry" as invalid
    /// credentials the way back-ldif's bind path does.
    pub fn bind(&self, dn: &Dn, credentials: &[u8]) -> Result<(), DirError> {
        let entry = self.get_by_dn(dn).map_err(|_| DirError::InvalidCredentials)?;
        let stored = entry.get_attr("userPassword").ok_or(DirError::InappropriateAuth)?;
        if stored.0.iter().any(|v| self.verifier.verify(v, credentials)) {
            Ok(())
        } else {
            Err(DirError::InvalidCredentials)
        }
    }

    /// Add a new entry. `entry`'s ID is overwritten once allocated; any ID
    /// the caller set is ignored.
    pub fn add(&self, mut entry: Entry, ctx: &OpContext) -> Result<EntryId, DirError> {
        let dn = entry.dn().clone();
        if !self.access.can_write(&dn) {
            return Err(DirError::InsufficientAccess(dn.to_string()));
        }
        self.schema.check_add(&entry)?;

        let normalized_dn = dn.normalized();
        let is_suffix = dn == self.suffix;
        let parent_dn = dn.parent();
        let ids = IdAllocator::new(&self.engine);

        let mut retry_count = 0u32;
        'attempt: loop {
            if let Some(max) = self.max_retries {
                if retry_count > max {
                    tracing::warn!(dn = %dn, retries = retry_count, "write orchestrator: add exceeded retry cap");
                    return Err(DirError::Other);
                }
            }

            let mut txn = self.engine.begin();

            let parent = if is_suffix {
                None
            } else {
                let pdn = match &parent_dn {
                    Some(p) => p,
                    None => {
                        txn.abort(true);
                        return Err(DirError::NoSuchObject(dn.to_string()));
                    }
                };
                match self.resolve_parent(&mut txn, pdn) {
                    Ok(p) => Some(p),
                    Err(StepError::Retryable) => {
                        txn.abort(true);
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    Err(StepError::Fatal(e)) => {
                        txn.abort(true);
                        return Err(e);
                    }
                }
            };

            if let Some(p) = &parent {
                if let Err(e) = self.check_parent_admits_child(p, &entry) {
                    txn.abort(true);
                    return Err(e);
                }
            }

            match NameIndex::lookup(&mut txn, &normalized_dn) {
                Ok(Some(_)) => {
                    txn.abort(true);
                    return Err(DirError::AlreadyExists(dn.to_string()));
                }
                Ok(None) => {}
                Err(e) => {
                    txn.abort(true);
                    match kv_step_error(e) {
                        StepError::Retryable => {
                            self.wait_and_bump(&mut retry_count, ctx)?;
                            continue 'attempt;
                        }
                        StepError::Fatal(e) => return Err(e),
                    }
                }
            }

            let id = match ids.next_id() {
                Ok(id) => id,
                Err(IdAllocError::Full) => {
                    txn.abort(true);
                    return Err(DirError::IdSpaceFull);
                }
                Err(IdAllocError::Lock(e)) => {
                    txn.abort(true);
                    match kv_step_error(e) {
                        StepError::Retryable => {
                            self.wait_and_bump(&mut retry_count, ctx)?;
                            continue 'attempt;
                        }
                        StepError::Fatal(e) => return Err(e),
                    }
                }
            };
            entry.set_id(id);

            let stamp = self.csn.next();
            if entry.get_attr("createTimestamp").is_none() {
                entry.set_attr("createTimestamp", AttributeValues::single(stamp.clone()));
            }
            entry.set_attr("modifyTimestamp", AttributeValues::single(stamp));
            entry.set_attr("entryCSN", AttributeValues::single(self.csn.next()));

            let parent_id = parent.as_ref().map(|p| p.id);
            let mut nested = self.engine.begin_nested(&txn);

            if self.fault.fire(FaultPoint::Dn2IdAdd) {
                nested.abort(false);
                txn.abort(true);
                self.wait_and_bump(&mut retry_count, ctx)?;
                continue 'attempt;
            }
            if let Err(e) = NameIndex::add(&mut nested, &normalized_dn, id, parent_id) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let mut index_failure = None;
            'index: for (attr, values) in entry.iter() {
                for value in &values.0 {
                    if let Err(e) = self.maintain_index_add(&mut nested, attr, value, id) {
                        index_failure = Some(e);
                        break 'index;
                    }
                }
            }
            if let Some(e) = index_failure {
                nested.abort(false);
                txn.abort(true);
                match e {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let serialized = entry_to_full_ldif(&entry).into_bytes();
            let byte_len = serialized.len() as u64;
            if let Err(e) = EntryStore::put(&mut nested, id, serialized) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let undo = nested.commit_nested();
            txn.absorb_nested(undo);

            let rdn_norm = dn.rdn().map(|r| r.normalized().to_string()).unwrap_or_default();
            let pending =
                self.cache.install(id, normalized_dn.clone(), rdn_norm, parent_id, dn.depth(), entry.clone());

            if let Err(e) = txn.commit() {
                drop(pending);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }
            pending.confirm();

            if let Some(log) = &self.changelog {
                let _ = log.record(&dn, &ChangeOp::Add { entry_ldif: entry_to_ldif(&entry) });
            }
            self.maybe_checkpoint(byte_len);
            tracing::debug!(dn = %dn, id = id.0, retries = retry_count, "write orchestrator: add committed");
            return Ok(id);
        }
    }

    /// Apply a mod-list to the entry at `dn`.
    pub fn modify(&self, dn: &Dn, mods: Vec<ModSpec>, ctx: &OpContext) -> Result<(), DirError> {
        if !self.access.can_write(dn) {
            return Err(DirError::InsufficientAccess(dn.to_string()));
        }
        self.schema.check_modify(dn, &mods)?;
        let normalized_dn = dn.normalized();

        let mut retry_count = 0u32;
        'attempt: loop {
            if let Some(max) = self.max_retries {
                if retry_count > max {
                    return Err(DirError::Other);
                }
            }

            let mut txn = self.engine.begin();
            let (id, mut entry) = match self.load_existing(&mut txn, &normalized_dn, dn) {
                Ok(v) => v,
                Err(StepError::Retryable) => {
                    txn.abort(true);
                    self.wait_and_bump(&mut retry_count, ctx)?;
                    continue 'attempt;
                }
                Err(StepError::Fatal(e)) => {
                    txn.abort(true);
                    return Err(e);
                }
            };

            let mut nested = self.engine.begin_nested(&txn);
            let mut failure: Option<StepError> = None;
            'mods: for spec in &mods {
                let old_values = entry.get_attr(&spec.attribute).map(|v| v.0.clone()).unwrap_or_default();
                if let Err(e) = apply_mod(&mut entry, spec) {
                    failure = Some(StepError::Fatal(e));
                    break 'mods;
                }
                let new_values = entry.get_attr(&spec.attribute).map(|v| v.0.clone()).unwrap_or_default();
                for value in old_values.iter().filter(|v| !new_values.contains(v)) {
                    if let Err(e) = self.maintain_index_remove(&mut nested, &spec.attribute, value, id) {
                        failure = Some(e);
                        break 'mods;
                    }
                }
                for value in new_values.iter().filter(|v| !old_values.contains(v)) {
                    if let Err(e) = self.maintain_index_add(&mut nested, &spec.attribute, value, id) {
                        failure = Some(e);
                        break 'mods;
                    }
                }
            }
            if let Some(e) = failure {
                nested.abort(false);
                txn.abort(true);
                match e {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            entry.set_attr("modifyTimestamp", AttributeValues::single(self.csn.next()));
            entry.set_attr("entryCSN", AttributeValues::single(self.csn.next()));

            let serialized = entry_to_full_ldif(&entry).into_bytes();
            let byte_len = serialized.len() as u64;
            if let Err(e) = EntryStore::put(&mut nested, id, serialized) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let undo = nested.commit_nested();
            txn.absorb_nested(undo);

            if let Err(e) = txn.commit() {
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            self.cache.fill(id, entry.clone());
            if let Some(log) = &self.changelog {
                let _ = log.record(dn, &ChangeOp::Modify { changes: mods });
            }
            self.maybe_checkpoint(byte_len);
            tracing::debug!(dn = %dn, id = id.0, retries = retry_count, "write orchestrator: modify committed");
            return Ok(());
        }
    }

    /// Delete the leaf entry at `dn`. Fails `NotAllowedOnNonLeaf` if it
    /// still has children.
    pub fn delete(&self, dn: &Dn, ctx: &OpContext) -> Result<(), DirError> {
        if !self.access.can_write(dn) {
            return Err(DirError::InsufficientAccess(dn.to_string()));
        }
        let normalized_dn = dn.normalized();

        let mut retry_count = 0u32;
        'attempt: loop {
            if let Some(max) = self.max_retries {
                if retry_count > max {
                    return Err(DirError::Other);
                }
            }

            let mut txn = self.engine.begin();
            let (id, entry) = match self.load_existing(&mut txn, &normalized_dn, dn) {
                Ok(v) => v,
                Err(StepError::Retryable) => {
                    txn.abort(true);
                    self.wait_and_bump(&mut retry_count, ctx)?;
                    continue 'attempt;
                }
                Err(StepError::Fatal(e)) => {
                    txn.abort(true);
                    return Err(e);
                }
            };

            match NameIndex::children(&mut txn, id) {
                Ok(children) if !children.is_empty() => {
                    txn.abort(true);
                    return Err(DirError::NotAllowedOnNonLeaf);
                }
                Ok(_) => {}
                Err(e) => {
                    txn.abort(true);
                    match kv_step_error(e) {
                        StepError::Retryable => {
                            self.wait_and_bump(&mut retry_count, ctx)?;
                            continue 'attempt;
                        }
                        StepError::Fatal(e) => return Err(e),
                    }
                }
            }

            let parent_id = match dn.parent() {
                None => None,
                Some(pdn) => match NameIndex::lookup(&mut txn, &pdn.normalized()) {
                    Ok(v) => v,
                    Err(e) => {
                        txn.abort(true);
                        match kv_step_error(e) {
                            StepError::Retryable => {
                                self.wait_and_bump(&mut retry_count, ctx)?;
                                continue 'attempt;
                            }
                            StepError::Fatal(e) => return Err(e),
                        }
                    }
                },
            };

            let mut nested = self.engine.begin_nested(&txn);

            if let Err(e) = NameIndex::delete(&mut nested, &normalized_dn, id, parent_id) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error_dn(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let mut index_failure = None;
            'index: for (attr, values) in entry.iter() {
                for value in &values.0 {
                    if let Err(e) = self.maintain_index_remove(&mut nested, attr, value, id) {
                        index_failure = Some(e);
                        break 'index;
                    }
                }
            }
            if let Some(e) = index_failure {
                nested.abort(false);
                txn.abort(true);
                match e {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            if let Err(e) = EntryStore::delete(&mut nested, id) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let undo = nested.commit_nested();
            txn.absorb_nested(undo);

            if let Err(e) = txn.commit() {
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            self.cache.evict(id);
            if let Some(log) = &self.changelog {
                let _ = log.record(dn, &ChangeOp::Delete);
            }
            tracing::debug!(dn = %dn, id = id.0, retries = retry_count, "write orchestrator: delete committed");
            return Ok(());
        }
    }

    /// Rename (and optionally re-parent) the entry at `dn`.
    pub fn modrdn(
        &self,
        dn: &Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
        ctx: &OpContext,
    ) -> Result<(), DirError> {
        if !self.access.can_write(dn) {
            return Err(DirError::InsufficientAccess(dn.to_string()));
        }
        if let Some(sup) = &new_superior {
            if !sup.is_suffix_of(&self.suffix) {
                return Err(DirError::AffectsMultipleDSAs);
            }
        }

        let normalized_dn = dn.normalized();
        let new_parent_dn = match &new_superior {
            Some(sup) => sup.clone(),
            None => dn.parent().unwrap_or_else(Dn::root),
        };
        let new_dn = new_parent_dn.child(new_rdn.clone());
        let new_normalized_dn = new_dn.normalized();

        let mut retry_count = 0u32;
        'attempt: loop {
            if let Some(max) = self.max_retries {
                if retry_count > max {
                    return Err(DirError::Other);
                }
            }

            let mut txn = self.engine.begin();
            let (id, mut entry) = match self.load_existing(&mut txn, &normalized_dn, dn) {
                Ok(v) => v,
                Err(StepError::Retryable) => {
                    txn.abort(true);
                    self.wait_and_bump(&mut retry_count, ctx)?;
                    continue 'attempt;
                }
                Err(StepError::Fatal(e)) => {
                    txn.abort(true);
                    return Err(e);
                }
            };

            if new_normalized_dn != normalized_dn {
                match NameIndex::lookup(&mut txn, &new_normalized_dn) {
                    Ok(Some(_)) => {
                        txn.abort(true);
                        return Err(DirError::AlreadyExists(new_dn.to_string()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        txn.abort(true);
                        match kv_step_error(e) {
                            StepError::Retryable => {
                                self.wait_and_bump(&mut retry_count, ctx)?;
                                continue 'attempt;
                            }
                            StepError::Fatal(e) => return Err(e),
                        }
                    }
                }
            }

            let old_parent_id = match dn.parent() {
                None => None,
                Some(pdn) => match NameIndex::lookup(&mut txn, &pdn.normalized()) {
                    Ok(v) => v,
                    Err(e) => {
                        txn.abort(true);
                        match kv_step_error(e) {
                            StepError::Retryable => {
                                self.wait_and_bump(&mut retry_count, ctx)?;
                                continue 'attempt;
                            }
                            StepError::Fatal(e) => return Err(e),
                        }
                    }
                },
            };
            let new_parent_id = if new_parent_dn.is_root() {
                None
            } else {
                match NameIndex::lookup(&mut txn, &new_parent_dn.normalized()) {
                    Ok(Some(id)) => Some(id),
                    Ok(None) => {
                        txn.abort(true);
                        return Err(DirError::NoSuchObject(new_parent_dn.to_string()));
                    }
                    Err(e) => {
                        txn.abort(true);
                        match kv_step_error(e) {
                            StepError::Retryable => {
                                self.wait_and_bump(&mut retry_count, ctx)?;
                                continue 'attempt;
                            }
                            StepError::Fatal(e) => return Err(e),
                        }
                    }
                }
            };

            let mut nested = self.engine.begin_nested(&txn);

            if let Err(e) = NameIndex::rename(
                &mut nested,
                &normalized_dn,
                &new_normalized_dn,
                id,
                old_parent_id,
                new_parent_id,
            ) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            if delete_old_rdn {
                if let Some(old_rdn) = dn.rdn() {
                    if let Some(values) = entry.get_attr(&old_rdn.attr).cloned() {
                        let old_value = old_rdn.value.as_bytes().to_vec();
                        if values.0.contains(&old_value) {
                            if let Err(e) =
                                self.maintain_index_remove(&mut nested, &old_rdn.attr, &old_value, id)
                            {
                                nested.abort(false);
                                txn.abort(true);
                                match e {
                                    StepError::Retryable => {
                                        self.wait_and_bump(&mut retry_count, ctx)?;
                                        continue 'attempt;
                                    }
                                    StepError::Fatal(e) => return Err(e),
                                }
                            }
                            let filtered: Vec<Vec<u8>> =
                                values.0.into_iter().filter(|v| v != &old_value).collect();
                            entry.set_attr(old_rdn.attr.clone(), AttributeValues(filtered));
                        }
                    }
                }
            }

            let new_rdn_value = new_rdn.value.as_bytes().to_vec();
            let already_present = entry
                .get_attr(&new_rdn.attr)
                .map(|v| v.0.contains(&new_rdn_value))
                .unwrap_or(false);
            if !already_present {
                if let Err(e) = self.maintain_index_add(&mut nested, &new_rdn.attr, &new_rdn_value, id) {
                    nested.abort(false);
                    txn.abort(true);
                    match e {
                        StepError::Retryable => {
                            self.wait_and_bump(&mut retry_count, ctx)?;
                            continue 'attempt;
                        }
                        StepError::Fatal(e) => return Err(e),
                    }
                }
                entry.add_values(&new_rdn.attr, vec![new_rdn_value]);
            }
            entry.set_dn(new_dn.clone());
            entry.set_attr("modifyTimestamp", AttributeValues::single(self.csn.next()));
            entry.set_attr("entryCSN", AttributeValues::single(self.csn.next()));

            let serialized = entry_to_full_ldif(&entry).into_bytes();
            let byte_len = serialized.len() as u64;
            if let Err(e) = EntryStore::put(&mut nested, id, serialized) {
                nested.abort(false);
                txn.abort(true);
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let undo = nested.commit_nested();
            txn.absorb_nested(undo);

            if let Err(e) = txn.commit() {
                match kv_step_error(e) {
                    StepError::Retryable => {
                        self.wait_and_bump(&mut retry_count, ctx)?;
                        continue 'attempt;
                    }
                    StepError::Fatal(e) => return Err(e),
                }
            }

            let new_rdn_norm = new_rdn.normalized().to_string();
            self.cache.rename(
                id,
                new_normalized_dn.clone(),
                new_rdn_norm,
                new_parent_id,
                new_dn.depth(),
                Some(entry.clone()),
            );

            if let Some(log) = &self.changelog {
                let _ = log.record(
                    dn,
                    &ChangeOp::ModRdn {
                        new_rdn: new_rdn.to_string(),
                        delete_old_rdn,
                        new_superior: new_superior.as_ref().map(|s| s.to_string()),
                    },
                );
            }
            self.maybe_checkpoint(byte_len);
            tracing::debug!(dn = %dn, new_dn = %new_dn, retries = retry_count, "write orchestrator: modrdn committed");
            return Ok(());
        }
    }

    /// Load one entry by ID within an in-progress scan transaction,
    /// preferring the cache but falling back to a direct id2entry read
    /// (the entry may not yet have a skeleton node if this is the first
    /// time it's been touched).
    fn load_for_scan(&self, txn: &mut Transaction, id: EntryId) -> Result<Entry, StepError> {
        if let Some(handle) = self.cache.lookup_by_id(id) {
            if let Some(entry) = handle.entry() {
                return Ok(entry);
            }
        }
        let bytes = EntryStore::get(txn, id).map_err(kv_step_error)?;
        let Some(bytes) = bytes else {
            return Err(StepError::Fatal(DirError::KvCorruption(format!(
                "id2entry missing record for id {}",
                id.0
            ))));
        };
        let entry = parse_full_ldif(id, &String::from_utf8_lossy(&bytes))
            .map_err(|e| StepError::Fatal(DirError::KvCorruption(e.to_string())))?;
        self.cache.fill(id, entry.clone());
        Ok(entry)
    }

    fn collect_recursive(
        &self,
        txn: &mut Transaction,
        id: EntryId,
        scope: dirstore_core::Scope,
        include_self: bool,
        out: &mut Vec<Entry>,
    ) -> Result<(), StepError> {
        if include_self {
            out.push(self.load_for_scan(txn, id)?);
        }
        if matches!(scope, dirstore_core::Scope::Base) {
            return Ok(());
        }
        let children = NameIndex::children(txn, id).map_err(kv_step_error)?;
        for child_id in children {
            self.collect_recursive(txn, child_id, scope.child_scope(), true, out)?;
        }
        Ok(())
    }

    /// Search under `base_dn` within `scope`, applying `filter` to each
    /// candidate entry. Walks the name→ID index tree rather than the
    /// attribute index; the attribute index only accelerates candidate
    /// selection and query planning is out of scope for this crate's
    /// write-path focus, so every descendant is visited and tested
    /// against `filter` directly.
    pub fn search(
        &self,
        base_dn: &Dn,
        scope: dirstore_core::Scope,
        filter: impl Fn(&Entry) -> bool,
    ) -> Result<Vec<Entry>, DirError> {
        let normalized = base_dn.normalized();
        let mut txn = self.engine.begin();
        let base_id = match NameIndex::lookup(&mut txn, &normalized) {
            Ok(Some(id)) => id,
            Ok(None) => {
                txn.abort(true);
                return Err(DirError::NoSuchObject(base_dn.to_string()));
            }
            Err(e) => {
                txn.abort(true);
                return match kv_step_error(e) {
                    StepError::Retryable => Err(DirError::Busy),
                    StepError::Fatal(e) => Err(e),
                };
            }
        };

        let mut out = Vec::new();
        let result = self.collect_recursive(&mut txn, base_id, scope, scope.includes_base(), &mut out);
        txn.abort(true);
        match result {
            Ok(()) => Ok(out.into_iter().filter(|e| filter(e)).collect()),
            Err(StepError::Retryable) => Err(DirError::Busy),
            Err(StepError::Fatal(e)) => Err(e),
        }
    }
}
