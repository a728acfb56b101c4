//! # dirstore
//!
//! Storage and write-path core for a directory service: hierarchical DNs,
//! a transactional backend built on an embedded pessimistic-locking KV
//! substrate, and a filesystem backend that maps the tree directly onto
//! one `.ldif` file per entry.
//!
//! # Quick start
//!
//! ```no_run
//! use dirstore::{BackendConfig, Dn, FsBackend, Platform, PlaintextVerifier};
//! use std::sync::Arc;
//!
//! let suffix = Dn::parse("dc=example,dc=com").unwrap();
//! let backend = FsBackend::new(
//!     "/var/dirstore/data",
//!     suffix,
//!     Platform::Posix,
//!     Arc::new(PlaintextVerifier),
//!     None,
//! );
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|-----------------|
//! | [`dirstore_core`] | DN/name codec, entry model, error taxonomy, config |
//! | [`dirstore_storage`] | ID allocator, KV transaction substrate, name and attribute indexes, ID→entry store |
//! | [`dirstore_cache`] | In-memory entry cache with cache-coherent staged install |
//! | [`dirstore_concurrency`] | Transactional write orchestrator: add/modify/modrdn/delete with deadlock-driven retry |
//! | [`dirstore_durability`] | Change-log writer and the mod-list application shared by both backends |
//! | [`dirstore_fs`] | Filesystem backend |
//!
//! Two backends implement the same conceptual operation set but are not
//! unified behind a shared trait here: the transactional backend's
//! operations take an [`dirstore_concurrency::OpContext`] for
//! cancellation and retry, while the filesystem backend's do not, and
//! collapsing that difference behind one interface would either leak it
//! back out or silently drop it. Callers pick the backend crate they need
//! directly.

pub use dirstore_cache::{CacheHandle, CacheStats, EntryCache, PendingInstall};
pub use dirstore_concurrency::{
    exponential_backoff_ms, jittered_delay, AccessCheck, CsnGenerator, FaultInjector, FaultPoint,
    NoopAccessCheck, NoopSchemaCheck, OpContext, SchemaCheck, TxnToolSession, WriteOrchestrator,
};
pub use dirstore_core::{
    entry_to_full_ldif, entry_to_ldif, parse_full_ldif, parse_ldif, AttributeValues,
    BackendConfig, BackendConfigBuilder, CheckpointPolicy, DirError, Dn, Entry, EntryId,
    IndexConfig, IndexKind, LdifParseError, ObjectClassFlags, PasswordVerifier, PlaintextVerifier,
    Platform, Rdn, ReplicaConfig, Result, Scope,
};
pub use dirstore_durability::{apply_mod, ChangeLogWriter, ChangeOp, ModOp, ModSpec, ReplicaFilter};
pub use dirstore_fs::{FsBackend, Lookup, ToolSession};
pub use dirstore_storage::{
    AttributeIndex, DnIndexError, IdAllocError, IdAllocator, KvEngine, KvError, Locker,
    NameIndex, NestedUndo, Tokenizer, Transaction,
};
