//! Monotonic 32-bit entry-ID allocator, grounded in back-bdb's
//! `bdb_next_id`: the counter lives in its own short transaction outside
//! the caller's write transaction so concurrent adds don't serialize on
//! the counter record.

use dirstore_core::EntryId;

use crate::kv::{KvEngine, KvError};

const META_TABLE: &str = "meta";
const NEXT_ID_KEY: &[u8] = b"next_id";

/// Allocates fresh [`EntryId`]s from a counter persisted in the `meta`
/// table.
pub struct IdAllocator<'e> {
    engine: &'e KvEngine,
}

/// The ID allocator's failure modes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdAllocError {
    /// The 32-bit ID space (2^32 - 1) is exhausted.
    #[error("entry ID space exhausted")]
    Full,
    /// The counter's lock could not be acquired.
    #[error("lock error: {0:?}")]
    Lock(KvError),
}

impl<'e> IdAllocator<'e> {
    /// Bind the allocator to an engine.
    pub fn new(engine: &'e KvEngine) -> Self {
        IdAllocator { engine }
    }

    /// Allocate and persist the next ID, in its own short transaction.
    pub fn next_id(&self) -> Result<EntryId, IdAllocError> {
        let mut txn = self.engine.begin();
        let current = txn
            .get(META_TABLE, NEXT_ID_KEY)
            .map_err(IdAllocError::Lock)?
            .map(|bytes| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                u32::from_be_bytes(buf)
            })
            .unwrap_or(0);

        let next = current.checked_add(1).ok_or(IdAllocError::Full)?;
        if next == u32::MAX {
            txn.abort(true);
            return Err(IdAllocError::Full);
        }

        txn.put(META_TABLE, NEXT_ID_KEY, next.to_be_bytes().to_vec())
            .map_err(IdAllocError::Lock)?;
        txn.commit().map_err(IdAllocError::Lock)?;
        tracing::trace!(id = next, "allocated entry id");
        Ok(EntryId(next))
    }
}
