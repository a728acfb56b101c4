//! ID→entry store: durable serialized entries keyed by big-endian
//! 32-bit ID, grounded in back-bdb's `id2entry` database.

use dirstore_core::EntryId;

use crate::kv::{KvEngine, KvError, Transaction};

/// `id2entry` table name.
pub const ID2ENTRY_TABLE: &str = "id2entry";

/// Stateless operations over the ID-keyed entry store. Values are opaque
/// bytes here: serialization format is the caller's concern, and framing
/// is whatever `KvEngine`'s table storage already handles.
pub struct EntryStore;

impl EntryStore {
    /// Fetch a serialized entry by ID.
    pub fn get(txn: &mut Transaction, id: EntryId) -> Result<Option<Vec<u8>>, KvError> {
        txn.get(ID2ENTRY_TABLE, &id.to_be_bytes())
    }

    /// Store (overwriting) a serialized entry.
    pub fn put(txn: &mut Transaction, id: EntryId, serialized: Vec<u8>) -> Result<(), KvError> {
        txn.put(ID2ENTRY_TABLE, &id.to_be_bytes(), serialized)
    }

    /// Delete a serialized entry. Fails with [`KvError::NotFound`] if
    /// absent.
    pub fn delete(txn: &mut Transaction, id: EntryId) -> Result<(), KvError> {
        txn.del(ID2ENTRY_TABLE, &id.to_be_bytes())
    }

    /// Enumerate every stored entry in ascending ID order, bypassing the
    /// lock table. For tool-mode bulk dump only (`open`/`first`/`next`
    /// walks), grounded in `bdb_tool_entry_next`'s raw cursor walk.
    pub fn scan_all(engine: &KvEngine) -> Vec<(EntryId, Vec<u8>)> {
        engine
            .scan(ID2ENTRY_TABLE)
            .into_iter()
            .map(|(key, value)| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&key);
                (EntryId::from_be_bytes(buf), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvEngine;
    use std::time::Duration;

    #[test]
    fn put_then_get_round_trips() {
        let e = KvEngine::new(Duration::from_millis(200));
        let mut t = e.begin();
        EntryStore::put(&mut t, EntryId(1), b"serialized".to_vec()).unwrap();
        assert_eq!(EntryStore::get(&mut t, EntryId(1)).unwrap(), Some(b"serialized".to_vec()));
        t.commit().unwrap();
    }

    #[test]
    fn delete_missing_is_not_found() {
        let e = KvEngine::new(Duration::from_millis(200));
        let mut t = e.begin();
        let err = EntryStore::delete(&mut t, EntryId(99)).unwrap_err();
        assert_eq!(err, KvError::NotFound);
        t.commit().unwrap();
    }

    #[test]
    fn scan_all_returns_entries_in_ascending_id_order() {
        let e = KvEngine::new(Duration::from_millis(200));
        let mut t = e.begin();
        EntryStore::put(&mut t, EntryId(5), b"five".to_vec()).unwrap();
        EntryStore::put(&mut t, EntryId(2), b"two".to_vec()).unwrap();
        t.commit().unwrap();

        let all = EntryStore::scan_all(&e);
        assert_eq!(all, vec![(EntryId(2), b"two".to_vec()), (EntryId(5), b"five".to_vec())]);
    }
}
