//! Tool-mode bulk load/dump for the transactional backend
//! (`open`/`first`/`next`/`get`/`put`/`close`), grounded in
//! back-bdb's `bdb_tool_entry_open`/`_next`/`_get`/`_put`/`_close`: a
//! straight sequential cursor over `id2entry`, bypassing the write
//! orchestrator's parent/precheck protocol entirely (bulk loaders are
//! expected to supply entries in an order that leaves dn2id/id2children
//! consistent once the whole load completes).

use std::sync::Arc;

use dirstore_core::{entry_to_full_ldif, parse_full_ldif, Entry, EntryId};
use dirstore_storage::{EntryStore, KvEngine};

/// An open bulk load/dump cursor over a transactional backend's entries.
pub struct TxnToolSession {
    engine: Arc<KvEngine>,
    entries: Vec<Entry>,
    cursor: usize,
}

impl TxnToolSession {
    /// Open a session, eagerly decoding every `id2entry` record in
    /// ascending ID order.
    pub fn open(engine: Arc<KvEngine>) -> Self {
        let entries = EntryStore::scan_all(&engine)
            .into_iter()
            .filter_map(|(id, bytes)| parse_full_ldif(id, &String::from_utf8_lossy(&bytes)).ok())
            .collect();
        TxnToolSession { engine, entries, cursor: 0 }
    }

    /// Rewind to, and return, the first entry.
    pub fn first(&mut self) -> Option<&Entry> {
        self.cursor = 0;
        self.entries.first()
    }

    /// Advance to, and return, the next entry.
    pub fn next(&mut self) -> Option<&Entry> {
        self.cursor += 1;
        self.entries.get(self.cursor)
    }

    /// Fetch an entry directly by its persistent ID.
    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    /// Write an entry's `id2entry` record directly, bypassing the
    /// transactional write path's index maintenance. Used for bulk load;
    /// callers must separately ensure dn2id/id2children/attribute-index
    /// consistency (e.g. via a follow-up reindex pass) before serving
    /// reads through the normal orchestrator.
    pub fn put(&self, entry: &Entry) -> Result<(), dirstore_storage::KvError> {
        let mut txn = self.engine.begin();
        EntryStore::put(&mut txn, entry.id(), entry_to_full_ldif(entry).into_bytes())?;
        txn.commit()
    }

    /// Close the session. Present for symmetry with the original
    /// open/close pairing; nothing to release beyond dropping the
    /// decoded entry list.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::{AttributeValues, Dn};
    use std::time::Duration;

    #[test]
    fn dump_session_enumerates_entries_put_directly() {
        let engine = Arc::new(KvEngine::new(Duration::from_millis(200)));
        let mut a = Entry::new(EntryId(1), Dn::parse("dc=example,dc=com").unwrap());
        a.set_attr("objectClass", AttributeValues::single("organization"));
        let mut b = Entry::new(EntryId(2), Dn::parse("ou=people,dc=example,dc=com").unwrap());
        b.set_attr("objectClass", AttributeValues::single("organizationalUnit"));

        let session = TxnToolSession::open(engine.clone());
        session.put(&a).unwrap();
        session.put(&b).unwrap();

        let mut session = TxnToolSession::open(engine);
        assert!(session.first().is_some());
        assert!(session.next().is_some());
        assert!(session.next().is_none());
        assert!(session.get(EntryId(1)).is_some());
        session.close();
    }
}
