//! Tool-mode bulk load/dump (`open`/`first`/`next`/`get`/`put`/`close`),
//! grounded in back-ldif/ldif.c's `ldif_tool_entry_open`/`_next`/`_get`/
//! `_put`/`_close`. Unlike the transactional write path, `put` here
//! writes directly without the add-time parent/precheck — bulk loaders
//! are expected to supply entries in an order that leaves the tree
//! consistent once the whole load completes.

use dirstore_core::{entry_to_ldif, Entry, EntryId};

use crate::atomic::write_atomic;
use crate::backend::{FsBackend, Scope};
use crate::path::entry_path;

/// An open bulk load/dump cursor over a backend's entries.
pub struct ToolSession<'b> {
    backend: &'b FsBackend,
    entries: Vec<Entry>,
    cursor: usize,
}

impl<'b> ToolSession<'b> {
    /// Open a session, eagerly enumerating every entry under the
    /// backend's suffix in depth-first (dump) order.
    pub fn open(backend: &'b FsBackend) -> Self {
        let suffix = backend.suffix().clone();
        let entries = backend.search(&suffix, Scope::Subtree, |_| true).unwrap_or_default();
        ToolSession { backend, entries, cursor: 0 }
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

    /// Fetch an entry by its tool-assigned sequence ID (1-based position
    /// in dump order; this backend has no persistent IDs of its own).
    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        let idx = id.0.checked_sub(1)? as usize;
        self.entries.get(idx)
    }

    /// Write an entry directly to its path, bypassing the transactional
    /// add-time precheck. Used for bulk load.
    pub fn put(&self, entry: &Entry) -> std::io::Result<()> {
        let path = entry_path(self.backend.base(), self.backend.platform(), entry.dn());
        let ldif = entry_to_ldif(entry);
        write_atomic(&path, ldif.as_bytes())
    }

    /// Close the session. Present for symmetry with the original
    /// open/close pairing; this implementation has no resources to
    /// release beyond dropping the enumerated entry list.
    pub fn close(self) {}
}
