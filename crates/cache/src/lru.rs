//! Minimal recency tracker backing the entry cache's eviction policy.
//! Kept as a small standalone structure (rather than pulling in an LRU
//! crate) since the only operation the cache needs is "touch" and
//! "evict oldest".

use std::collections::VecDeque;

use dirstore_core::EntryId;
use parking_lot::Mutex;

#[derive(Default)]
pub(crate) struct Lru {
    order: Mutex<VecDeque<EntryId>>,
}

impl Lru {
    /// Mark `id` as most-recently-used.
    pub(crate) fn touch(&self, id: EntryId) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|&x| x == id) {
            order.remove(pos);
        }
        order.push_back(id);
    }

    /// Drop `id` from recency tracking (on evict/delete).
    pub(crate) fn forget(&self, id: EntryId) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|&x| x == id) {
            order.remove(pos);
        }
    }

    /// The least-recently-used ID, if any.
    pub(crate) fn oldest(&self) -> Option<EntryId> {
        self.order.lock().front().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.lock().len()
    }
}
