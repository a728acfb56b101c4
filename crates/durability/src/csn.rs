//! Operational-attribute annotation: a change-sequence number and
//! create/modify timestamps stamped on every add/modify, grounded in
//! back-bdb's `slap_get_csn` call sites (`entryCSN`, `createTimestamp`,
//! `modifyTimestamp`).
//!
//! A real CSN also carries a replica ID and a per-timestamp modifier
//! count to total-order concurrent writers across a replication
//! topology. Cross-replica ordering is out of scope here, so a
//! process-local monotonic counter appended to the wall-clock second is
//! enough to keep CSNs strictly increasing within one backend. Lives
//! here rather than in either backend crate so both the transactional
//! orchestrator and the filesystem backend stamp entries identically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates strictly increasing change-sequence numbers.
#[derive(Default)]
pub struct CsnGenerator {
    counter: AtomicU64,
}

impl CsnGenerator {
    /// Stamp and format the next CSN as `<unix-seconds>.<counter>Z`.
    pub fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let secs =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        format!("{secs:020}.{seq:06}Z")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_csns_are_strictly_increasing() {
        let gen = CsnGenerator::default();
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
    }
}
