//! Deterministic fault injection for exercising the deadlock retry path
//! under test, grounded in strata-storage's `testing::crash_harness`
//! (a named injection point plus a toggle) but scaled down to exactly one
//! scenario: a forced deadlock injected on `dn2id_add` for the
//! transactional backend.
//!
//! Unlike the crash harness's probabilistic crash points, these are
//! one-shot: a test arms a point, the next matching step reports
//! `Deadlock` exactly once and disarms itself, so the retry loop's
//! success-after-bounded-retries path is reproducible without real
//! thread contention.

use std::sync::atomic::{AtomicBool, Ordering};

/// Named points inside the write orchestrator's protocol where a test can
/// force a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Step 6a: the name→ID index add, inside the nested subtransaction.
    Dn2IdAdd,
}

/// A one-shot fault injector, held by [`crate::orchestrator::WriteOrchestrator`].
#[derive(Default)]
pub struct FaultInjector {
    dn2id_add: AtomicBool,
}

impl FaultInjector {
    /// Arm `point` to fire exactly once on the next matching step.
    pub fn arm(&self, point: FaultPoint) {
        match point {
            FaultPoint::Dn2IdAdd => self.dn2id_add.store(true, Ordering::SeqCst),
        }
    }

    /// Consume the arm state for `point`, if set. Returns `true` at most
    /// once per `arm` call.
    pub(crate) fn fire(&self, point: FaultPoint) -> bool {
        match point {
            FaultPoint::Dn2IdAdd => self.dn2id_add.swap(false, Ordering::SeqCst),
        }
    }
}
