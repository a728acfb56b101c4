//! Error taxonomy for the directory storage core.
//!
//! This module defines the unified error type returned by both backends.
//! We use `thiserror` for automatic `Display`/`Error` impls, the same way
//! every other crate in this workspace reports errors.
//!
//! ## Error Categories
//!
//! - **Client-visible protocol errors**: surfaced to the caller unchanged
//!   (`NoSuchObject`, `AlreadyExists`, `InsufficientAccess`, ...).
//! - **Retryable internals**: `Deadlock`, `LockNotGranted` — these never
//!   escape the transactional write orchestrator; it catches them and
//!   drives the retry loop.
//! - **Fatal internals**: `KvCorruption`, `Io` after a commit point —
//!   surfaced as `Other` with the diagnostic logged via `tracing`.
//! - **Flow signals**: `Abandoned`, `NoOp`.

use std::io;
use std::path::PathBuf;

/// Result type alias used throughout the crate family.
pub type Result<T> = std::result::Result<T, DirError>;

/// Unified error type for directory storage operations.
#[derive(Debug, thiserror::Error)]
pub enum DirError {
    /// The target DN does not resolve to an entry.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The target DN already resolves to an entry (add or modrdn onto existing).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Caller lacks the access needed for the operation.
    #[error("insufficient access: {0}")]
    InsufficientAccess(String),

    /// Bind credentials did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Bind was attempted against an entry with no usable auth mechanism.
    #[error("inappropriate authentication")]
    InappropriateAuth,

    /// The entry, post-modification, would violate its object-class flags.
    #[error("object class violation: {0}")]
    ObjectClassViolation(String),

    /// Delete (or rmdir) attempted against an entry that still has children.
    #[error("not allowed on non-leaf entry")]
    NotAllowedOnNonLeaf,

    /// Operation would cross an alias entry.
    #[error("alias problem: {0}")]
    AliasProblem(String),

    /// A modrdn's new superior lives under a different DSA.
    #[error("affects multiple DSAs")]
    AffectsMultipleDSAs,

    /// Matched a referral entry instead of the requested object.
    #[error("referral to {urls:?} (matched {matched_dn})")]
    Referral {
        /// DN of the referral entry actually matched.
        matched_dn: String,
        /// Referral URLs carried by the matched entry.
        urls: Vec<String>,
    },

    /// Server declines to perform the operation as specified.
    #[error("unwilling to perform: {0}")]
    UnwillingToPerform(String),

    /// Add/modify would create a duplicate attribute type-or-value.
    #[error("type or value exists")]
    TypeOrValueExists,

    /// Backend temporarily cannot service the request.
    #[error("busy")]
    Busy,

    /// Caller cancelled the operation between retries.
    #[error("abandoned")]
    Abandoned,

    /// Read-only probe ("no-op" control) completed without committing.
    #[error("no-op")]
    NoOp,

    /// Retryable: two lockers wait on each other's resources.
    ///
    /// Never escapes the write orchestrator.
    #[error("deadlock detected")]
    Deadlock,

    /// Retryable: a lock could not be granted before the configured timeout.
    ///
    /// Never escapes the write orchestrator.
    #[error("lock not granted")]
    LockNotGranted,

    /// The underlying KV engine's on-disk state is inconsistent.
    #[error("kv corruption: {0}")]
    KvCorruption(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O failure with a path attached, for diagnostics.
    #[error("I/O error at {path}: {source}")]
    IoAt {
        /// Path the failing operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The 32-bit entry-ID space is exhausted.
    #[error("entry ID space exhausted")]
    IdSpaceFull,

    /// Catch-all for internal errors that should not be inspected by callers;
    /// the diagnostic text is for logs only.
    #[error("internal error")]
    Other,
}

impl DirError {
    /// True for the two retryable internal kinds that drive the
    /// transactional write orchestrator's retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DirError::Deadlock | DirError::LockNotGranted)
    }

    /// True for kinds that should never be surfaced verbatim to a client;
    /// the orchestrator logs the diagnostic and returns [`DirError::Other`].
    pub fn is_fatal_internal(&self) -> bool {
        matches!(self, DirError::KvCorruption(_) | DirError::Io(_) | DirError::IoAt { .. })
    }

    /// Attach a path to an I/O error for better diagnostics.
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DirError::IoAt { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_are_exactly_deadlock_and_not_granted() {
        assert!(DirError::Deadlock.is_retryable());
        assert!(DirError::LockNotGranted.is_retryable());
        assert!(!DirError::Busy.is_retryable());
        assert!(!DirError::NoSuchObject("x".into()).is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let e = DirError::AlreadyExists("cn=a,dc=x".into());
        assert!(e.to_string().contains("cn=a,dc=x"));
    }
}
