//! Schema and access-control seams.
//!
//! Schema validation and access-control evaluation are treated as
//! external collaborators reachable only through named interfaces; the
//! write orchestrator calls through these traits rather than owning
//! either concern, the same seam shape `dirstore_core::auth::PasswordVerifier`
//! uses to keep bind-time hashing out of scope.

use dirstore_core::{DirError, Dn, Entry};
use dirstore_durability::ModSpec;

/// Structural entry validation, invoked before an add or modify is
/// admitted to the write protocol. This crate does not implement a
/// schema *language*; it only defines where a caller-supplied one plugs
/// in.
pub trait SchemaCheck: Send + Sync {
    /// Validate a brand-new entry before an ID is allocated for it.
    fn check_add(&self, entry: &Entry) -> Result<(), DirError> {
        let _ = entry;
        Ok(())
    }

    /// Validate a proposed modify's mod-list against its target DN.
    fn check_modify(&self, dn: &Dn, mods: &[ModSpec]) -> Result<(), DirError> {
        let _ = (dn, mods);
        Ok(())
    }
}

/// Admits every entry and every mod-list. The default when no external
/// schema collaborator is wired in (e.g. in tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSchemaCheck;

impl SchemaCheck for NoopSchemaCheck {}

/// Access-control evaluation, invoked before a mutation is admitted.
/// Caller identity and the ACL rule engine are the wire/front-end's
/// concern; this trait is only the seam the orchestrator calls through.
pub trait AccessCheck: Send + Sync {
    /// True if the operation may write to `dn`.
    fn can_write(&self, dn: &Dn) -> bool {
        let _ = dn;
        true
    }
}

/// Permits every write. The default when no external ACL collaborator is
/// wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccessCheck;

impl AccessCheck for NoopAccessCheck {}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::EntryId;

    #[test]
    fn noop_checks_admit_everything() {
        let schema = NoopSchemaCheck;
        let access = NoopAccessCheck;
        let dn = Dn::parse("dc=example,dc=com").unwrap();
        let entry = Entry::new(EntryId(1), dn.clone());
        assert!(schema.check_add(&entry).is_ok());
        assert!(schema.check_modify(&dn, &[]).is_ok());
        assert!(access.can_write(&dn));
    }
}
