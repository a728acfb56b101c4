//! Change log writer: a single append-only textual log shared
//! across backends, grounded in slapd's `repl.c` (`replog`,
//! `add_replica_suffix`) and adapted from strata-durability's WAL writer
//! for the append+fsync+lock discipline, swapping binary segments for one
//! shared LDIF-style log file under an OS advisory lock.
//!
//! The writer never calls back into any storage backend.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use dirstore_core::Dn;
use fs2::FileExt;
use parking_lot::Mutex;

/// One `add`/`delete`/`modify`/`modrdn` attribute-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    /// Add one or more values.
    Add,
    /// Delete one or more values (or the whole attribute if empty).
    Delete,
    /// Replace the attribute's value set.
    Replace,
    /// Numeric increment.
    Increment,
    /// Add only if not already present.
    SoftAdd,
}

impl ModOp {
    fn as_str(self) -> &'static str {
        match self {
            ModOp::Add => "add",
            ModOp::Delete => "delete",
            ModOp::Replace => "replace",
            ModOp::Increment => "increment",
            ModOp::SoftAdd => "soft-add",
        }
    }
}

/// One attribute-level change within a modify operation.
#[derive(Debug, Clone)]
pub struct ModSpec {
    /// Which kind of change.
    pub op: ModOp,
    /// Attribute affected.
    pub attribute: String,
    /// Values involved (empty for a bare `delete` of the whole attribute).
    pub values: Vec<Vec<u8>>,
}

/// The operation-specific body of a committed mutation.
#[derive(Debug, Clone)]
pub enum ChangeOp {
    /// New entry, serialized in LDIF form.
    Add {
        /// RDN-relative LDIF body as written by `entry_to_ldif`.
        entry_ldif: String,
    },
    /// Attribute-level change list.
    Modify {
        /// Ordered list of changes as applied.
        changes: Vec<ModSpec>,
    },
    /// Entry removed.
    Delete,
    /// Entry renamed (optionally re-parented).
    ModRdn {
        /// The new RDN string.
        new_rdn: String,
        /// Whether the old RDN's attribute value was removed.
        delete_old_rdn: bool,
        /// New superior DN, if the entry moved.
        new_superior: Option<String>,
    },
}

/// One `replica uri=... suffix=...` filter.
#[derive(Debug, Clone)]
pub struct ReplicaFilter {
    /// Destination identifier written as the `replica:` line value.
    pub uri: String,
    /// Suffixes this replica is interested in.
    pub suffixes: Vec<Dn>,
}

/// Appends committed mutations to a shared textual log.
pub struct ChangeLogWriter {
    path: PathBuf,
    mutex: Mutex<()>,
    replicas: Vec<ReplicaFilter>,
    skip_when_no_replica_matches: bool,
}

impl ChangeLogWriter {
    /// Open a writer for the given log path.
    pub fn new(path: impl Into<PathBuf>, replicas: Vec<ReplicaFilter>, skip_when_empty: bool) -> Self {
        ChangeLogWriter {
            path: path.into(),
            mutex: Mutex::new(()),
            replicas,
            skip_when_no_replica_matches: skip_when_empty,
        }
    }

    fn matching_replicas(&self, dn: &Dn) -> Vec<&str> {
        self.replicas
            .iter()
            .filter(|r| r.suffixes.iter().any(|suffix| dn.is_suffix_of(suffix)))
            .map(|r| r.uri.as_str())
            .collect()
    }

    /// Append one committed mutation's record. Acquires the writer's
    /// in-process mutex plus an OS advisory lock on the open file so
    /// concurrent processes appending to the same log don't interleave.
    pub fn record(&self, dn: &Dn, op: &ChangeOp) -> io::Result<()> {
        let _guard = self.mutex.lock();

        let replicas = self.matching_replicas(dn);
        if replicas.is_empty() && self.skip_when_no_replica_matches {
            tracing::trace!(dn = %dn, "changelog skip: no replica suffix matched");
            return Ok(());
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = self.write_record(&mut file, dn, &replicas, op);
        // Always attempt to unlock even if the write failed, so a later
        // append by this or another process isn't starved.
        let _ = FileExt::unlock(&file);
        result
    }

    fn write_record(
        &self,
        file: &mut std::fs::File,
        dn: &Dn,
        replicas: &[&str],
        op: &ChangeOp,
    ) -> io::Result<()> {
        let mut body = String::new();
        for uri in replicas {
            body.push_str("replica: ");
            body.push_str(uri);
            body.push('\n');
        }
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        body.push_str(&format!("time: {unix_time}\n"));
        body.push_str(&format!("dn: {dn}\n"));

        match op {
            ChangeOp::Add { entry_ldif } => {
                body.push_str("changetype: add\n");
                body.push_str(entry_ldif);
                if !entry_ldif.ends_with('\n') {
                    body.push('\n');
                }
            }
            ChangeOp::Modify { changes } => {
                body.push_str("changetype: modify\n");
                for change in changes {
                    body.push_str(&format!("{}: {}\n", change.op.as_str(), change.attribute));
                    for value in &change.values {
                        body.push_str(&format!(
                            "{}: {}\n",
                            change.attribute,
                            String::from_utf8_lossy(value)
                        ));
                    }
                    body.push_str("-\n");
                }
            }
            ChangeOp::Delete => {
                body.push_str("changetype: delete\n");
            }
            ChangeOp::ModRdn { new_rdn, delete_old_rdn, new_superior } => {
                body.push_str("changetype: modrdn\n");
                body.push_str(&format!("newrdn: {new_rdn}\n"));
                body.push_str(&format!("deleteoldrdn: {}\n", if *delete_old_rdn { 1 } else { 0 }));
                if let Some(sup) = new_superior {
                    body.push_str(&format!("newsuperior: {sup}\n"));
                }
            }
        }
        body.push('\n');
        file.write_all(body.as_bytes())?;
        file.sync_all()
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn add_record_contains_dn_and_changetype() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog");
        let writer = ChangeLogWriter::new(&path, Vec::new(), false);
        let dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
        writer
            .record(&dn, &ChangeOp::Add { entry_ldif: "cn: alice\n".into() })
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("dn: cn=alice,dc=example,dc=com"));
        assert!(contents.contains("changetype: add"));
        assert!(contents.ends_with("\n\n"));
    }

    #[test]
    fn skip_when_no_replica_matches_and_flag_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog");
        let suffix = Dn::parse("dc=other,dc=com").unwrap();
        let writer = ChangeLogWriter::new(
            &path,
            vec![ReplicaFilter { uri: "ldap://r1".into(), suffixes: vec![suffix] }],
            true,
        );
        let dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
        writer.record(&dn, &ChangeOp::Delete).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn replica_line_emitted_when_suffix_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog");
        let suffix = Dn::parse("dc=example,dc=com").unwrap();
        let writer = ChangeLogWriter::new(
            &path,
            vec![ReplicaFilter { uri: "ldap://r1".into(), suffixes: vec![suffix] }],
            true,
        );
        let dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
        writer.record(&dn, &ChangeOp::Delete).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("replica: ldap://r1"));
    }

    #[test]
    fn modrdn_record_includes_new_superior_when_present() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog");
        let writer = ChangeLogWriter::new(&path, Vec::new(), false);
        let dn = Dn::parse("cn=alice,ou=people,dc=example,dc=com").unwrap();
        writer
            .record(
                &dn,
                &ChangeOp::ModRdn {
                    new_rdn: "cn=alicia".into(),
                    delete_old_rdn: true,
                    new_superior: Some("ou=archive,dc=example,dc=com".into()),
                },
            )
            .unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("newrdn: cn=alicia"));
        assert!(contents.contains("deleteoldrdn: 1"));
        assert!(contents.contains("newsuperior: ou=archive,dc=example,dc=com"));
    }
}
