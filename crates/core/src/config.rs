//! Backend configuration, built as a builder the way strata-engine's
//! `database/config.rs` does.

use std::path::PathBuf;
use std::time::Duration;

/// Index types a configured attribute can be searched by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Exact-match equality index.
    Eq,
    /// Substring (n-gram) index.
    Sub,
    /// Presence index.
    Pres,
    /// Approximate-match index.
    Approx,
}

/// One `index attr flags` configuration line.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Attribute name being indexed.
    pub attribute: String,
    /// Which index kinds to maintain for it.
    pub kinds: Vec<IndexKind>,
}

/// One `replica uri=... suffix=...` configuration line.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Destination URI for the replica (opaque to this crate).
    pub uri: String,
    /// Suffixes this replica should receive changes for.
    pub suffixes: Vec<String>,
}

/// Periodic durability-flush trigger (`checkpoint kbyte min`).
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    /// Force a checkpoint after this many KB of log have accumulated.
    pub kbyte: u64,
    /// Force a checkpoint after this many minutes since the last one.
    pub min_minutes: u64,
}

/// Full backend configuration, covering cache sizing, lock timeouts,
/// checkpointing, attribute indexes, and change-log replication.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base directory for the filesystem backend (or the KV engine's data
    /// directory for the transactional backend).
    pub directory: PathBuf,
    /// Upper bound on cached entries.
    pub cachesize: usize,
    /// KV lock acquisition timeout.
    pub idletimeout: Duration,
    /// Checkpoint trigger, if periodic checkpointing is enabled.
    pub checkpoint: Option<CheckpointPolicy>,
    /// Configured attribute indexes.
    pub indexes: Vec<IndexConfig>,
    /// Change-log destination path.
    pub replogfile: Option<PathBuf>,
    /// Configured replicas for change-log filtering.
    pub replicas: Vec<ReplicaConfig>,
    /// Maximum deadlock-retry attempts before the write orchestrator gives
    /// up and surfaces the last retryable error as `Other`. `None` means
    /// unbounded retries, matching back-bdb's own `goto retry` loop, which
    /// has no built-in attempt cap.
    pub max_retries: Option<u32>,
}

impl BackendConfig {
    /// Start a builder rooted at the given base directory, with
    /// conservative defaults for everything else.
    pub fn builder(directory: impl Into<PathBuf>) -> BackendConfigBuilder {
        BackendConfigBuilder {
            directory: directory.into(),
            cachesize: 10_000,
            idletimeout: Duration::from_secs(30),
            checkpoint: None,
            indexes: Vec::new(),
            replogfile: None,
            replicas: Vec::new(),
            max_retries: None,
        }
    }
}

/// Builder for [`BackendConfig`].
#[derive(Debug, Clone)]
pub struct BackendConfigBuilder {
    directory: PathBuf,
    cachesize: usize,
    idletimeout: Duration,
    checkpoint: Option<CheckpointPolicy>,
    indexes: Vec<IndexConfig>,
    replogfile: Option<PathBuf>,
    replicas: Vec<ReplicaConfig>,
    max_retries: Option<u32>,
}

impl BackendConfigBuilder {
    /// Override the cache size bound.
    pub fn cachesize(mut self, size: usize) -> Self {
        self.cachesize = size;
        self
    }

    /// Override the KV lock acquisition timeout.
    pub fn idletimeout(mut self, timeout: Duration) -> Self {
        self.idletimeout = timeout;
        self
    }

    /// Enable periodic checkpointing.
    pub fn checkpoint(mut self, kbyte: u64, min_minutes: u64) -> Self {
        self.checkpoint = Some(CheckpointPolicy { kbyte, min_minutes });
        self
    }

    /// Register an attribute index.
    pub fn index(mut self, attribute: impl Into<String>, kinds: Vec<IndexKind>) -> Self {
        self.indexes.push(IndexConfig { attribute: attribute.into(), kinds });
        self
    }

    /// Set the change-log destination.
    pub fn replogfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.replogfile = Some(path.into());
        self
    }

    /// Register a replica filter.
    pub fn replica(mut self, uri: impl Into<String>, suffixes: Vec<String>) -> Self {
        self.replicas.push(ReplicaConfig { uri: uri.into(), suffixes });
        self
    }

    /// Cap the write orchestrator's deadlock-retry loop.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Finalize.
    pub fn build(self) -> BackendConfig {
        BackendConfig {
            directory: self.directory,
            cachesize: self.cachesize,
            idletimeout: self.idletimeout,
            checkpoint: self.checkpoint,
            indexes: self.indexes,
            replogfile: self.replogfile,
            replicas: self.replicas,
            max_retries: self.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded_retries_and_no_checkpoint() {
        let cfg = BackendConfig::builder("/tmp/dir").build();
        assert_eq!(cfg.max_retries, None);
        assert!(cfg.checkpoint.is_none());
        assert_eq!(cfg.cachesize, 10_000);
    }

    #[test]
    fn builder_applies_overrides() {
        let cfg = BackendConfig::builder("/tmp/dir")
            .cachesize(500)
            .checkpoint(1024, 5)
            .max_retries(8)
            .index("cn", vec![IndexKind::Eq, IndexKind::Sub])
            .replica("ldap://replica1", vec!["dc=example,dc=com".into()])
            .build();
        assert_eq!(cfg.cachesize, 500);
        assert_eq!(cfg.max_retries, Some(8));
        assert_eq!(cfg.indexes.len(), 1);
        assert_eq!(cfg.replicas.len(), 1);
        assert_eq!(cfg.checkpoint.unwrap().kbyte, 1024);
    }
}
