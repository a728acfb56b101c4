//! Filesystem backend: the directory hierarchy maps onto a
//! filesystem subtree, one `.ldif` file per entry plus a same-named
//! directory (minus the suffix) for any children. Grounded in full in
//! back-ldif/ldif.c (`ldif_back_add`/`modify`/`delete`/`modrdn`/`bind`/
//! `search`, `ldif_back_referrals`, `ldif_move_entry`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use dirstore_core::{
    entry_to_ldif, parse_ldif, AttributeValues, DirError, Dn, Entry, EntryId, ObjectClassFlags,
    PasswordVerifier, Platform,
};
pub use dirstore_core::Scope;
use dirstore_durability::{apply_mod, ChangeLogWriter, ChangeOp, CsnGenerator, ModSpec};

use crate::atomic::write_atomic;
use crate::path::{container_path, entry_path, path_to_dn};

/// Outcome of resolving a DN against the filesystem backend.
pub enum Lookup {
    /// The entry was found at the exact DN.
    Found(Entry),
    /// The exact DN is missing, but an ancestor is a referral.
    Referral {
        /// DN of the referral entry actually matched.
        matched_dn: Dn,
        /// Referral URLs carried by that entry's `ref` attribute.
        urls: Vec<String>,
    },
}

/// Filesystem-backed directory storage rooted at `base`, serving a single
/// configured `suffix`.
pub struct FsBackend {
    base: PathBuf,
    suffix: Dn,
    platform: Platform,
    lock: RwLock<()>,
    verifier: Arc<dyn PasswordVerifier>,
    changelog: Option<ChangeLogWriter>,
    csn: CsnGenerator,
}

/// Entries get a synthetic ID of zero on this backend: identity here is
/// the DN/path, and nothing on this path consults the ID (unlike the
/// transactional backend, where the name index, entry store, and cache
/// are all ID-keyed).
const FS_ENTRY_ID: EntryId = EntryId(0);

impl FsBackend {
    /// Open a backend rooted at `base`, serving `suffix`.
    pub fn new(
        base: impl Into<PathBuf>,
        suffix: Dn,
        platform: Platform,
        verifier: Arc<dyn PasswordVerifier>,
        changelog: Option<ChangeLogWriter>,
    ) -> Self {
        FsBackend {
            base: base.into(),
            suffix,
            platform,
            lock: RwLock::new(()),
            verifier,
            changelog,
            csn: CsnGenerator::default(),
        }
    }

    fn entry_file(&self, dn: &Dn) -> PathBuf {
        entry_path(&self.base, self.platform, dn)
    }

    fn container_dir(&self, dn: &Dn) -> PathBuf {
        container_path(&self.base, self.platform, dn)
    }

    fn read_entry_file(&self, path: &Path, dn: &Dn) -> Result<Entry, DirError> {
        let text = fs::read_to_string(path).map_err(|e| DirError::io_at(path, e))?;
        let pairs = parse_ldif(&text)
            .map_err(|e| DirError::UnwillingToPerform(format!("malformed entry: {e}")))?;
        let mut entry = Entry::new(FS_ENTRY_ID, dn.clone());
        for (attr, value) in pairs {
            entry.add_values(&attr, vec![value]);
        }
        Ok(entry)
    }

    /// Look up the exact entry at `dn`, without following referrals.
    fn lookup_exact(&self, dn: &Dn) -> Option<Entry> {
        let path = self.entry_file(dn);
        if !path.is_file() {
            return None;
        }
        self.read_entry_file(&path, dn).ok()
    }

    /// Walk ancestors looking for a referral entry, bounded by `suffix`
    /// (mirrors `ldif_back_referrals`' `min_dnlen` bound).
    fn referral_walk(&self, dn: &Dn) -> Option<(Dn, Vec<String>)> {
        let mut current = dn.parent()?;
        loop {
            if let Some(entry) = self.lookup_exact(&current) {
                if entry.flags().contains(ObjectClassFlags::REFERRAL) {
                    let urls = entry
                        .get_attr("ref")
                        .map(|v| {
                            v.0.iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect()
                        })
                        .unwrap_or_default();
                    return Some((current, urls));
                }
            }
            if !current.is_suffix_of(&self.suffix) || current == self.suffix {
                return None;
            }
            current = current.parent()?;
        }
    }

    /// Resolve `dn`, returning either the entry or a referral result
    /// (never `NoSuchObject` directly here — callers map a `None` lookup
    /// with no referral ancestor to `NoSuchObject`).
    pub fn lookup(&self, dn: &Dn) -> Result<Lookup, DirError> {
        let _guard = self.lock.read();
        if let Some(entry) = self.lookup_exact(dn) {
            return Ok(Lookup::Found(entry));
        }
        if let Some((matched_dn, urls)) = self.referral_walk(dn) {
            return Ok(Lookup::Referral { matched_dn, urls });
        }
        Err(DirError::NoSuchObject(dn.to_string()))
    }

    /// Add a new entry. Fails `AlreadyExists` if the DN already resolves,
    /// `NoSuchObject` if the parent is missing (unless `dn` is the
    /// suffix).
    pub fn add(&self, entry: &Entry) -> Result<(), DirError> {
        let _guard = self.lock.write();
        let dn = entry.dn();

        if self.entry_file(dn).is_file() {
            return Err(DirError::AlreadyExists(dn.to_string()));
        }
        if dn != &self.suffix {
            let parent = dn.parent().ok_or_else(|| DirError::NoSuchObject(dn.to_string()))?;
            if !self.entry_file(&parent).is_file() {
                return Err(DirError::NoSuchObject(parent.to_string()));
            }
        }

        let ldif = entry_to_ldif(entry);
        write_atomic(&self.entry_file(dn), ldif.as_bytes()).map_err(|e| DirError::io_at(self.entry_file(dn), e))?;

        if let Some(log) = &self.changelog {
            let _ = log.record(dn, &ChangeOp::Add { entry_ldif: ldif });
        }
        tracing::debug!(dn = %dn, "fs backend: add");
        Ok(())
    }

    /// Apply a mod-list to the entry at `dn`, rewriting its file
    /// atomically. Mirrors the transactional backend's modify in effect,
    /// but without index maintenance: this backend has no id2entry/
    /// attribute index to keep in step, only the file itself.
    pub fn modify(&self, dn: &Dn, mods: Vec<ModSpec>) -> Result<(), DirError> {
        let _guard = self.lock.write();
        let file = self.entry_file(dn);
        let mut entry =
            self.read_entry_file(&file, dn).map_err(|_| DirError::NoSuchObject(dn.to_string()))?;

        for spec in &mods {
            apply_mod(&mut entry, spec)?;
        }
        entry.set_attr("modifyTimestamp", AttributeValues::single(self.csn.next()));
        entry.set_attr("entryCSN", AttributeValues::single(self.csn.next()));

        let ldif = entry_to_ldif(&entry);
        write_atomic(&file, ldif.as_bytes()).map_err(|e| DirError::io_at(&file, e))?;

        if let Some(log) = &self.changelog {
            let _ = log.record(dn, &ChangeOp::Modify { changes: mods });
        }
        tracing::debug!(dn = %dn, "fs backend: modify");
        Ok(())
    }

    /// Delete the entry at `dn`. Fails `NotAllowedOnNonLeaf` if its
    /// children directory still has entries.
    pub fn delete(&self, dn: &Dn) -> Result<(), DirError> {
        let _guard = self.lock.write();
        let file = self.entry_file(dn);
        if !file.is_file() {
            return Err(DirError::NoSuchObject(dn.to_string()));
        }
        let children_dir = self.container_dir(dn);
        if children_dir.is_dir() {
            let has_children = fs::read_dir(&children_dir)
                .map_err(|e| DirError::io_at(&children_dir, e))?
                .next()
                .is_some();
            if has_children {
                return Err(DirError::NotAllowedOnNonLeaf);
            }
            fs::remove_dir(&children_dir).map_err(|e| DirError::io_at(&children_dir, e))?;
        }
        fs::remove_file(&file).map_err(|e| DirError::io_at(&file, e))?;

        if let Some(log) = &self.changelog {
            let _ = log.record(dn, &ChangeOp::Delete);
        }
        tracing::debug!(dn = %dn, "fs backend: delete");
        Ok(())
    }

    /// Rename (and optionally re-parent) the entry at `dn`.
    pub fn modrdn(
        &self,
        dn: &Dn,
        new_rdn_attr: &str,
        new_rdn_value: &str,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> Result<(), DirError> {
        let _guard = self.lock.write();
        let old_file = self.entry_file(dn);
        let mut entry = self
            .read_entry_file(&old_file, dn)
            .map_err(|_| DirError::NoSuchObject(dn.to_string()))?;

        let new_rdn = dirstore_core::Rdn::new(new_rdn_attr, new_rdn_value);
        let parent = match new_superior {
            Some(sup) => sup.clone(),
            None => dn.parent().unwrap_or_else(Dn::root),
        };
        let new_dn = parent.child(new_rdn.clone());

        if self.entry_file(&new_dn).is_file() {
            return Err(DirError::AlreadyExists(new_dn.to_string()));
        }

        if delete_old_rdn {
            if let Some(old_rdn) = dn.rdn() {
                if let Some(values) = entry.get_attr(&old_rdn.attr).cloned() {
                    let filtered: Vec<Vec<u8>> = values
                        .0
                        .into_iter()
                        .filter(|v| v.as_slice() != old_rdn.value.as_bytes())
                        .collect();
                    entry.set_attr(old_rdn.attr.clone(), AttributeValues(filtered));
                }
            }
        }
        entry.add_values(new_rdn_attr, vec![new_rdn_value.as_bytes().to_vec()]);
        entry.set_dn(new_dn.clone());

        let ldif = entry_to_ldif(&entry);
        let new_file = self.entry_file(&new_dn);
        write_atomic(&new_file, ldif.as_bytes()).map_err(|e| DirError::io_at(&new_file, e))?;

        let old_children_dir = self.container_dir(dn);
        let new_children_dir = self.container_dir(&new_dn);
        let moved_dir = if old_children_dir.is_dir() {
            if let Some(parent_dir) = new_children_dir.parent() {
                fs::create_dir_all(parent_dir).map_err(|e| DirError::io_at(parent_dir, e))?;
            }
            match fs::rename(&old_children_dir, &new_children_dir) {
                Ok(()) => true,
                Err(e) => {
                    let _ = fs::remove_file(&new_file);
                    return Err(DirError::io_at(&old_children_dir, e));
                }
            }
        } else {
            false
        };

        if let Err(e) = fs::remove_file(&old_file) {
            if moved_dir {
                let _ = fs::rename(&new_children_dir, &old_children_dir);
            }
            let _ = fs::remove_file(&new_file);
            return Err(DirError::io_at(&old_file, e));
        }

        if let Some(log) = &self.changelog {
            let _ = log.record(
                dn,
                &ChangeOp::ModRdn {
                    new_rdn: new_rdn.to_string(),
                    delete_old_rdn,
                    new_superior: new_superior.map(|s| s.to_string()),
                },
            );
        }
        tracing::debug!(dn = %dn, new_dn = %new_dn, "fs backend: modrdn");
        Ok(())
    }

    /// Verify a bind credential against the stored `userPassword`.
    pub fn bind(&self, dn: &Dn, credentials: &[u8]) -> Result<(), DirError> {
        let entry = self.lookup_exact(dn).ok_or(DirError::InvalidCredentials)?;
        let stored = entry.get_attr("userPassword").ok_or(DirError::InappropriateAuth)?;
        let ok = stored.0.iter().any(|v| self.verifier.verify(v, credentials));
        if ok {
            Ok(())
        } else {
            Err(DirError::InvalidCredentials)
        }
    }

    fn numeric_prefix(name: &str) -> Option<i64> {
        let bytes = name.as_bytes();
        if bytes.first() != Some(&b'{') {
            return None;
        }
        let end = name.find('}')?;
        name[1..end].parse().ok()
    }

    fn sorted_children(&self, dir: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|ext| ext == "ldif").unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            let an = a.file_name().unwrap().to_string_lossy().into_owned();
            let bn = b.file_name().unwrap().to_string_lossy().into_owned();
            let anum = Self::numeric_prefix(&an);
            let bnum = Self::numeric_prefix(&bn);
            (anum, an).partial_cmp(&(bnum, bn)).unwrap()
        });
        entries
    }

    fn collect_recursive(
        &self,
        dn: &Dn,
        scope: Scope,
        include_self: bool,
        out: &mut Vec<Entry>,
    ) {
        if include_self {
            if let Some(entry) = self.lookup_exact(dn) {
                out.push(entry);
            }
        }
        if matches!(scope, Scope::Base) {
            return;
        }
        let dir = self.container_dir(dn);
        if !dir.is_dir() {
            return;
        }
        for path in self.sorted_children(&dir) {
            let Some(child_dn) = path_to_dn(&self.base, self.platform, &path) else { continue };
            self.collect_recursive(&child_dn, scope.child_scope(), true, out);
        }
    }

    /// Search under `base_dn` within `scope`, applying `filter` to each
    /// candidate entry (attrs selection and manageDSAit are a front-end
    /// concern, out of scope here).
    pub fn search(
        &self,
        base_dn: &Dn,
        scope: Scope,
        filter: impl Fn(&Entry) -> bool,
    ) -> Result<Vec<Entry>, DirError> {
        let _guard = self.lock.read();
        if self.lookup_exact(base_dn).is_none() {
            if let Some((matched_dn, urls)) = self.referral_walk(base_dn) {
                return Err(DirError::Referral { matched_dn: matched_dn.to_string(), urls });
            }
            return Err(DirError::NoSuchObject(base_dn.to_string()));
        }

        let mut all = Vec::new();
        self.collect_recursive(base_dn, scope, scope.includes_base(), &mut all);
        Ok(all.into_iter().filter(|e| filter(e)).collect())
    }

    /// Base directory this backend is rooted at.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Configured suffix.
    pub fn suffix(&self) -> &Dn {
        &self.suffix
    }

    /// The name-codec platform this backend encodes paths with.
    pub fn platform(&self) -> Platform {
        self.platform
    }
}
