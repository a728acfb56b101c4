//! Path <-> DN helpers layered over `dirstore_core::codec`, grounded in
//! back-ldif/ldif.c's `dn2path` and its inverse directory walk used by
//! `ldif_back_referrals`/`enum_tree`.

use std::path::{Path, PathBuf};

use dirstore_core::{dn_to_container_path, dn_to_path, Dn, Platform, Rdn};

/// Entry file suffix, re-exported for callers that need to strip it.
pub const ENTRY_SUFFIX: &str = ".ldif";

/// The `.ldif` file a DN's own entry lives at.
pub fn entry_path(base: &Path, platform: Platform, dn: &Dn) -> PathBuf {
    dn_to_path(platform, dn, &base.to_path_buf())
}

/// The directory a DN's children live under (no `.ldif` suffix).
pub fn container_path(base: &Path, platform: Platform, dn: &Dn) -> PathBuf {
    dn_to_container_path(platform, dn, &base.to_path_buf())
}

/// Reconstruct a DN from an entry's `.ldif` path, walking segments from
/// `base` down to the file and decoding each with the name codec. Only
/// the normalized form is recoverable this way: the entry's own attribute
/// values (read from the LDIF body) retain their original casing, but the
/// DN's RDN components do not.
pub fn path_to_dn(base: &Path, platform: Platform, path: &Path) -> Option<Dn> {
    let relative = path.strip_prefix(base).ok()?;
    let mut components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if components.is_empty() {
        return Some(Dn::root());
    }
    let last = components.last_mut()?;
    *last = last.strip_suffix(ENTRY_SUFFIX)?.to_string();

    let mut rdns = Vec::with_capacity(components.len());
    for segment in components.iter().rev() {
        let decoded = dirstore_core::decode_segment(platform, segment.as_bytes())?;
        let normalized = String::from_utf8(decoded).ok()?;
        let eq = normalized.find('=')?;
        rdns.push(Rdn::new(normalized[..eq].to_string(), normalized[eq + 1..].to_string()));
    }
    Some(Dn::from_rdns(rdns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trips_to_normalized_dn() {
        let base = PathBuf::from("/var/dir");
        let dn = Dn::parse("cn=Alice,ou=People,dc=example,dc=com").unwrap();
        let path = entry_path(&base, Platform::Posix, &dn);
        let recovered = path_to_dn(&base, Platform::Posix, &path).unwrap();
        assert_eq!(recovered.normalized(), dn.normalized());
    }

    #[test]
    fn root_path_is_root_dn() {
        let base = PathBuf::from("/var/dir");
        let recovered = path_to_dn(&base, Platform::Posix, &base).unwrap();
        assert!(recovered.is_root());
    }
}
