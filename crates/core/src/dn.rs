//! Distinguished names and their relative components.
//!
//! A [`Dn`] is a sequence of [`Rdn`]s, most-specific first, exactly as it
//! would be written out (`cn=alice,ou=people,dc=example,dc=com`). We keep
//! both the original and a normalized form on each component, the same
//! split the entry model keeps for attribute values.

use std::fmt;

use smallvec::SmallVec;

/// Inline storage for RDN sequences: four components covers the common
/// case (`cn=...,ou=...,dc=...,dc=...`) without a heap allocation.
type RdnSeq = SmallVec<[Rdn; 4]>;

/// A single relative distinguished name component, e.g. `cn=alice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rdn {
    /// Attribute type as written, e.g. `cn`.
    pub attr: String,
    /// Attribute value as written, e.g. `alice`.
    pub value: String,
    /// Lowercased, whitespace-collapsed form used for comparisons.
    normalized: String,
}

impl Rdn {
    /// Build an RDN from an attribute/value pair, computing its normal form.
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        let attr = attr.into();
        let value = value.into();
        let normalized = normalize_component(&attr, &value);
        Rdn { attr, value, normalized }
    }

    /// The normalized `attr=value` form used for equality and hashing.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr, self.value)
    }
}

fn normalize_component(attr: &str, value: &str) -> String {
    let mut s = String::with_capacity(attr.len() + value.len() + 1);
    s.push_str(&attr.to_ascii_lowercase());
    s.push('=');
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    s.push_str(&collapsed.to_ascii_lowercase());
    s
}

/// A distinguished name: an ordered list of RDNs, most-specific first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Dn {
    rdns: RdnSeq,
}

impl Dn {
    /// The empty DN (the root of the tree).
    pub fn root() -> Self {
        Dn { rdns: RdnSeq::new() }
    }

    /// Build a DN from its RDN components, most-specific first.
    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Dn { rdns: rdns.into() }
    }

    /// Parse a comma-separated DN string. Does not unescape RFC 4514
    /// sequences beyond a plain split — escaping is handled by the name
    /// codec when mapping to/from filesystem paths, not here.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return Some(Dn::root());
        }
        let mut rdns = RdnSeq::new();
        for part in split_unescaped(s, ',') {
            let part = part.trim();
            let eq = find_unescaped(part, '=')?;
            let attr = part[..eq].trim().to_string();
            let value = part[eq + 1..].trim().to_string();
            if attr.is_empty() {
                return None;
            }
            rdns.push(Rdn::new(attr, value));
        }
        Some(Dn { rdns })
    }

    /// True if this DN has no components (the root/suffix entry above all
    /// others).
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The leaf (most specific) RDN, if any.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// The parent DN, or `None` if this is already the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn { rdns: RdnSeq::from_slice(&self.rdns[1..]) })
        }
    }

    /// Build the immediate child DN for a given leaf RDN.
    pub fn child(&self, leaf: Rdn) -> Dn {
        let mut rdns = RdnSeq::with_capacity(self.rdns.len() + 1);
        rdns.push(leaf);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// Number of RDN components (the DN's depth in the tree).
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Iterate components most-specific first.
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// True if `self` is equal to or a descendant of `base` (i.e. `base`'s
    /// RDN sequence is a suffix of `self`'s). Mirrors back-ldif/back-bdb's
    /// `be_issuffix`.
    pub fn is_suffix_of(&self, base: &Dn) -> bool {
        if base.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(base.rdns.iter())
            .all(|(a, b)| a.normalized() == b.normalized())
    }

    /// Normalized string form, suitable as a cache/index key.
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(|r| r.normalized().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.rdns.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] as char == needle {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] as char == sep {
            parts.push(&s[start..i]);
            i += 1;
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}
