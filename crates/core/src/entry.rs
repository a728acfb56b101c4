//! In-memory entry representation and its line-oriented textual
//! serialization, grounded in back-ldif/ldif.c's `ldif_write_entry` /
//! `ldif_read_entry` (LDIF-style `attr: value` lines, continuation and
//! Base64-escape rules).

use std::collections::BTreeMap;

use crate::dn::Dn;

/// A 32-bit entry identifier. Immutable for an entry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u32);

impl EntryId {
    /// Big-endian bytes, the key form used by the ID→entry store.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Reconstruct from the big-endian key bytes.
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        EntryId(u32::from_be_bytes(bytes))
    }
}

/// Bit flags derived from an entry's `objectClass` values, cached on the
/// entry so the write orchestrator and filesystem backend don't re-parse
/// `objectClass` on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectClassFlags(u32);

impl ObjectClassFlags {
    /// Entry has no special structural role.
    pub const NONE: ObjectClassFlags = ObjectClassFlags(0);
    /// Entry is a referral (`objectClass: referral`).
    pub const REFERRAL: ObjectClassFlags = ObjectClassFlags(1 << 0);
    /// Entry is an alias (`objectClass: alias`).
    pub const ALIAS: ObjectClassFlags = ObjectClassFlags(1 << 1);
    /// Entry is a subentry (`objectClass: subentry`).
    pub const SUBENTRY: ObjectClassFlags = ObjectClassFlags(1 << 2);
    /// Entry is an administrative point eligible to parent subentries.
    pub const ADMIN_POINT: ObjectClassFlags = ObjectClassFlags(1 << 3);
    /// Entry is a glue/placeholder ancestor created to keep the tree
    /// connected (back-bdb's `is_entry_glue`).
    pub const GLUE: ObjectClassFlags = ObjectClassFlags(1 << 4);

    /// Bitwise union.
    pub fn union(self, other: ObjectClassFlags) -> ObjectClassFlags {
        ObjectClassFlags(self.0 | other.0)
    }

    /// True if every bit set in `flag` is set in `self`.
    pub fn contains(self, flag: ObjectClassFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Derive flags from a set of `objectClass` values (case-insensitive).
    pub fn from_object_classes<'a>(values: impl Iterator<Item = &'a str>) -> Self {
        let mut flags = ObjectClassFlags::NONE;
        for v in values {
            match v.to_ascii_lowercase().as_str() {
                "referral" => flags = flags.union(ObjectClassFlags::REFERRAL),
                "alias" => flags = flags.union(ObjectClassFlags::ALIAS),
                "subentry" => flags = flags.union(ObjectClassFlags::SUBENTRY),
                _ => {}
            }
        }
        flags
    }
}

/// A single attribute's multi-valued contents, preserving insertion order
/// of values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeValues(pub Vec<Vec<u8>>);

impl AttributeValues {
    /// Wrap a single value.
    pub fn single(value: impl Into<Vec<u8>>) -> Self {
        AttributeValues(vec![value.into()])
    }
}

/// A directory entry: an ordered attribute bag plus its identity and
/// derived flags.
#[derive(Debug, Clone)]
pub struct Entry {
    id: EntryId,
    /// DN as originally supplied (casing/whitespace preserved).
    dn: Dn,
    /// Attribute order as first inserted; values indexed by lowercase
    /// attribute name in `attrs`, but we keep an explicit order vector
    /// since attribute ordering on serialization is otherwise
    /// unspecified-but-should-be-stable for diffability.
    order: Vec<String>,
    attrs: BTreeMap<String, AttributeValues>,
    flags: ObjectClassFlags,
}

impl Entry {
    /// Build a new entry with no attributes set.
    pub fn new(id: EntryId, dn: Dn) -> Self {
        Entry { id, dn, order: Vec::new(), attrs: BTreeMap::new(), flags: ObjectClassFlags::NONE }
    }

    /// The entry's immutable ID.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Attach an ID allocated after construction. The write orchestrator
    /// builds an `Entry` before the ID allocator hands out an ID (callers supply a
    /// placeholder), then calls this once allocation succeeds; nothing
    /// else may change an entry's ID once it has been persisted.
    pub fn set_id(&mut self, id: EntryId) {
        self.id = id;
    }

    /// The entry's DN.
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Rename in place (modrdn support); callers are responsible for
    /// index/cache consistency.
    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// Derived object-class flags.
    pub fn flags(&self) -> ObjectClassFlags {
        self.flags
    }

    /// True if this entry is a glue/placeholder ancestor.
    pub fn is_glue(&self) -> bool {
        self.flags.contains(ObjectClassFlags::GLUE)
    }

    /// Mark (or unmark) this entry as glue.
    pub fn set_glue(&mut self, glue: bool) {
        if glue {
            self.flags = self.flags.union(ObjectClassFlags::GLUE);
        } else {
            self.flags = ObjectClassFlags(self.flags.0 & !ObjectClassFlags::GLUE.0);
        }
    }

    /// Set (replacing) an attribute's values, recomputing derived flags
    /// when the attribute is `objectClass`.
    pub fn set_attr(&mut self, name: impl Into<String>, values: AttributeValues) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        if !self.attrs.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.attrs.insert(key.clone(), values);
        if key == "objectclass" {
            self.recompute_flags();
        }
    }

    /// Append values to an existing (or new) attribute.
    pub fn add_values(&mut self, name: &str, mut values: Vec<Vec<u8>>) {
        let key = name.to_ascii_lowercase();
        let entry = self.attrs.entry(key.clone()).or_insert_with(|| {
            self.order.push(key.clone());
            AttributeValues::default()
        });
        entry.0.append(&mut values);
        if key == "objectclass" {
            self.recompute_flags();
        }
    }

    /// Remove an attribute entirely. Returns true if it was present.
    pub fn remove_attr(&mut self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        let removed = self.attrs.remove(&key).is_some();
        self.order.retain(|k| k != &key);
        if removed && key == "objectclass" {
            self.recompute_flags();
        }
        removed
    }

    /// Read an attribute's values, if present.
    pub fn get_attr(&self, name: &str) -> Option<&AttributeValues> {
        self.attrs.get(&name.to_ascii_lowercase())
    }

    /// Iterate attributes in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValues)> {
        self.order.iter().map(move |k| (k.as_str(), &self.attrs[k]))
    }

    fn recompute_flags(&mut self) {
        let was_glue = self.flags.contains(ObjectClassFlags::GLUE);
        let mut flags = ObjectClassFlags::NONE;
        if let Some(ocs) = self.attrs.get("objectclass") {
            let strs: Vec<String> =
                ocs.0.iter().map(|v| String::from_utf8_lossy(v).into_owned()).collect();
            flags = ObjectClassFlags::from_object_classes(strs.iter().map(|s| s.as_str()));
        }
        if was_glue {
            flags = flags.union(ObjectClassFlags::GLUE);
        }
        self.flags = flags;
    }
}

/// True if a byte requires Base64 encoding per LDIF "safe string" rules:
/// not NUL/LF/CR, not starting with a space/colon/less-than, and
/// 7-bit-clean throughout.
fn value_is_safe(value: &[u8]) -> bool {
    if value.is_empty() {
        return true;
    }
    match value[0] {
        b' ' | b':' | b'<' => return false,
        _ => {}
    }
    value.iter().all(|&b| b != 0 && b != b'\n' && b != b'\r' && b < 0x80)
}

const WRAP_COLUMN: usize = 76;

/// The largest byte index `<= idx` that lands on a UTF-8 char boundary of
/// `s`. Used so folding never slices a multi-byte codepoint in half — a
/// `dn:` line routed through this wrapper isn't guaranteed ASCII the way
/// a safe-string attribute value is.
fn char_boundary_at_or_before(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn push_wrapped_line(out: &mut String, line: &str) {
    if line.len() <= WRAP_COLUMN {
        out.push_str(line);
        out.push('\n');
        return;
    }
    let first_end = char_boundary_at_or_before(line, WRAP_COLUMN);
    out.push_str(&line[..first_end]);
    out.push('\n');
    let mut pos = first_end;
    while pos < line.len() {
        let end = char_boundary_at_or_before(line, pos + WRAP_COLUMN - 1);
        out.push(' ');
        out.push_str(&line[pos..end]);
        out.push('\n');
        pos = end;
    }
}

/// Serialize only the entry's RDN-relative attribute set into LDIF form.
/// The caller supplies a fresh scratch buffer — per design note, there is
/// no process-wide mutex here; each call owns its own `String`.
pub fn entry_to_ldif(entry: &Entry) -> String {
    let mut out = String::new();
    for (attr, values) in entry.iter() {
        for value in &values.0 {
            if value_is_safe(value) {
                let text = String::from_utf8_lossy(value);
                push_wrapped_line(&mut out, &format!("{attr}: {text}"));
            } else {
                let encoded = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    value,
                );
                push_wrapped_line(&mut out, &format!("{attr}:: {encoded}"));
            }
        }
    }
    out
}

/// Errors from parsing LDIF text into attribute/value pairs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LdifParseError {
    /// A line was neither a valid `attr: value` line nor a continuation.
    #[error("malformed line {0}: {1:?}")]
    MalformedLine(usize, String),
    /// A `::`-marked value failed Base64 decoding.
    #[error("invalid base64 on line {0}")]
    InvalidBase64(usize),
}

/// Parse LDIF text (as written by [`entry_to_ldif`]) into an ordered list
/// of `(attribute, value)` pairs. Deserialization is pure: it performs no
/// I/O and touches no shared state.
pub fn parse_ldif(text: &str) -> Result<Vec<(String, Vec<u8>)>, LdifParseError> {
    let mut pairs = Vec::new();
    let mut unfolded: Vec<String> = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        if raw.starts_with(' ') {
            match unfolded.last_mut() {
                Some(last) => last.push_str(&raw[1..]),
                None => return Err(LdifParseError::MalformedLine(lineno, raw.to_string())),
            }
        } else if raw.is_empty() {
            continue;
        } else {
            unfolded.push(raw.to_string());
        }
    }

    for (lineno, line) in unfolded.iter().enumerate() {
        if let Some(colon) = line.find(':') {
            let attr = line[..colon].to_string();
            let rest = &line[colon + 1..];
            if let Some(b64) = rest.strip_prefix(':') {
                let b64 = b64.trim_start();
                let decoded = base64::Engine::decode(
                    &base64::engine::general_purpose::STANDARD,
                    b64,
                )
                .map_err(|_| LdifParseError::InvalidBase64(lineno))?;
                pairs.push((attr, decoded));
            } else {
                let value = rest.strip_prefix(' ').unwrap_or(rest);
                pairs.push((attr, value.as_bytes().to_vec()));
            }
        } else {
            return Err(LdifParseError::MalformedLine(lineno, line.clone()));
        }
    }
    Ok(pairs)
}

/// Serialize an entry's DN plus its attribute set into LDIF form, the
/// shape the transactional backend's ID→entry store persists:
/// back-bdb's `id2entry` keeps the `dn:` line alongside the attributes so
/// a record is self-describing without consulting the name index.
pub fn entry_to_full_ldif(entry: &Entry) -> String {
    let mut out = String::new();
    push_wrapped_line(&mut out, &format!("dn: {}", entry.dn()));
    out.push_str(&entry_to_ldif(entry));
    out
}

/// Inverse of [`entry_to_full_ldif`]: parse a stored record back into an
/// `Entry` carrying the given ID (the ID itself is never encoded in the
/// body: it's the store's key).
pub fn parse_full_ldif(id: EntryId, text: &str) -> Result<Entry, LdifParseError> {
    let pairs = parse_ldif(text)?;
    let mut dn = Dn::root();
    let mut entry = None;
    for (attr, value) in pairs {
        if attr.eq_ignore_ascii_case("dn") && entry.is_none() {
            let dn_str = String::from_utf8_lossy(&value).into_owned();
            dn = Dn::parse(&dn_str).ok_or(LdifParseError::MalformedLine(0, dn_str))?;
            entry = Some(Entry::new(id, dn.clone()));
            continue;
        }
        let e = entry.get_or_insert_with(|| Entry::new(id, dn.clone()));
        e.add_values(&attr, vec![value]);
    }
    Ok(entry.unwrap_or_else(|| Entry::new(id, dn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        let dn = Dn::parse("cn=alice,dc=example,dc=com").unwrap();
        let mut e = Entry::new(EntryId(7), dn);
        e.set_attr("objectClass", AttributeValues(vec![b"person".to_vec()]));
        e.set_attr("cn", AttributeValues::single("alice"));
        e.set_attr("description", AttributeValues::single(vec![0xff, 0x00, 0x41]));
        e
    }

    #[test]
    fn round_trips_safe_and_unsafe_values() {
        let entry = sample_entry();
        let text = entry_to_ldif(&entry);
        let parsed = parse_ldif(&text).unwrap();
        let cn = parsed.iter().find(|(a, _)| a == "cn").unwrap();
        assert_eq!(cn.1, b"alice");
        let desc = parsed.iter().find(|(a, _)| a == "description").unwrap();
        assert_eq!(desc.1, vec![0xff, 0x00, 0x41]);
    }

    #[test]
    fn object_class_flags_derived_on_set() {
        let dn = Dn::parse("cn=ref,dc=example,dc=com").unwrap();
        let mut e = Entry::new(EntryId(1), dn);
        e.set_attr(
            "objectClass",
            AttributeValues(vec![b"referral".to_vec(), b"top".to_vec()]),
        );
        assert!(e.flags().contains(ObjectClassFlags::REFERRAL));
    }

    #[test]
    fn long_values_wrap_at_column() {
        let dn = Dn::parse("cn=x,dc=example,dc=com").unwrap();
        let mut e = Entry::new(EntryId(2), dn);
        let long = "a".repeat(200);
        e.set_attr("description", AttributeValues::single(long.clone()));
        let text = entry_to_ldif(&e);
        assert!(text.lines().count() > 1);
        let parsed = parse_ldif(&text).unwrap();
        assert_eq!(String::from_utf8(parsed[0].1.clone()).unwrap(), long);
    }

    #[test]
    fn long_multibyte_dn_wraps_without_splitting_a_codepoint() {
        let rdn_value: String = "café".repeat(20);
        let dn = Dn::parse(&format!("cn={rdn_value},dc=example,dc=com")).unwrap();
        let e = Entry::new(EntryId(4), dn);
        let text = entry_to_full_ldif(&e);
        assert!(text.is_char_boundary(0));
        for line in text.lines() {
            assert!(std::str::from_utf8(line.as_bytes()).is_ok());
        }
        assert!(text.contains(&rdn_value[..4]));
    }

    #[test]
    fn glue_flag_survives_object_class_recompute() {
        let dn = Dn::parse("ou=mid,dc=example,dc=com").unwrap();
        let mut e = Entry::new(EntryId(3), dn);
        e.set_glue(true);
        e.set_attr("objectClass", AttributeValues(vec![b"organizationalUnit".to_vec()]));
        assert!(e.is_glue());
    }

    #[test]
    fn full_ldif_round_trips_dn_and_attributes() {
        let entry = sample_entry();
        let text = entry_to_full_ldif(&entry);
        assert!(text.starts_with("dn: cn=alice,dc=example,dc=com"));
        let parsed = parse_full_ldif(EntryId(7), &text).unwrap();
        assert_eq!(parsed.dn().normalized(), entry.dn().normalized());
        assert_eq!(parsed.get_attr("cn").unwrap().0[0], b"alice");
        assert_eq!(parsed.id(), EntryId(7));
    }

    #[test]
    fn set_id_reassigns_after_construction() {
        let mut e = sample_entry();
        e.set_id(EntryId(42));
        assert_eq!(e.id(), EntryId(42));
    }
}
