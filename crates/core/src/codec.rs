//! Bijective mapping between normalized DN components and filesystem-safe
//! path segments, grounded in back-ldif/ldif.c's `dn2path` and its
//! `LDIF_NEED_ESCAPE`/`LDIF_ESCAPE_CHAR`/index-bracket handling.
//!
//! The original hardcodes the escape alphabet behind `#ifdef _WIN32`. We
//! express the same two alphabets as a runtime-selectable [`Platform`]
//! instead of conditional compilation, so both round-trip under test on
//! any host.

use std::path::PathBuf;

use crate::dn::Dn;

/// Which filesystem naming convention a [`Platform`] assumes when
/// selecting the escape byte and index-bracket alternates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Backslash escape, `{`/`}` used unescaped as index brackets.
    Posix,
    /// Caret escape (backslash is itself unsafe on this family); index
    /// brackets get alternate glyphs since `{`/`}` are also escaped.
    Windows,
}

const INDEX_BRACKET_LEFT: u8 = b'{';
const INDEX_BRACKET_RIGHT: u8 = b'}';

impl Platform {
    fn escape_byte(self) -> u8 {
        match self {
            Platform::Posix => b'\\',
            Platform::Windows => b'^',
        }
    }

    /// Bytes this platform cannot place literally in a path segment.
    fn is_unsafe(self, b: u8) -> bool {
        match self {
            Platform::Posix => matches!(b, b'/' | 0),
            Platform::Windows => matches!(
                b,
                b'/' | b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|' | 0
            ),
        }
        || b < 0x20
    }
}

/// Escape a single raw byte as `E <hex-hi> <hex-lo>` using the platform's
/// escape byte.
fn push_escaped(out: &mut Vec<u8>, platform: Platform, b: u8) {
    out.push(platform.escape_byte());
    out.push(hex_digit(b >> 4));
    out.push(hex_digit(b & 0x0f));
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        10..=15 => b'a' + (nibble - 10),
        _ => unreachable!("nibble out of range"),
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Encode one normalized RDN (as raw bytes) into a filesystem-safe path
/// segment. Injective: distinct inputs never produce the same segment.
pub fn encode_rdn(platform: Platform, normalized: &[u8]) -> Vec<u8> {
    let escape = platform.escape_byte();
    let mut out = Vec::with_capacity(normalized.len() + 4);
    for &b in normalized {
        if b == escape {
            push_escaped(&mut out, platform, b);
        } else if b == INDEX_BRACKET_LEFT || b == INDEX_BRACKET_RIGHT {
            // Index brackets must round-trip literally so `{1}name`-style
            // ordering prefixes survive; only escape them when the
            // platform cannot place them literally (Windows permits `{`/`}`
            // in filenames, so no escaping is needed there either, but we
            // keep the branch so a future unsafe-brackets platform is a
            // one-line addition).
            out.push(b);
        } else if b == b'.' && out.is_empty() {
            // A leading '.' would collide with the `.ldif` suffix marker
            // or create a hidden-file segment; escape it specifically at
            // the front of a segment.
            push_escaped(&mut out, platform, b);
        } else if platform.is_unsafe(b) {
            push_escaped(&mut out, platform, b);
        } else {
            out.push(b);
        }
    }
    out
}

/// Decode a path segment back to its normalized byte form. Inverse of
/// [`encode_rdn`].
pub fn decode_segment(platform: Platform, segment: &[u8]) -> Option<Vec<u8>> {
    let escape = platform.escape_byte();
    let mut out = Vec::with_capacity(segment.len());
    let mut i = 0;
    while i < segment.len() {
        if segment[i] == escape {
            let hi = *segment.get(i + 1)?;
            let lo = *segment.get(i + 2)?;
            let byte = (hex_value(hi)? << 4) | hex_value(lo)?;
            out.push(byte);
            i += 3;
        } else {
            out.push(segment[i]);
            i += 1;
        }
    }
    Some(out)
}

/// The `.ldif` suffix every leaf entry file carries.
pub const ENTRY_FILE_SUFFIX: &str = ".ldif";

/// Map a DN onto a filesystem path rooted at `base`, walking RDNs from the
/// suffix outward and appending the `.ldif` suffix to the final segment.
/// Mirrors back-ldif's `dn2path`.
pub fn dn_to_path(platform: Platform, dn: &Dn, base: &PathBuf) -> PathBuf {
    let mut path = base.clone();
    let rdns: Vec<_> = dn.rdns().iter().rev().collect();
    for (idx, rdn) in rdns.iter().enumerate() {
        let encoded = encode_rdn(platform, rdn.normalized().as_bytes());
        let mut segment = String::from_utf8(encoded).expect("escape alphabet is ASCII-safe");
        if idx + 1 == rdns.len() {
            segment.push_str(ENTRY_FILE_SUFFIX);
        }
        path.push(segment);
    }
    path
}

/// Same as [`dn_to_path`] but without the trailing `.ldif` suffix, i.e. the
/// directory a DN's children live under.
pub fn dn_to_container_path(platform: Platform, dn: &Dn, base: &PathBuf) -> PathBuf {
    let mut path = base.clone();
    for rdn in dn.rdns().iter().rev() {
        let encoded = encode_rdn(platform, rdn.normalized().as_bytes());
        let segment = String::from_utf8(encoded).expect("escape alphabet is ASCII-safe");
        path.push(segment);
    }
    path
}
