//! Property and example tests for the name codec and DN-to-path mapping
//! that are easier to express as whole-crate integration tests than as
//! inline unit tests: bijection under arbitrary input, and path-uniqueness
//! across RDN sequences of varying depth.

use proptest::prelude::*;

use dirstore_core::{decode_segment, dn_to_path, encode_rdn, Dn, Platform};

proptest! {
    #[test]
    fn encode_then_decode_recovers_original_bytes(bytes in proptest::collection::vec(0u8..=255, 0..64)) {
        for platform in [Platform::Posix, Platform::Windows] {
            let encoded = encode_rdn(platform, &bytes);
            let decoded = decode_segment(platform, &encoded)
                .expect("encoded segment must decode");
            prop_assert_eq!(decoded, bytes.clone());
        }
    }

    #[test]
    fn encoded_segment_never_decodes_to_dot_or_dotdot(bytes in proptest::collection::vec(1u8..=255, 1..32)) {
        for platform in [Platform::Posix, Platform::Windows] {
            let encoded = encode_rdn(platform, &bytes);
            prop_assert_ne!(encoded.as_slice(), b".");
            prop_assert_ne!(encoded.as_slice(), b"..");
        }
    }
}

#[test]
fn distinct_dns_map_to_distinct_paths() {
    let base = std::path::PathBuf::from("/var/dirstore/db");
    let a = Dn::parse("cn=Alice,ou=People,dc=example,dc=com").unwrap();
    let b = Dn::parse("cn=Alicia,ou=People,dc=example,dc=com").unwrap();
    let c = Dn::parse("cn=Alice,ou=Groups,dc=example,dc=com").unwrap();

    let path_a = dn_to_path(Platform::Posix, &a, &base);
    let path_b = dn_to_path(Platform::Posix, &b, &base);
    let path_c = dn_to_path(Platform::Posix, &c, &base);

    assert_ne!(path_a, path_b);
    assert_ne!(path_a, path_c);
    assert_ne!(path_b, path_c);
}

#[test]
fn path_nests_one_directory_per_rdn() {
    let base = std::path::PathBuf::from("/var/dirstore/db");
    let dn = Dn::parse("cn=Alice,ou=People,dc=example,dc=com").unwrap();
    let path = dn_to_path(Platform::Posix, &dn, &base);

    // base + dc=com + dc=example + ou=People + cn=Alice.ldif
    assert_eq!(path.components().count(), base.components().count() + 4);
    assert_eq!(path.extension().unwrap(), "ldif");
}

#[test]
fn windows_platform_escapes_backslash_while_posix_escapes_slash() {
    let posix = encode_rdn(Platform::Posix, b"cn=a/b");
    let windows = encode_rdn(Platform::Windows, b"cn=a:b");
    assert!(!posix.contains(&b'/'));
    assert!(!windows.contains(&b':'));
}

#[test]
fn index_brackets_survive_round_trip_through_a_full_path() {
    let base = std::path::PathBuf::from("/var/dirstore/db");
    let dn = Dn::parse("cn={1}replica,dc=example,dc=com").unwrap();
    let path = dn_to_path(Platform::Posix, &dn, &base);
    let leaf = path.file_name().unwrap().to_string_lossy();
    assert!(leaf.starts_with("{1}") || leaf.contains("{1}"));
}
