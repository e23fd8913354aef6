//! Property tests for the key algebra and archive naming.

use galley::store::{format_archive_filename, parse_archive_filename};
use galley::{Identity, format_key, variant_hash};
use proptest::prelude::*;

fn segment() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,8}"
}

fn revision() -> impl Strategy<Value = String> {
    "[A-Za-z0-9._-]{1,10}"
}

fn identity() -> impl Strategy<Value = Identity> {
    (prop::collection::vec(segment(), 1..=3), revision())
        .prop_map(|(segments, rev)| format!("{}@{rev}", segments.join(".")))
        .prop_map(|s| Identity::parse(&s).expect("generated identity must parse"))
}

fn platform() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["linux", "macos", "windows"])
}

fn arch() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["x86_64", "aarch64", "riscv64"])
}

fn hash16() -> impl Strategy<Value = String> {
    "[0-9a-f]{16}"
}

proptest! {
    #[test]
    fn archive_filename_round_trips(
        identity in identity(),
        platform in platform(),
        arch in arch(),
        hash in hash16(),
    ) {
        let name = format_archive_filename(&identity, platform, arch, &hash);
        let (i, p, a, h) = parse_archive_filename(&name).expect("own output must parse");
        prop_assert_eq!(i, identity);
        prop_assert_eq!(p, platform);
        prop_assert_eq!(a, arch);
        prop_assert_eq!(h, hash);
    }

    #[test]
    fn identity_display_round_trips(identity in identity()) {
        let reparsed = Identity::parse(identity.as_str()).unwrap();
        prop_assert_eq!(reparsed, identity);
    }

    #[test]
    fn variant_hash_ignores_digest_order(
        identity in identity(),
        digests in prop::collection::vec("[0-9a-f]{64}", 0..5),
    ) {
        let key = format_key(&identity, "");
        let mut reversed = digests.clone();
        reversed.reverse();
        prop_assert_eq!(variant_hash(&key, &digests), variant_hash(&key, &reversed));
        prop_assert_eq!(variant_hash(&key, &digests).len(), 16);
    }

    #[test]
    fn variant_hash_depends_on_digest_set(
        identity in identity(),
        digest in "[0-9a-f]{64}",
    ) {
        let key = format_key(&identity, "");
        prop_assert_ne!(
            variant_hash(&key, &[]),
            variant_hash(&key, &[digest])
        );
    }

    #[test]
    fn identity_always_matches_itself(identity in identity()) {
        prop_assert!(identity.matches(&identity));
    }
}
