//! Property-based tests for the two invariants spec.md §8 singles out as
//! needing randomized coverage: Tagger's replacement-count/length accounting,
//! and the cert-cache persistence round trip.

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use std::collections::HashMap;
use tempfile::TempDir;
use tracewire::cert_store::CertStore;
use tracewire::tagger::{tag_string, LocationKind};
use tracewire::tracer::Tracer;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// *Tagging completeness* (spec.md §8): after tagging an input with K
    /// non-overlapping hits of one active tracer string, the output
    /// contains exactly K replacements and its length reflects the
    /// substitution exactly (what `intercept_session` uses to recompute
    /// `Content-Length`).
    #[test]
    fn tagging_completeness(
        filler_segments in prop::collection::vec("[a-z ]{0,12}", 0..8),
        marker_id in 0u32..10_000,
        payload in "[A-Z]{1,10}",
    ) {
        // Uppercase tracer string, lowercase-only filler: the two alphabets
        // never collide, so every hit in the joined input is one we placed
        // on purpose, not an accidental substring match.
        let tracer_string = format!("TR{marker_id}MARK");
        let tracer = Tracer {
            id: 1,
            tracer_string: tracer_string.clone(),
            tracer_payload: payload.clone(),
        };

        let input = filler_segments.join(&tracer_string);
        let expected_hits = filler_segments.len().saturating_sub(1);

        let (output, records) = tag_string(&input, std::slice::from_ref(&tracer), LocationKind::Body);

        prop_assert_eq!(records.len(), expected_hits);
        prop_assert!(records.iter().all(|r| r.tracer_id == 1));

        let filler_len: usize = filler_segments.iter().map(|s| s.len()).sum();
        let expected_len = filler_len + expected_hits * payload.len();
        prop_assert_eq!(output.len(), expected_len);
    }

    /// *Persistence round-trip* (spec.md §8): `FlushToDisk; clear;
    /// LoadFromDisk` yields a cache equivalent to the original, modulo
    /// entry order.
    #[test]
    fn persistence_round_trip_preserves_certs(
        hosts in prop::collection::hash_set("[a-z]{3,8}\\.example\\.com", 1..5)
    ) {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("cert-cache.json");
        let ca_cert_path = dir.path().join("ca.pem");
        let ca_key_path = dir.path().join("ca.key");
        let store = CertStore::new(&ca_cert_path, &ca_key_path, &cache_path).unwrap();

        let mut originals: HashMap<String, Vec<u8>> = HashMap::new();
        for host in &hosts {
            let leaf = store.get_cert(host).unwrap();
            originals.insert(host.clone(), leaf.cert_der.as_ref().to_vec());
        }
        store.flush_to_disk(&cache_path).unwrap();

        let reloaded = CertStore::new(&ca_cert_path, &ca_key_path, &cache_path).unwrap();
        for (host, der) in &originals {
            let leaf = reloaded.get_cert(host).unwrap();
            prop_assert_eq!(leaf.cert_der.as_ref().to_vec(), der.clone());
        }
    }
}
