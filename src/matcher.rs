//! Priority-ordered duplicate lookup against the fingerprint store.
//!
//! Tiers run in order and the first hit wins:
//! 1. filename: a stored path has the same base name,
//! 2. exact/partial: a query hash equals a stored exact or partial hash,
//! 3. fuzzy A: block-hash similarity at or above the threshold,
//! 4. fuzzy B: locality distance strictly below the maximum.
//!
//! A partial-prefix collision is reported in tier 2 even though it does not
//! prove identical content.

use crate::config::MatchPolicy;
use crate::fingerprint::{ctph, tlsh};
use crate::store::{FingerprintRecord, FingerprintStore};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    #[serde(rename = "filename")]
    Filename,
    #[serde(rename = "exact")]
    Exact,
    #[serde(rename = "partial")]
    Partial,
    #[serde(rename = "fuzzyA")]
    FuzzyA,
    #[serde(rename = "fuzzyB")]
    FuzzyB,
}

impl std::fmt::Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchKind::Filename => write!(f, "filename"),
            MatchKind::Exact => write!(f, "exact"),
            MatchKind::Partial => write!(f, "partial"),
            MatchKind::FuzzyA => write!(f, "fuzzyA"),
            MatchKind::FuzzyB => write!(f, "fuzzyB"),
        }
    }
}

/// Any subset of the fingerprints known for a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchQuery<'a> {
    pub filename: Option<&'a str>,
    pub exact_hash: Option<&'a str>,
    pub partial_hash: Option<&'a str>,
    pub fuzzy_a: Option<&'a str>,
    pub fuzzy_b: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintMatch {
    pub kind: MatchKind,
    pub existing_path: PathBuf,
    /// Similarity for fuzzy A, distance for fuzzy B, absent otherwise.
    pub score: Option<u32>,
}

impl FingerprintMatch {
    fn new(kind: MatchKind, record: &FingerprintRecord, score: Option<u32>) -> Self {
        Self {
            kind,
            existing_path: record.path.clone(),
            score,
        }
    }
}

fn filename_tier(records: &[&FingerprintRecord], filename: &str) -> Option<FingerprintMatch> {
    records
        .iter()
        .find(|r| r.file_name() == Some(filename))
        .map(|r| FingerprintMatch::new(MatchKind::Filename, r, None))
}

fn hash_tier(records: &[&FingerprintRecord], query: &MatchQuery<'_>) -> Option<FingerprintMatch> {
    if query.exact_hash.is_none() && query.partial_hash.is_none() {
        return None;
    }
    for record in records {
        if query.exact_hash == Some(record.exact_hash.as_str()) {
            return Some(FingerprintMatch::new(MatchKind::Exact, record, None));
        }
        let stored = [Some(record.exact_hash.as_str()), record.partial_hash.as_deref()];
        let probes = [query.exact_hash, query.partial_hash];
        let hit = probes
            .iter()
            .flatten()
            .any(|probe| stored.iter().flatten().any(|s| s == probe));
        if hit {
            return Some(FingerprintMatch::new(MatchKind::Partial, record, None));
        }
    }
    None
}

fn fuzzy_a_tier(
    records: &[&FingerprintRecord],
    digest: &str,
    threshold: u32,
) -> Option<FingerprintMatch> {
    records.iter().find_map(|record| {
        let stored = record.fuzzy_a.as_deref()?;
        let score = ctph::compare(digest, stored)?;
        (score >= threshold).then(|| FingerprintMatch::new(MatchKind::FuzzyA, record, Some(score)))
    })
}

fn fuzzy_b_tier(
    records: &[&FingerprintRecord],
    digest: &str,
    max_distance: u32,
) -> Option<FingerprintMatch> {
    records.iter().find_map(|record| {
        let stored = record.fuzzy_b.as_deref()?;
        let distance = tlsh::distance(digest, stored)?;
        (distance < max_distance)
            .then(|| FingerprintMatch::new(MatchKind::FuzzyB, record, Some(distance)))
    })
}

/// Run every tier over `records` in iteration order.
pub fn find_match<'r>(
    records: impl IntoIterator<Item = &'r FingerprintRecord>,
    query: &MatchQuery<'_>,
    policy: &MatchPolicy,
) -> Option<FingerprintMatch> {
    let records: Vec<&FingerprintRecord> = records.into_iter().collect();

    if let Some(filename) = query.filename {
        if let Some(hit) = filename_tier(&records, filename) {
            return Some(hit);
        }
    }
    if let Some(hit) = hash_tier(&records, query) {
        return Some(hit);
    }
    if let Some(digest) = query.fuzzy_a {
        if let Some(hit) = fuzzy_a_tier(&records, digest, policy.fuzzy_a_threshold) {
            return Some(hit);
        }
    }
    if let Some(digest) = query.fuzzy_b {
        return fuzzy_b_tier(&records, digest, policy.fuzzy_b_max_distance);
    }
    None
}

/// Matcher bound to a store and policy; each lookup reads one snapshot.
#[derive(Clone)]
pub struct Matcher {
    store: Arc<FingerprintStore>,
    policy: MatchPolicy,
}

impl Matcher {
    pub fn new(store: Arc<FingerprintStore>, policy: MatchPolicy) -> Self {
        Self { store, policy }
    }

    pub fn find(&self, query: &MatchQuery<'_>) -> Option<FingerprintMatch> {
        let snapshot = self.store.snapshot();
        let hit = find_match(snapshot.values(), query, &self.policy);
        if let Some(hit) = &hit {
            debug!(
                "matcher: {} hit on {}",
                hit.kind,
                hit.existing_path.display()
            );
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{fuzzy_digest_b, Fingerprinter};

    const B64: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    fn record(hash: &str, path: &str) -> FingerprintRecord {
        FingerprintRecord {
            exact_hash: hash.to_string(),
            path: PathBuf::from(path),
            partial_hash: None,
            fuzzy_a: None,
            fuzzy_b: None,
            size: 0,
        }
    }

    /// Block-hash digest whose first `k` characters are replaced from the reversed alphabet.
    fn alphabet_digest(k: usize) -> String {
        let reversed: String = B64.chars().rev().take(k).collect();
        format!("48:{}{}:", reversed, &B64[k..])
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn filename_beats_exact_match() {
        let policy = MatchPolicy::default();
        let records = vec![
            record("content-hash", "/d/other.bin"),
            record("different-hash", "/d/report.pdf"),
        ];
        let query = MatchQuery {
            filename: Some("report.pdf"),
            exact_hash: Some("content-hash"),
            ..Default::default()
        };

        let hit = find_match(&records, &query, &policy).unwrap();
        assert_eq!(hit.kind, MatchKind::Filename);
        assert_eq!(hit.existing_path, PathBuf::from("/d/report.pdf"));
        assert_eq!(hit.score, None);
    }

    #[test]
    fn exact_hash_matches_store_key() {
        let policy = MatchPolicy::default();
        let records = vec![record("abc", "/d/a.bin")];
        let query = MatchQuery {
            filename: Some("unrelated.bin"),
            exact_hash: Some("abc"),
            ..Default::default()
        };
        assert_eq!(
            find_match(&records, &query, &policy).unwrap().kind,
            MatchKind::Exact
        );
    }

    #[test]
    fn partial_hash_cross_compares_with_stored_partial_and_key() {
        let policy = MatchPolicy::default();
        let mut with_partial = record("full-1", "/d/big.bin");
        with_partial.partial_hash = Some("prefix-1".to_string());
        let small = record("prefix-2", "/d/small.bin");
        let records = vec![with_partial, small];

        let query = MatchQuery {
            partial_hash: Some("prefix-1"),
            ..Default::default()
        };
        let hit = find_match(&records, &query, &policy).unwrap();
        assert_eq!(hit.kind, MatchKind::Partial);
        assert_eq!(hit.existing_path, PathBuf::from("/d/big.bin"));

        let query = MatchQuery {
            partial_hash: Some("prefix-2"),
            ..Default::default()
        };
        let hit = find_match(&records, &query, &policy).unwrap();
        assert_eq!(hit.existing_path, PathBuf::from("/d/small.bin"));
    }

    #[test]
    fn fuzzy_a_threshold_is_inclusive() {
        let policy = MatchPolicy::default();
        let mut stored = record("x", "/d/similar.bin");
        stored.fuzzy_a = Some(alphabet_digest(0));
        let records = vec![stored];

        let at_threshold = alphabet_digest(13);
        let query = MatchQuery {
            fuzzy_a: Some(&at_threshold),
            ..Default::default()
        };
        let hit = find_match(&records, &query, &policy).unwrap();
        assert_eq!(hit.kind, MatchKind::FuzzyA);
        assert_eq!(hit.score, Some(80));

        let below = alphabet_digest(14);
        let query = MatchQuery {
            fuzzy_a: Some(&below),
            ..Default::default()
        };
        assert_eq!(find_match(&records, &query, &policy), None);
    }

    #[test]
    fn corrupt_stored_digests_are_skipped() {
        let policy = MatchPolicy::default();
        let mut corrupt = record("bad", "/d/corrupt.bin");
        corrupt.fuzzy_a = Some("9223372036854775808:abcdefgh:abcd".to_string());
        corrupt.fuzzy_b = Some("T1".to_string() + &"0".repeat(70));
        let mut good = record("good", "/d/similar.bin");
        good.fuzzy_a = Some(alphabet_digest(0));
        let records = vec![corrupt, good];

        let query_digest = alphabet_digest(2);
        let query = MatchQuery {
            fuzzy_a: Some(&query_digest),
            ..Default::default()
        };
        let hit = find_match(&records, &query, &policy).unwrap();
        assert_eq!(hit.existing_path, PathBuf::from("/d/similar.bin"));

        let query = MatchQuery {
            fuzzy_a: Some("3:abcdefgh:abcd"),
            ..Default::default()
        };
        assert_eq!(find_match(&records[..1], &query, &policy), None);
    }

    #[test]
    fn fuzzy_b_matches_near_content_only() {
        let policy = MatchPolicy::default();
        let data = noise(64 * 1024, 12);
        let mut stored = record("y", "/d/near.bin");
        stored.fuzzy_b = fuzzy_digest_b(&data);
        let records = vec![stored];

        let mut edited = data.clone();
        edited[5_000] = edited[5_000].wrapping_add(1);
        let near = fuzzy_digest_b(&edited).unwrap();
        let query = MatchQuery {
            fuzzy_b: Some(&near),
            ..Default::default()
        };
        let hit = find_match(&records, &query, &policy).unwrap();
        assert_eq!(hit.kind, MatchKind::FuzzyB);
        assert!(hit.score.unwrap() < 30);

        let far = fuzzy_digest_b(&noise(64 * 1024, 999)).unwrap();
        let query = MatchQuery {
            fuzzy_b: Some(&far),
            ..Default::default()
        };
        assert_eq!(find_match(&records, &query, &policy), None);
    }

    #[test]
    fn empty_query_never_matches() {
        let policy = MatchPolicy::default();
        let records = vec![record("abc", "/d/a.bin")];
        assert_eq!(find_match(&records, &MatchQuery::default(), &policy), None);
    }

    #[tokio::test]
    async fn matcher_reads_current_store_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FingerprintStore::open(dir.path().join("hashes.json")).await);
        let matcher = Matcher::new(Arc::clone(&store), MatchPolicy::default());

        let data = noise(4096, 5);
        let mut fp = Fingerprinter::new(1024);
        fp.update(&data);
        let fingerprints = fp.finish();
        let exact = fingerprints.exact_hash.clone();

        let query = MatchQuery {
            exact_hash: Some(&exact),
            ..Default::default()
        };
        assert!(matcher.find(&query).is_none());

        store
            .put(FingerprintRecord::from_fingerprints("/d/n.bin", fingerprints))
            .await
            .unwrap();
        assert_eq!(matcher.find(&query).unwrap().kind, MatchKind::Exact);
    }
}
