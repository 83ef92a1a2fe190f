//! Request fingerprints and similarity scoring.
//!
//! A fingerprint is a hash of the normalized request text plus its set of
//! significant keywords. Two fingerprints are compared with a weighted blend
//! of keyword overlap (Jaccard) and length proximity, floored at the overlap
//! itself; an identical hash is always a similarity of 1.0.

use crate::models::RequestFingerprint;
use crate::storage::sha256_bytes;
use std::collections::BTreeSet;

/// Weight of keyword overlap in the similarity blend.
const KEYWORD_WEIGHT: f64 = 0.85;

/// Weight of length proximity in the similarity blend.
const LENGTH_WEIGHT: f64 = 0.15;

/// Minimum length for a word to count as a keyword.
const MIN_KEYWORD_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "over", "under", "are",
    "was", "were", "will", "should", "would", "could", "can", "our", "your", "its", "all", "any",
    "some", "more", "most", "less", "make", "makes", "made", "please", "also", "then", "than",
    "when", "where", "which", "while", "about", "each", "every", "there", "their", "them", "they",
    "have", "has", "had", "been", "being", "not", "but", "use", "using", "via",
];

/// Lowercase, strip punctuation, and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Significant words of normalized text.
pub fn keywords(normalized: &str) -> BTreeSet<String> {
    normalized
        .split_whitespace()
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN && !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Build the fingerprint of a request text.
pub fn fingerprint(text: &str) -> RequestFingerprint {
    let normalized = normalize(text);
    RequestFingerprint {
        hash: sha256_bytes(normalized.as_bytes()),
        keywords: keywords(&normalized),
        length: normalized.chars().count(),
    }
}

/// Jaccard index of two keyword sets. Two empty sets are dissimilar.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity of two fingerprints in `0.0..=1.0`.
///
/// Never lower than the keyword overlap alone; length proximity can only
/// raise the score.
pub fn similarity(a: &RequestFingerprint, b: &RequestFingerprint) -> f64 {
    if a.hash == b.hash {
        return 1.0;
    }
    let longest = a.length.max(b.length);
    let proximity = if longest == 0 {
        1.0
    } else {
        a.length.min(b.length) as f64 / longest as f64
    };
    let overlap = jaccard(&a.keywords, &b.keywords);
    overlap.max(KEYWORD_WEIGHT * overlap + LENGTH_WEIGHT * proximity)
}
