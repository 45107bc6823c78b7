//! Small text helpers: tokenisation, lexical similarity, vector similarity.

use std::collections::HashSet;

/// Words too common to carry meaning in a similarity comparison.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "the", "to", "with",
];

/// Lowercase alphanumeric tokens with stopwords removed.
pub fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Jaccard overlap of the token sets of `a` and `b`, in `0.0..=1.0`.
pub fn token_similarity(a: &str, b: &str) -> f32 {
    let left: HashSet<String> = tokens(a).into_iter().collect();
    let right: HashSet<String> = tokens(b).into_iter().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f32 / union as f32
}

/// Fraction of `query` tokens that also occur in `text`, in `0.0..=1.0`.
pub fn token_coverage(query: &str, text: &str) -> f32 {
    let query: HashSet<String> = tokens(query).into_iter().collect();
    if query.is_empty() {
        return 0.0;
    }
    let text: HashSet<String> = tokens(text).into_iter().collect();
    query.intersection(&text).count() as f32 / query.len() as f32
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 if the vectors differ in length or either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}
