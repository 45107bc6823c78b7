//! Deterministic feature-hashing embedder.
//!
//! Each token (and each adjacent token pair) is hashed with SHA-256; the
//! first bytes of the digest pick a bucket and a sign. The vector is
//! L2-normalised, so cosine similarity reflects shared vocabulary. Needs no
//! network and always returns the same vector for the same text.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::error::BackendError;
use crate::text;

/// Offline embedder based on the hashing trick.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    /// Synchronous embedding, shared by the async trait method and by
    /// callers that index a corpus up front.
    pub fn embed_sync(&self, input: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let tokens = text::tokens(input);
        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % self.dimension;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::cosine_similarity;

    #[test]
    fn same_text_same_vector() {
        let e = HashingEmbedder::default();
        assert_eq!(e.embed_sync("fractions and decimals"), e.embed_sync("fractions and decimals"));
    }

    #[test]
    fn vectors_are_normalised() {
        let e = HashingEmbedder::new(64);
        let v = e.embed_sync("measure area of rectangles");
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashingEmbedder::default();
        let query = e.embed_sync("grade 5 math fractions");
        let related = e.embed_sync("Grade 5 students compare fractions using models");
        let unrelated = e.embed_sync("Poetry recital with expressive rhythm");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed_sync("the and of").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn minimum_dimension_enforced() {
        assert_eq!(HashingEmbedder::new(2).dimension(), 8);
    }
}
