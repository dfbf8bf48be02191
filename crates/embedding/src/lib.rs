//! # Text Embeddings
//!
//! This crate defines the embedding service interface used by the vector
//! retrieval mode, plus a deterministic local embedder for tests and the
//! minimal preset. Real models (OpenAI, BigModel, local sentence
//! transformers) plug in behind the same trait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

/// Service for generating text embeddings.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Generates an embedding vector for a single text string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, anyhow::Error>;

    /// Generates embedding vectors for multiple texts in a single call.
    /// This is more efficient than calling `embed` multiple times.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, anyhow::Error>;
}

/// Cosine similarity between two vectors. Empty or zero vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Deterministic embedder: hashes character bigrams into a fixed number of
/// buckets and L2-normalizes. No model, no network; equal inputs give equal
/// vectors, and overlapping texts score high cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dim: usize,
}

impl HashEmbedding {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return vector;
        }
        for window in chars.windows(2.min(chars.len())) {
            let mut hasher = DefaultHasher::new();
            window.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dim as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, anyhow::Error> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, anyhow::Error> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn hash_embedding_is_deterministic() {
        let service = HashEmbedding::new(64);
        let a = service.embed_sync("我喜欢恐龙");
        let b = service.embed_sync("我喜欢恐龙");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let service = HashEmbedding::new(128);
        let base = service.embed_sync("我喜欢恐龙和动物园");
        let close = service.embed_sync("我喜欢恐龙");
        let far = service.embed_sync("today it rained all afternoon");
        assert!(
            cosine_similarity(&base, &close) > cosine_similarity(&base, &far),
            "related text should be closer"
        );
    }
}
