//! FNV-1a hash embedder.
//!
//! Deterministic bag-of-words vectors with no model files. Not semantic, it
//! only captures token overlap, but it is always available offline.

use crate::search::embeddings::{EmbeddingBackend, EmbeddingError, ModelLoader};

/// Model name selecting this backend in the config.
pub const HASH_MODEL_NAME: &str = "hash";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

const MIN_TOKEN_LEN: usize = 2;

/// Same width as MiniLM.
pub const DEFAULT_DIMENSION: usize = 384;

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Each token lands on one dimension with a sign taken from the hash's
    /// high bit. Text without usable tokens is hashed whole, so the result
    /// is never a zero vector.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
            .collect();
        if tokens.is_empty() {
            tokens.push(lowered.trim());
        }

        let mut embedding = vec![0.0_f32; self.dimension];
        for token in tokens {
            let hash = fnv1a_hash(token.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }

        l2_normalize(&mut embedding);
        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl EmbeddingBackend for HashEmbedder {
    fn embed(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }
}

#[derive(Debug, Clone)]
pub struct HashLoader {
    name: String,
    dimension: usize,
}

impl HashLoader {
    pub fn new(dimension: usize) -> Self {
        Self {
            name: format!("{HASH_MODEL_NAME}-{dimension}"),
            dimension,
        }
    }
}

impl Default for HashLoader {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl ModelLoader for HashLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
        Ok(Box::new(HashEmbedder::new(self.dimension)))
    }
}
