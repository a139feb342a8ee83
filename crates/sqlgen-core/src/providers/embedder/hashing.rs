//! Offline embedder: signed feature hashing of word unigrams and character
//! trigrams into a fixed-width, L2-normalised vector. Deterministic across
//! runs and platforms, which makes it the default for tests and dry runs.

use super::Embedder;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub const DEFAULT_DIMS: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMS)
    }
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut b = [0u8; 8];
        b.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(b);
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        ((h % self.dims as u64) as usize, sign)
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let (i, s) = self.bucket(&format!("w:{word}"));
            v[i] += 2.0 * s;
            let chars: Vec<char> = format!(" {word} ").chars().collect();
            for gram in chars.windows(3) {
                let g: String = gram.iter().collect();
                let (i, s) = self.bucket(&format!("c:{g}"));
                v[i] += s;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn name(&self) -> &'static str {
        "hashing"
    }

    fn model_id(&self) -> String {
        format!("hashing-{}", self.dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::cosine;

    #[test]
    fn similar_text_scores_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed_sync("number of customers");
        let near = e.embed_sync("customer count");
        let far = e.embed_sync("warehouse latitude");
        assert!(cosine(&q, &near) > cosine(&q, &far));
        assert_eq!(q, e.embed_sync("Number of customers"));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed_sync("  ").iter().all(|x| *x == 0.0));
    }
}
