//! MinHash signatures over character n-grams and a banded LSH index.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Mersenne prime 2^61 - 1.
const MERSENNE_61: u64 = (1 << 61) - 1;
pub const PERMUTATION_SEED: u64 = 1;

/// Character n-grams of `s`; a non-empty string shorter than `n` is one gram.
pub fn ngrams(s: &str, n: usize) -> HashSet<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return HashSet::new();
    }
    if chars.len() < n || n == 0 {
        return HashSet::from([s.to_string()]);
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

fn base_hash(gram: &str) -> u64 {
    let digest = Sha256::digest(gram.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Universal hashing `(a·h + b) mod (2^61 - 1)` with seeded parameters, so
/// signatures built in different processes are comparable.
#[derive(Debug, Clone)]
pub struct MinHasher {
    ngram: usize,
    a: Vec<u64>,
    b: Vec<u64>,
}

impl MinHasher {
    pub fn new(num_perm: usize, ngram: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(PERMUTATION_SEED);
        let mut a = Vec::with_capacity(num_perm);
        let mut b = Vec::with_capacity(num_perm);
        for _ in 0..num_perm {
            a.push(rng.gen_range(1..MERSENNE_61));
            b.push(rng.gen_range(0..MERSENNE_61));
        }
        Self { ngram, a, b }
    }

    pub fn num_perm(&self) -> usize {
        self.a.len()
    }

    pub fn ngram(&self) -> usize {
        self.ngram
    }

    pub fn signature(&self, s: &str) -> Vec<u64> {
        let mut sig = vec![MERSENNE_61; self.a.len()];
        for gram in ngrams(s, self.ngram) {
            let h = (base_hash(&gram) % MERSENNE_61) as u128;
            for (i, slot) in sig.iter_mut().enumerate() {
                let v = ((self.a[i] as u128 * h + self.b[i] as u128) % MERSENNE_61 as u128) as u64;
                if v < *slot {
                    *slot = v;
                }
            }
        }
        sig
    }
}

fn simpson(f: impl Fn(f64) -> f64, lo: f64, hi: f64) -> f64 {
    const STEPS: usize = 200;
    if hi <= lo {
        return 0.0;
    }
    let h = (hi - lo) / STEPS as f64;
    let mut acc = f(lo) + f(hi);
    for i in 1..STEPS {
        let x = lo + i as f64 * h;
        acc += if i % 2 == 1 { 4.0 } else { 2.0 } * f(x);
    }
    acc * h / 3.0
}

/// Band/row split minimising the weighted false positive and false negative
/// areas around `threshold`.
pub fn optimal_params(
    threshold: f64,
    num_perm: usize,
    fp_weight: f64,
    fn_weight: f64,
) -> (usize, usize) {
    let mut best = (1, num_perm.max(1));
    let mut min_error = f64::INFINITY;
    for bands in 1..=num_perm {
        for rows in 1..=(num_perm / bands) {
            let (b, r) = (bands as f64, rows as i32);
            let fp = simpson(|s| 1.0 - (1.0 - s.powi(r)).powf(b), 0.0, threshold);
            let fn_ = simpson(|s| (1.0 - s.powi(r)).powf(b), threshold, 1.0);
            let error = fp * fp_weight + fn_ * fn_weight;
            if error < min_error {
                min_error = error;
                best = (bands, rows);
            }
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinHashLsh {
    pub threshold: f64,
    pub num_perm: usize,
    /// Shingle size of the signatures stored in the bands.
    #[serde(default)]
    pub ngram: usize,
    pub bands: usize,
    pub rows: usize,
    tables: Vec<HashMap<String, Vec<String>>>,
}

impl MinHashLsh {
    pub fn new(threshold: f64, num_perm: usize, ngram: usize) -> Self {
        let (bands, rows) = optimal_params(threshold, num_perm, 0.5, 0.5);
        Self {
            threshold,
            num_perm,
            ngram,
            bands,
            rows,
            tables: vec![HashMap::new(); bands],
        }
    }

    fn band_key(&self, sig: &[u64], band: usize) -> String {
        let start = band * self.rows;
        sig[start..start + self.rows]
            .iter()
            .map(|v| format!("{v:x}"))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn insert(&mut self, key: &str, sig: &[u64]) {
        if sig.len() < self.bands * self.rows {
            return;
        }
        for band in 0..self.bands {
            let k = self.band_key(sig, band);
            self.tables[band].entry(k).or_default().push(key.to_string());
        }
    }

    /// Keys sharing at least one band with `sig`, in sorted order.
    pub fn query(&self, sig: &[u64]) -> Vec<String> {
        if sig.len() < self.bands * self.rows {
            return Vec::new();
        }
        let mut out = BTreeSet::new();
        for band in 0..self.bands {
            if let Some(keys) = self.tables[band].get(&self.band_key(sig, band)) {
                out.extend(keys.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(HashMap::is_empty)
    }
}
