//! Bloom filter for persisted block dedup
//!
//! Negative answers are exact; positive answers mean "consult the primary-key
//! index". Sizing comes from `BloomConfig::bits_per_key` (10 bits ≈ 1% false
//! positives).

use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
    num_bits: usize,
}

impl BloomFilter {
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys.max(1)) * bits_per_key.max(1);
        let num_bytes = (num_bits + 7) / 8;

        // Optimal hash count: k = (m/n) * ln(2).
        let num_hashes = ((bits_per_key as f64) * 0.693).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        Self { bits: vec![0u8; num_bytes], num_hashes, num_bits }
    }

    pub fn from_keys<'a>(
        keys: impl IntoIterator<Item = &'a [u8]>,
        num_keys: usize,
        bits_per_key: usize,
    ) -> Self {
        let mut filter = Self::new(num_keys, bits_per_key);
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let bit = (self.hash(key, i) as usize) % self.num_bits;
            self.set_bit(bit);
        }
    }

    /// False means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.num_hashes {
            let bit = (self.hash(key, i) as usize) % self.num_bits;
            if !self.get_bit(bit) {
                return false;
            }
        }
        true
    }

    /// False means none of the keys are present.
    pub fn may_contain_any<'a>(&self, keys: impl IntoIterator<Item = &'a [u8]>) -> bool {
        keys.into_iter().any(|k| self.may_contain(k))
    }

    pub fn byte_size(&self) -> usize {
        self.bits.len()
    }

    fn hash(&self, key: &[u8], seed: u32) -> u64 {
        // Fixed seeds keep the filter stable across processes.
        let state = RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            seed as u64,
        );
        let mut hasher = state.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn set_bit(&mut self, pos: usize) {
        self.bits[pos / 8] |= 1 << (pos % 8);
    }

    fn get_bit(&self, pos: usize) -> bool {
        self.bits[pos / 8] & (1 << (pos % 8)) != 0
    }
}
