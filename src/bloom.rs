//! Fixed-size bloom filters.
//!
//! Two sizes are used by the node:
//!
//! - [`AnnouncerFilter`] (128 bits): remembers which IPs already announced a
//!   stored item so repeat puts from the same host do not inflate popularity.
//! - [`ScrapeFilter`] (2048 bits): the `BFsd` / `BFpe` filters returned by
//!   scrape-style `get_peers` replies.
//!
//! Both use two hash functions derived from one blake3 digest. The element
//! count estimate is `n = -(m/k) * ln(1 - X/m)`.

use std::fmt;

/// Number of hash functions.
const HASH_COUNT: usize = 2;

#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter<const BYTES: usize> {
    bits: [u8; BYTES],
}

pub type AnnouncerFilter = BloomFilter<16>;
pub type ScrapeFilter = BloomFilter<256>;

impl<const BYTES: usize> BloomFilter<BYTES> {
    pub const NUM_BITS: usize = BYTES * 8;

    pub fn new() -> Self {
        Self { bits: [0u8; BYTES] }
    }

    /// Rebuild a filter from its wire form; `None` on a size mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bits: [u8; BYTES] = bytes.try_into().ok()?;
        Some(Self { bits })
    }

    pub fn insert_bytes(&mut self, data: &[u8]) {
        for index in Self::indices(data) {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn contains_bytes(&self, data: &[u8]) -> bool {
        Self::indices(data)
            .iter()
            .all(|&index| (self.bits[index / 8] >> (index % 8)) & 1 == 1)
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Estimated number of distinct inserted elements.
    pub fn estimated_count(&self) -> f64 {
        let m = Self::NUM_BITS as f64;
        let k = HASH_COUNT as f64;
        let x = self.count_ones() as f64;

        if x >= m {
            return f64::INFINITY;
        }

        -(m / k) * (1.0 - x / m).ln()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn indices(data: &[u8]) -> [usize; HASH_COUNT] {
        let digest = blake3::hash(data);
        let bytes = digest.as_bytes();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&bytes[0..8]);
        h2.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2);

        let mut out = [0usize; HASH_COUNT];
        for (i, slot) in out.iter_mut().enumerate() {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            *slot = (combined % Self::NUM_BITS as u64) as usize;
        }
        out
    }
}

impl<const BYTES: usize> Default for BloomFilter<BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BYTES: usize> fmt::Debug for BloomFilter<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &Self::NUM_BITS)
            .field("set", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_elements_are_found() {
        let mut filter = AnnouncerFilter::new();
        assert!(filter.is_empty());
        filter.insert_bytes(b"10.0.0.1");
        assert!(filter.contains_bytes(b"10.0.0.1"));
        assert!(!filter.is_empty());
    }

    #[test]
    fn estimate_tracks_insert_count() {
        let mut filter = ScrapeFilter::new();
        for i in 0..100u32 {
            filter.insert_bytes(&i.to_be_bytes());
        }
        let estimate = filter.estimated_count();
        assert!((80.0..120.0).contains(&estimate), "estimate {estimate}");
    }

    #[test]
    fn from_slice_checks_length() {
        let mut filter = ScrapeFilter::new();
        filter.insert_bytes(b"peer");
        let copy = ScrapeFilter::from_slice(filter.as_bytes()).unwrap();
        assert_eq!(copy, filter);
        assert!(ScrapeFilter::from_slice(&[0u8; 16]).is_none());
    }
}
