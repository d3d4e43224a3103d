//! # Node Identifiers and the XOR Metric
//!
//! Every node, info-hash and storage key in the DHT is a [`NodeId`]: a
//! 160-bit value compared with the Kademlia XOR metric.
//!
//! ## Invariants
//!
//! - `distance(a, b) == distance(b, a)`
//! - `distance(a, a) == 0`
//! - Distances compare as unsigned big-endian integers, so `find_node`
//!   orderings are total and deterministic for a fixed set of ids.
//!
//! Content-derived keys (immutable items, mutable item keys, signed storage
//! keys) are the first 160 bits of a BLAKE3 digest, see [`NodeId::hash_of`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier length in bytes.
pub const ID_LEN: usize = 20;

/// Identifier length in bits; also the number of routing buckets.
pub const ID_BITS: usize = ID_LEN * 8;

/// XOR distance between two identifiers.
pub type Distance = [u8; ID_LEN];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an id from a slice, returning `None` unless it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        Self(rand::random::<[u8; ID_LEN]>())
    }

    /// Content-derived identifier: the first 160 bits of `blake3(data)`.
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(out)
    }

    /// Content-derived identifier over several parts, hashed in order.
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the routing bucket `other` falls into, relative to `self`.
    ///
    /// Bucket 0 holds ids that differ in the first bit (the far half of the
    /// keyspace); bucket 159 holds ids that differ only in the last bit.
    /// Returns `None` when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return Some(byte_idx * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }

    /// A random identifier that lands in bucket `bucket_idx` relative to `self`.
    pub fn random_in_bucket(&self, bucket_idx: usize) -> NodeId {
        let bucket_idx = bucket_idx.min(ID_BITS - 1);
        let mut distance = [0u8; ID_LEN];
        if getrandom::getrandom(&mut distance).is_err() {
            for (i, byte) in distance.iter_mut().enumerate() {
                *byte = self.0[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
            }
        }

        let byte_idx = bucket_idx / 8;
        let bit_pos = bucket_idx % 8;

        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }

        let target_bit = 0x80u8 >> bit_pos;
        let random_mask = target_bit.wrapping_sub(1);
        distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

        let mut target = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            target[i] = self.0[i] ^ distance[i];
        }
        NodeId(target)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Short hex prefix for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances as unsigned big-endian integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

/// Order `a` and `b` by their distance to `target`.
#[cfg(test)]
pub fn closer_to(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance_cmp(&a.xor_distance(target), &b.xor_distance(target))
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        for _ in 0..32 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
            assert_eq!(a.xor_distance(&a), [0u8; ID_LEN]);
        }
    }

    #[test]
    fn distance_orders_as_unsigned_integer() {
        let target = NodeId::from_bytes([0u8; ID_LEN]);
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert_eq!(closer_to(&target, &near, &far), Ordering::Less);
        assert_eq!(closer_to(&target, &far, &near), Ordering::Greater);
        assert_eq!(closer_to(&target, &near, &near), Ordering::Equal);
    }

    #[test]
    fn bucket_index_counts_leading_zero_bits() {
        let zero = NodeId::from_bytes([0u8; ID_LEN]);
        assert_eq!(zero.bucket_index(&zero), None);
        assert_eq!(zero.bucket_index(&id_with_first_byte(0x80)), Some(0));
        assert_eq!(zero.bucket_index(&id_with_first_byte(0x01)), Some(7));

        let mut last = [0u8; ID_LEN];
        last[ID_LEN - 1] = 1;
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(last)), Some(ID_BITS - 1));
    }

    #[test]
    fn random_in_bucket_lands_in_requested_bucket() {
        let me = NodeId::random();
        for bucket in [0usize, 1, 7, 8, 63, 100, ID_BITS - 1] {
            let target = me.random_in_bucket(bucket);
            assert_eq!(me.bucket_index(&target), Some(bucket), "bucket {bucket}");
        }
    }

    #[test]
    fn hash_of_is_deterministic_and_content_sensitive() {
        assert_eq!(NodeId::hash_of(b"hello"), NodeId::hash_of(b"hello"));
        assert_ne!(NodeId::hash_of(b"hello"), NodeId::hash_of(b"hellp"));
        assert_eq!(
            NodeId::hash_parts(&[b"hel", b"lo"]),
            NodeId::hash_of(b"hello")
        );
    }

    #[test]
    fn hex_round_trip_rejects_wrong_length() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }
}
