// src/id.rs
//
// 160-bit node/key identifiers and the XOR metric they're compared under.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

pub const ID_BITS: usize = 160;
pub const ID_BYTES: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_BYTES]);

impl NodeId {
    pub fn zero() -> Self {
        NodeId([0u8; ID_BYTES])
    }

    /// SHA-1 of 20 random bytes, the way `random_id()` in the original seeds
    /// a fresh identifier for a node that has never joined before.
    pub fn random() -> Self {
        let mut seed = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::hash_key(&seed)
    }

    /// Maps an arbitrary byte string into the 160-bit key space via SHA-1,
    /// used both for node ids and for hashing user-supplied storage keys.
    pub fn hash_key(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; ID_BYTES];
        out.copy_from_slice(&digest);
        NodeId(out)
    }

    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        NodeId(out)
    }

    /// Number of leading zero bits in the XOR distance to `other`.
    fn leading_zero_bits(&self, other: &NodeId) -> usize {
        let d = self.xor(other);
        let mut zeros = 0;
        for byte in d.0.iter() {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    /// `160 - bit_length(distance)`, i.e. the k-bucket this peer belongs in
    /// relative to `self`. `bit_length(distance) == ID_BITS -
    /// leading_zero_bits(distance)`, so this collapses to `leading_zero_bits`
    /// itself. Returns `None` if `other == self` (no bucket).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        if self == other {
            return None;
        }
        Some(self.leading_zero_bits(other))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_is_in_range() {
        let a = NodeId::random();
        let b = NodeId::random();
        if let Some(idx) = a.bucket_index(&b) {
            assert!(idx < ID_BITS);
        }
    }

    #[test]
    fn self_distance_has_no_bucket() {
        let a = NodeId::random();
        assert_eq!(a.bucket_index(&a), None);
    }

    #[test]
    fn xor_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn closer_peer_has_higher_bucket_index() {
        // flipping the top bit maximizes the XOR distance (bucket 0, the
        // farthest bucket); flipping only the bottom bit minimizes it
        // (bucket 159, the closest).
        let a = NodeId::zero();
        let mut far = [0u8; ID_BYTES];
        far[0] = 0x80; // flips the top bit => bucket 0
        let mut near = [0u8; ID_BYTES];
        near[ID_BYTES - 1] = 0x01; // flips the bottom bit => bucket 159
        let far_id = NodeId(far);
        let near_id = NodeId(near);
        assert_eq!(a.bucket_index(&far_id), Some(0));
        assert_eq!(a.bucket_index(&near_id), Some(159));
    }
}
