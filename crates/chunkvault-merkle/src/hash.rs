//! Leaf and parent hashing with the empty-buffer normalization of `spec.md` §3.

use sha2::{Digest, Sha256};

use crate::error::Hash;

/// Hash `bytes`, normalizing an empty buffer to the hash of a single zero
/// byte so "no data" and "absent" never collide.
#[must_use]
pub fn leaf_hash(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    if bytes.is_empty() {
        hasher.update([0u8]);
    } else {
        hasher.update(bytes);
    }
    hasher.finalize().into()
}

/// Hash of an internal node: the digest of its two children's hashes
/// concatenated. The tree this crate implements is always a complete binary
/// tree (padded out to a power-of-two leaf count), so every internal node
/// has both children.
#[must_use]
pub fn parent_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// The defined hash of a padding leaf (an empty chunk).
#[must_use]
pub fn empty_leaf_hash() -> Hash {
    leaf_hash(&[])
}

/// Digest over an arbitrary byte region, used for the footer's tree-region digest.
#[must_use]
pub fn region_digest(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_normalizes_to_single_zero_byte() {
        assert_eq!(leaf_hash(&[]), leaf_hash(&[0u8]));
        let raw_empty: Hash = Sha256::digest([]).into();
        assert_ne!(leaf_hash(&[]), raw_empty);
    }

    #[test]
    fn distinct_inputs_hash_differently() {
        assert_ne!(leaf_hash(b"a"), leaf_hash(b"b"));
    }
}
