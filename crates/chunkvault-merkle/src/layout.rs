//! Byte-offset arithmetic for the persisted Merkle file layout of `spec.md` §3:
//!
//! ```text
//! [ leaf hashes     : cap_leaf × HASH_SIZE ]
//! [ internal hashes : (cap_leaf - 1) × HASH_SIZE ]
//! [ validity bitset : bitset_size bytes ]
//! [ footer          : FOOTER_LEN bytes ]
//! ```
//!
//! Heap-array node indices (root = 0, children of `i` at `2i+1`/`2i+2`) are
//! translated to byte offsets in the *storage* layout, which keeps leaves
//! and internals in two separate contiguous arrays rather than one
//! heap-ordered array.

use chunkvault_geometry::Geometry;

use crate::error::HASH_SIZE;
use crate::footer::FOOTER_LEN;

/// Offsets and sizes of each region of a persisted Merkle file.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    cap_leaf: u64,
    internal_count: u64,
    leaves_offset: u64,
    internals_offset: u64,
    bitset_offset: u64,
    bitset_size: u64,
    footer_offset: u64,
    total_len: u64,
}

impl Layout {
    /// Derive the layout for a given geometry.
    #[must_use]
    pub fn new(geometry: &Geometry) -> Self {
        let cap_leaf = geometry.cap_leaf();
        let internal_count = geometry.internal_node_count();
        let node_count = geometry.node_count();

        let leaves_offset = 0;
        let leaves_size = cap_leaf * HASH_SIZE as u64;
        let internals_offset = leaves_offset + leaves_size;
        let internals_size = internal_count * HASH_SIZE as u64;
        let bitset_offset = internals_offset + internals_size;
        let bitset_size = bitset_bytes_for(node_count);
        let footer_offset = bitset_offset + bitset_size;
        let total_len = footer_offset + FOOTER_LEN as u64;

        Self {
            cap_leaf,
            internal_count,
            leaves_offset,
            internals_offset,
            bitset_offset,
            bitset_size,
            footer_offset,
            total_len,
        }
    }

    /// Total file length this layout describes.
    #[must_use]
    pub const fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Byte size of the validity bitset region.
    #[must_use]
    pub const fn bitset_size(&self) -> u64 {
        self.bitset_size
    }

    /// Byte offset of the first byte of the footer.
    #[must_use]
    pub const fn footer_offset(&self) -> u64 {
        self.footer_offset
    }

    /// Byte offset of the tree-region digest input: `[0, digest_end)`.
    #[must_use]
    pub const fn digest_region_end(&self) -> u64 {
        self.bitset_offset
    }

    /// Byte range `[start, end)` of the hash slot for heap-array node `i`.
    ///
    /// `i < internal_count` selects the internals region; otherwise the
    /// leaves region, after subtracting `internal_count`.
    #[must_use]
    pub fn node_slot(&self, i: u64) -> (u64, u64) {
        let start = if i < self.internal_count {
            self.internals_offset + i * HASH_SIZE as u64
        } else {
            let leaf_i = i - self.internal_count;
            self.leaves_offset + leaf_i * HASH_SIZE as u64
        };
        (start, start + HASH_SIZE as u64)
    }

    /// Byte offset and bit offset within the bitset region for node `i`.
    #[must_use]
    pub fn bit_position(&self, i: u64) -> (u64, u8) {
        let byte = self.bitset_offset + i / 8;
        let bit = (i % 8) as u8;
        (byte, bit)
    }

    /// Leaf capacity this layout was derived for.
    #[must_use]
    pub const fn cap_leaf(&self) -> u64 {
        self.cap_leaf
    }
}

/// Number of bytes needed to store one bit per node.
#[must_use]
pub fn bitset_bytes_for(node_count: u64) -> u64 {
    (node_count + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_contiguous_and_cover_file() {
        let g = Geometry::new(5 * chunkvault_geometry::MIN_CHUNK_SIZE);
        let l = Layout::new(&g);
        assert_eq!(l.footer_offset() + FOOTER_LEN as u64, l.total_len());
        assert_eq!(l.digest_region_end(), l.footer_offset() - l.bitset_size());
    }

    #[test]
    fn node_slots_do_not_overlap() {
        let g = Geometry::new(5 * chunkvault_geometry::MIN_CHUNK_SIZE);
        let l = Layout::new(&g);
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..g.node_count() {
            let (s, e) = l.node_slot(i);
            assert!(e - s == HASH_SIZE as u64);
            assert!(seen.insert(s), "overlap at node {i}");
            assert!(e <= l.digest_region_end());
        }
    }
}
