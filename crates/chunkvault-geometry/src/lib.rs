// crates/chunkvault-geometry/src/lib.rs

//! Pure chunk/tree shape arithmetic shared by the rest of chunkvault.
//!
//! [`Geometry`] maps a single scalar — the total content size — onto every
//! other shape quantity the Merkle tree, painter, and channel need: chunk
//! size, chunk count, and the complete-binary-tree layout those chunks live
//! in once hashed. It does no I/O and holds no state beyond the size it was
//! built from, so it is safe to recompute on every call and share freely
//! across threads.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

use thiserror::Error;

/// Smallest chunk size considered: 1 MiB.
pub const MIN_CHUNK_SIZE: u64 = 1 << 20;
/// Largest chunk size considered: 64 MiB.
pub const MAX_CHUNK_SIZE: u64 = 1 << 26;
/// Chunk size doubles until the chunk count drops to this many or fewer.
pub const MAX_CHUNKS: u64 = 4096;

/// Errors raised by geometry queries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A byte position or chunk index fell outside `[0, total_size)` / `[0, total_chunks)`.
    #[error("position/index {value} out of range for total_size={total_size}")]
    OutOfRange {
        /// The offending value.
        value: u64,
        /// The content's total size, for context.
        total_size: u64,
    },
}

/// A `Result` alias for geometry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Derived, immutable shape of a chunked, Merkle-hashed file of a given size.
///
/// Two geometries built from the same `total_size` are always identical —
/// there is no configuration, randomness, or platform dependence anywhere in
/// this type (`spec.md` §8, "Determinism of geometry").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u64,
    cap_leaf: u64,
    node_count: u64,
}

impl Geometry {
    /// Derive the geometry for a file of `total_size` bytes.
    #[must_use]
    pub fn new(total_size: u64) -> Self {
        let chunk_size = choose_chunk_size(total_size);
        let total_chunks = div_ceil(total_size, chunk_size);
        // Tree shape needs at least one leaf even when there is no content:
        // a degenerate single-leaf tree whose leaf hashes to the empty digest.
        let shape_leaves = total_chunks.max(1);
        let cap_leaf = shape_leaves.next_power_of_two();
        let node_count = 2 * cap_leaf - 1;

        Self {
            total_size,
            chunk_size,
            total_chunks,
            cap_leaf,
            node_count,
        }
    }

    /// Total content size this geometry was derived from.
    #[inline]
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Chunk size in bytes. Always a power of two in `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of real (non-padding) chunks. Zero iff `total_size == 0`.
    #[inline]
    #[must_use]
    pub const fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Leaf capacity of the complete binary tree: the smallest power of two
    /// that is `>= max(total_chunks, 1)`.
    #[inline]
    #[must_use]
    pub const fn cap_leaf(&self) -> u64 {
        self.cap_leaf
    }

    /// Heap-array index of leaf 0 (`cap_leaf - 1`).
    #[inline]
    #[must_use]
    pub const fn leaf_offset(&self) -> u64 {
        self.cap_leaf - 1
    }

    /// Total node count of the flat heap array (`2 * cap_leaf - 1`).
    #[inline]
    #[must_use]
    pub const fn node_count(&self) -> u64 {
        self.node_count
    }

    /// Number of internal (non-leaf) nodes (`cap_leaf - 1`).
    #[inline]
    #[must_use]
    pub const fn internal_node_count(&self) -> u64 {
        self.cap_leaf - 1
    }

    /// Heap-array position of leaf `i` (`0 <= i < cap_leaf`).
    #[inline]
    #[must_use]
    pub const fn leaf_pos(&self, i: u64) -> u64 {
        self.leaf_offset() + i
    }

    /// `true` if leaf index `i` is a padding leaf (`i >= total_chunks`).
    #[inline]
    #[must_use]
    pub const fn is_padding_leaf(&self, i: u64) -> bool {
        i >= self.total_chunks
    }

    /// Half-open byte range `[start, end)` covered by chunk `i`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfRange`] if `i >= total_chunks`.
    pub fn chunk_boundary(&self, i: u64) -> Result<(u64, u64)> {
        if i >= self.total_chunks {
            return Err(Error::OutOfRange {
                value: i,
                total_size: self.total_size,
            });
        }
        let start = i * self.chunk_size;
        let end = ((i + 1) * self.chunk_size).min(self.total_size);
        Ok((start, end))
    }

    /// Length in bytes of chunk `i` (short for the final chunk, else `chunk_size`).
    ///
    /// # Errors
    /// Returns [`Error::OutOfRange`] if `i >= total_chunks`.
    pub fn chunk_len(&self, i: u64) -> Result<u64> {
        let (start, end) = self.chunk_boundary(i)?;
        Ok(end - start)
    }

    /// Index of the chunk containing byte `position`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfRange`] if `position >= total_size`.
    pub fn chunk_of(&self, position: u64) -> Result<u64> {
        if position >= self.total_size {
            return Err(Error::OutOfRange {
                value: position,
                total_size: self.total_size,
            });
        }
        Ok(position / self.chunk_size)
    }

    /// Parent index of heap-array position `i` (root has no parent; callers
    /// must not call this with `i == 0`).
    #[inline]
    #[must_use]
    pub const fn parent(i: u64) -> u64 {
        (i - 1) / 2
    }

    /// Children `(left, right)` of heap-array position `i`.
    #[inline]
    #[must_use]
    pub const fn children(i: u64) -> (u64, u64) {
        (2 * i + 1, 2 * i + 2)
    }
}

/// `ceil(a / b)`, treating `a == 0` as zero regardless of `b`.
#[inline]
const fn div_ceil(a: u64, b: u64) -> u64 {
    if a == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Smallest power-of-two chunk size in `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]` that
/// keeps the chunk count at or below [`MAX_CHUNKS`].
fn choose_chunk_size(total_size: u64) -> u64 {
    let mut cs = MIN_CHUNK_SIZE;
    while cs < MAX_CHUNK_SIZE {
        if div_ceil(total_size, cs) <= MAX_CHUNKS {
            break;
        }
        cs *= 2;
    }
    cs
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_content_has_zero_chunks_and_degenerate_tree() {
        let g = Geometry::new(0);
        assert_eq!(g.total_chunks(), 0);
        assert_eq!(g.cap_leaf(), 1);
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.chunk_size(), MIN_CHUNK_SIZE);
        assert!(matches!(g.chunk_of(0), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn small_file_uses_minimum_chunk_size() {
        let g = Geometry::new(3 * MIN_CHUNK_SIZE);
        assert_eq!(g.chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(g.total_chunks(), 3);
        assert_eq!(g.cap_leaf(), 4);
        assert_eq!(g.node_count(), 7);
    }

    #[test]
    fn exact_multiple_has_full_last_chunk() {
        let g = Geometry::new(4 * MIN_CHUNK_SIZE);
        let (start, end) = g.chunk_boundary(3).unwrap();
        assert_eq!(end - start, MIN_CHUNK_SIZE);
        assert_eq!(end, g.total_size());
    }

    #[test]
    fn non_multiple_has_short_last_chunk() {
        let g = Geometry::new(3 * MIN_CHUNK_SIZE + 17);
        assert_eq!(g.total_chunks(), 4);
        let (start, end) = g.chunk_boundary(3).unwrap();
        assert_eq!(end - start, 17);
    }

    #[test]
    fn chunk_count_threshold_doubles_chunk_size() {
        // 4096 chunks at 1 MiB is exactly at the threshold; one more chunk's
        // worth of bytes must push the chunk size to 2 MiB.
        let at_threshold = Geometry::new(MAX_CHUNKS * MIN_CHUNK_SIZE);
        assert_eq!(at_threshold.chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(at_threshold.total_chunks(), MAX_CHUNKS);

        let over_threshold = Geometry::new(MAX_CHUNKS * MIN_CHUNK_SIZE + 1);
        assert_eq!(over_threshold.chunk_size(), MIN_CHUNK_SIZE * 2);
    }

    #[test]
    fn chunk_size_caps_at_64_mib() {
        let g = Geometry::new(u64::from(u32::MAX) * 1024);
        assert!(g.chunk_size() <= MAX_CHUNK_SIZE);
        assert!(g.chunk_size().is_power_of_two());
    }

    #[test]
    fn parent_and_children_are_inverse() {
        for i in 1u64..200 {
            let (l, r) = Geometry::children(i);
            assert_eq!(Geometry::parent(l), i);
            assert_eq!(Geometry::parent(r), i);
        }
    }

    #[test]
    fn chunk_spanning_exactly_two_chunks_at_boundary() {
        let g = Geometry::new(4 * MIN_CHUNK_SIZE);
        let lo = g.chunk_of(MIN_CHUNK_SIZE - 1).unwrap();
        let hi = g.chunk_of(MIN_CHUNK_SIZE).unwrap();
        assert_eq!(lo, 0);
        assert_eq!(hi, 1);
    }

    proptest::proptest! {
        #[test]
        fn determinism(total_size in 0u64..(8 * MAX_CHUNK_SIZE)) {
            let a = Geometry::new(total_size);
            let b = Geometry::new(total_size);
            prop_assert_eq!(a, b);
            prop_assert!(a.chunk_size().is_power_of_two());
            prop_assert!(a.chunk_size() >= MIN_CHUNK_SIZE);
            prop_assert!(a.chunk_size() <= MAX_CHUNK_SIZE);
            prop_assert!(a.cap_leaf().is_power_of_two());
            prop_assert!(a.cap_leaf() >= a.total_chunks());
        }

        #[test]
        fn boundaries_are_contiguous(total_size in 1u64..(4 * MAX_CHUNK_SIZE)) {
            let g = Geometry::new(total_size);
            let mut expected_start = 0u64;
            for i in 0..g.total_chunks() {
                let (start, end) = g.chunk_boundary(i).unwrap();
                prop_assert_eq!(start, expected_start);
                prop_assert!(end > start);
                expected_start = end;
            }
            prop_assert_eq!(expected_start, total_size);
        }
    }
}
