//! The persisted, memory-mapped Merkle tree (`spec.md` §4.1-§4.3).
//!
//! A tree is a complete binary tree over `cap_leaf` chunk slots, stored as
//! two contiguous hash arrays (internals, then leaves) plus a per-node
//! validity bitset and a fixed-size footer. Padding leaves (beyond
//! `total_chunks`) are populated at creation time with the empty-chunk hash;
//! real leaves start invalid and become valid one [`MerkleTree::submit_chunk`]
//! at a time. An internal node is valid exactly when both of its children
//! are, and its hash is the hash of its children's hashes concatenated —
//! callers never set an internal hash directly.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

use chunkvault_geometry::Geometry;

use crate::error::{Error, Hash, Result, HASH_SIZE};
use crate::footer::Footer;
use crate::hash::{empty_leaf_hash, leaf_hash, parent_hash, region_digest};
use crate::layout::Layout;

struct Inner {
    file: File,
    mmap: MmapMut,
    geometry: Geometry,
    layout: Layout,
}

impl Inner {
    fn get_bit(&self, i: u64) -> bool {
        let (byte, bit) = self.layout.bit_position(i);
        (self.mmap[byte as usize] >> bit) & 1 == 1
    }

    fn set_bit(&mut self, i: u64) {
        let (byte, bit) = self.layout.bit_position(i);
        self.mmap[byte as usize] |= 1 << bit;
    }

    fn clear_bit(&mut self, i: u64) {
        let (byte, bit) = self.layout.bit_position(i);
        self.mmap[byte as usize] &= !(1 << bit);
    }

    fn node_hash(&self, i: u64) -> Option<Hash> {
        if !self.get_bit(i) {
            return None;
        }
        let (s, e) = self.layout.node_slot(i);
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&self.mmap[s as usize..e as usize]);
        Some(h)
    }

    fn set_node_hash(&mut self, i: u64, hash: &Hash) {
        let (s, e) = self.layout.node_slot(i);
        self.mmap[s as usize..e as usize].copy_from_slice(hash);
        self.set_bit(i);
    }

    /// Recompute `i`'s parent chain, stopping as soon as a parent cannot be
    /// derived (sibling not yet valid).
    fn propagate_up(&mut self, mut i: u64) {
        while i != 0 {
            let parent = Geometry::parent(i);
            let (l, r) = Geometry::children(parent);
            match (self.node_hash(l), self.node_hash(r)) {
                (Some(lh), Some(rh)) => self.set_node_hash(parent, &parent_hash(&lh, &rh)),
                _ => {
                    self.clear_bit(parent);
                    break;
                }
            }
            i = parent;
        }
    }

    fn recompute_all_internals(&mut self) {
        let internal_count = self.geometry.internal_node_count();
        for i in (0..internal_count).rev() {
            let (l, r) = Geometry::children(i);
            match (self.node_hash(l), self.node_hash(r)) {
                (Some(lh), Some(rh)) => self.set_node_hash(i, &parent_hash(&lh, &rh)),
                _ => self.clear_bit(i),
            }
        }
    }

    fn tree_region_digest(&self) -> Hash {
        region_digest(&self.mmap[0..self.layout.digest_region_end() as usize])
    }

    fn write_footer(&mut self) {
        let footer = Footer {
            chunk_size: self.geometry.chunk_size(),
            total_size: self.geometry.total_size(),
            bitset_size: u32::try_from(self.layout.bitset_size()).unwrap_or(u32::MAX),
            digest_of_tree: self.tree_region_digest(),
        };
        let bytes = footer.encode();
        let off = self.layout.footer_offset() as usize;
        self.mmap[off..off + bytes.len()].copy_from_slice(&bytes);
    }
}

/// A memory-mapped, lazily-recomputed Merkle tree over a chunked file.
pub struct MerkleTree(RwLock<Inner>);

impl MerkleTree {
    /// Create a new, mostly-empty tree file for `total_size` bytes of content.
    ///
    /// Padding leaves are populated immediately; real leaves start invalid
    /// and must be filled in with [`Self::submit_chunk`].
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file cannot be created or sized.
    pub fn create_empty(path: impl AsRef<Path>, total_size: u64) -> Result<Self> {
        let geometry = Geometry::new(total_size);
        let layout = Layout::new(&geometry);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(layout.total_len())?;
        let mmap = map_file(&file)?;

        let mut inner = Inner {
            file,
            mmap,
            geometry,
            layout,
        };

        let padding_hash = empty_leaf_hash();
        for i in geometry.total_chunks()..geometry.cap_leaf() {
            let heap_idx = geometry.leaf_pos(i);
            inner.set_node_hash(heap_idx, &padding_hash);
        }
        inner.write_footer();
        inner.mmap.flush()?;

        debug!(total_size, chunk_size = geometry.chunk_size(), "created merkle tree");
        Ok(Self(RwLock::new(inner)))
    }

    /// Open an existing tree file, verifying its footer and region digest.
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] if the footer, size, or digest checks fail.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = map_file(&file)?;

        let footer = Footer::read_tail(&mmap)?;
        let geometry = Geometry::new(footer.total_size);
        if geometry.chunk_size() != footer.chunk_size {
            return Err(Error::Corrupt(format!(
                "footer chunk_size {} disagrees with derived {}",
                footer.chunk_size,
                geometry.chunk_size()
            )));
        }
        let layout = Layout::new(&geometry);
        if mmap.len() as u64 != layout.total_len() {
            return Err(Error::Corrupt(format!(
                "file length {} disagrees with derived layout length {}",
                mmap.len(),
                layout.total_len()
            )));
        }

        let inner = Inner {
            file,
            mmap,
            geometry,
            layout,
        };
        let actual_digest = inner.tree_region_digest();
        if actual_digest != footer.digest_of_tree {
            return Err(Error::Corrupt(
                "tree region digest does not match footer".into(),
            ));
        }

        Ok(Self(RwLock::new(inner)))
    }

    /// Create a tree file and submit every chunk of `data` into it, then
    /// finalize with [`Self::close`].
    ///
    /// # Errors
    /// Returns [`Error::Io`] on file I/O failure.
    pub fn build_from_data(path: impl AsRef<Path>, data: &[u8]) -> Result<Self> {
        let total_size = data.len() as u64;
        let tree = Self::create_empty(path, total_size)?;
        let geometry = Geometry::new(total_size);
        for i in 0..geometry.total_chunks() {
            let (start, end) = geometry
                .chunk_boundary(i)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
            tree.submit_chunk(i, &data[start as usize..end as usize])?;
        }
        tree.close()?;
        Ok(tree)
    }

    /// The total content size this tree was shaped for.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.0.read().geometry.total_size()
    }

    /// Hash of chunk `index` if it has been submitted, else `None`.
    #[must_use]
    pub fn leaf_hash(&self, index: u64) -> Option<Hash> {
        let inner = self.0.read();
        let heap_idx = inner.geometry.leaf_pos(index);
        inner.node_hash(heap_idx)
    }

    /// Submit the content of chunk `index`, hashing it and propagating
    /// validity up the tree as far as sibling data allows.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `index` is out of range or
    /// `bytes` does not match the chunk's expected length.
    pub fn submit_chunk(&self, index: u64, bytes: &[u8]) -> Result<()> {
        let mut inner = self.0.write();
        let expected_len = inner
            .geometry
            .chunk_len(index)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        if bytes.len() as u64 != expected_len {
            return Err(Error::InvalidArgument(format!(
                "chunk {index} expected {expected_len} bytes, got {}",
                bytes.len()
            )));
        }
        let heap_idx = inner.geometry.leaf_pos(index);
        let hash = leaf_hash(bytes);
        inner.set_node_hash(heap_idx, &hash);
        inner.propagate_up(heap_idx);
        Ok(())
    }

    /// Recompute every internal node bottom-up from whatever leaves are
    /// currently valid. Internal nodes whose children are not both valid
    /// are left (or made) invalid.
    pub fn compute_all_internals(&self) {
        self.0.write().recompute_all_internals();
    }

    /// Hash stored at heap-array position `i`.
    ///
    /// # Errors
    /// Returns [`Error::NotValid`] if the node has no currently-valid hash.
    pub fn get_hash(&self, i: u64) -> Result<Hash> {
        self.0.read().node_hash(i).ok_or(Error::NotValid(i))
    }

    /// The tree's root hash.
    ///
    /// # Errors
    /// Returns [`Error::NotValid`] if not every leaf has been submitted.
    pub fn root_hash(&self) -> Result<Hash> {
        self.get_hash(0)
    }

    /// Whether heap-array node `i` currently has a valid hash.
    #[must_use]
    pub fn is_valid(&self, i: u64) -> bool {
        self.0.read().get_bit(i)
    }

    /// Recompute internals, rewrite the footer's digest, and flush to disk.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the flush fails.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.0.write();
        inner.recompute_all_internals();
        inner.write_footer();
        inner.mmap.flush()?;
        Ok(())
    }

    /// Walk two trees of identical shape from the root down, returning the
    /// leaf indices in `[start_leaf, end_leaf)` where content differs,
    /// descending only into subtrees whose hash disagrees and pruning any
    /// subtree whose leaf range does not overlap the requested bound
    /// (`spec.md` §4.4, reference-tree diffing).
    ///
    /// Leaves valid in `self` but not in `other` (or vice versa) count as a
    /// mismatch, since the sync protocol must still fetch them.
    #[must_use]
    pub fn find_mismatches(&self, other: &MerkleTree, start_leaf: u64, end_leaf: u64) -> Vec<u64> {
        let a = self.0.read();
        let b = other.0.read();
        let mut out = Vec::new();
        diff_subtree(&a, &b, 0, 0, a.geometry.cap_leaf(), start_leaf, end_leaf, &mut out);
        out
    }
}

#[allow(clippy::too_many_arguments)]
fn diff_subtree(
    a: &Inner,
    b: &Inner,
    i: u64,
    leaf_lo: u64,
    leaf_hi: u64,
    start_leaf: u64,
    end_leaf: u64,
    out: &mut Vec<u64>,
) {
    if leaf_hi <= start_leaf || leaf_lo >= end_leaf {
        return;
    }
    if a.node_hash(i) == b.node_hash(i) {
        return;
    }
    let leaf_offset = a.geometry.leaf_offset();
    if i >= leaf_offset {
        let leaf_idx = i - leaf_offset;
        if leaf_idx >= start_leaf && leaf_idx < end_leaf {
            out.push(leaf_idx);
        }
        return;
    }
    let mid = leaf_lo + (leaf_hi - leaf_lo) / 2;
    let (l, r) = Geometry::children(i);
    diff_subtree(a, b, l, leaf_lo, mid, start_leaf, end_leaf, out);
    diff_subtree(a, b, r, mid, leaf_hi, start_leaf, end_leaf, out);
}

/// Map `file` for reading and writing.
///
/// # Safety
/// The caller must not allow another process or mapping to truncate or
/// rewrite the file out from under this mapping while it is alive; this
/// crate holds `file` alongside the mapping for its entire lifetime and
/// never shares it with code that does.
fn map_file(file: &File) -> Result<MmapMut> {
    let mmap = unsafe { memmap2::MmapMut::map_mut(file)? };
    Ok(mmap)
}
