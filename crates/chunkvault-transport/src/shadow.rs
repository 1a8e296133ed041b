//! Shadow tree: separates "hash computed locally" from "bytes durable and
//! verified" (`spec.md` §4.7).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use chunkvault_geometry::Geometry;
use chunkvault_merkle::{leaf_hash, MerkleTree};

use crate::error::{Error, Result};

/// Tracks, per chunk, whether bytes have been verified against the
/// reference tree and durably written to the content file.
///
/// The shadow bit and the local tree's leaf-validity bit are set together
/// under [`Self::bits`]'s mutex so the two never diverge in the "set"
/// direction (`spec.md` §9, open question 3).
pub struct ShadowTree {
    reference: Arc<MerkleTree>,
    local: Arc<MerkleTree>,
    content_path: PathBuf,
    geometry: Geometry,
    bits: Mutex<Vec<bool>>,
}

impl ShadowTree {
    /// Build a shadow over `geometry.total_chunks()` chunks, all initially
    /// unverified.
    #[must_use]
    pub fn new(
        reference: Arc<MerkleTree>,
        local: Arc<MerkleTree>,
        content_path: PathBuf,
        geometry: Geometry,
    ) -> Self {
        let bits = vec![false; geometry.total_chunks() as usize];
        Self {
            reference,
            local,
            content_path,
            geometry,
            bits: Mutex::new(bits),
        }
    }

    /// Submit a chunk's bytes. Returns `Ok(true)` if the bytes matched the
    /// reference and were committed durably, `Ok(false)` on a hash mismatch.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an out-of-range index,
    /// [`Error::ReferenceMissing`] if the reference tree has no valid hash
    /// for this chunk, or [`Error::Io`] on a filesystem failure.
    pub fn submit(&self, chunk_index: u64, bytes: &[u8]) -> Result<bool> {
        if chunk_index >= self.geometry.total_chunks() {
            return Err(Error::InvalidArgument(format!(
                "chunk {chunk_index} out of range"
            )));
        }
        let heap_idx = self.geometry.leaf_pos(chunk_index);
        let reference_hash = self
            .reference
            .get_hash(heap_idx)
            .map_err(|_| Error::ReferenceMissing(chunk_index))?;

        let actual_hash = leaf_hash(bytes);
        if actual_hash != reference_hash {
            return Ok(false);
        }

        let (start, _end) = self.geometry.chunk_boundary(chunk_index)?;
        write_at_and_fsync(&self.content_path, start, bytes)?;

        let mut bits = self.bits.lock();
        self.local.submit_chunk(chunk_index, bytes)?;
        bits[chunk_index as usize] = true;
        Ok(true)
    }

    /// The local tree this shadow commits verified leaves into.
    #[must_use]
    pub fn local(&self) -> &Arc<MerkleTree> {
        &self.local
    }

    /// Whether chunk `i` is currently shadow-verified.
    #[must_use]
    pub fn is_verified(&self, i: u64) -> bool {
        self.bits.lock().get(i as usize).copied().unwrap_or(false)
    }

    /// Read chunk `i`'s bytes from the content file.
    ///
    /// # Errors
    /// Returns [`Error::NotVerified`] if the chunk has not been shadow-verified.
    pub fn read_chunk(&self, i: u64) -> Result<Vec<u8>> {
        if !self.is_verified(i) {
            return Err(Error::NotVerified(i));
        }
        let (start, end) = self.geometry.chunk_boundary(i)?;
        read_at(&self.content_path, start, (end - start) as usize)
    }

    /// Reconcile the shadow bitmap against bytes already on disk: a chunk
    /// whose on-disk bytes hash to the reference leaf is marked verified
    /// without a network fetch (`spec.md` §8 scenario 4, crash recovery).
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a filesystem failure reading the content file.
    pub fn reconcile_from_content(&self) -> Result<()> {
        for i in 0..self.geometry.total_chunks() {
            if self.is_verified(i) {
                continue;
            }
            let (start, end) = self.geometry.chunk_boundary(i)?;
            let len = (end - start) as usize;
            let Ok(bytes) = read_at(&self.content_path, start, len) else {
                continue;
            };
            let heap_idx = self.geometry.leaf_pos(i);
            let matches = self
                .reference
                .get_hash(heap_idx)
                .map(|h| h == leaf_hash(&bytes))
                .unwrap_or(false);
            if matches {
                let mut bits = self.bits.lock();
                self.local.submit_chunk(i, &bytes)?;
                bits[i as usize] = true;
            }
        }
        Ok(())
    }
}

fn write_at_and_fsync(path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()?;
    Ok(())
}

fn read_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
