//! Verified, random-access read channel over a remote file (`spec.md` §4.6).
//!
//! Opening a channel runs reference acquisition (`chunkvault_sync`), then
//! steps 4–5 of the same protocol for the *local* progress-tracking tree:
//! ensure a content file exists, and either start a fresh local tree shaped
//! like the reference or rebuild one from on-disk content that is newer
//! than the recorded local tree state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::{Client, Url};
use tracing::info;

use chunkvault_geometry::Geometry;
use chunkvault_merkle::{leaf_hash, MerkleTree};
use chunkvault_sync::{ReferenceSync, SyncConfig};

use crate::error::{Error, Result};
use crate::painter::{Painter, PainterConfig, Progress};
use crate::shadow::ShadowTree;

/// Local cache paths a channel operates on, all siblings of the content
/// file (`spec.md` §6, "Local filesystem layout").
#[derive(Clone, Debug)]
pub struct CachePaths {
    /// Sparse content file; logical size is the reference tree's `total_size`.
    pub content: PathBuf,
    /// Authoritative tree downloaded from the origin.
    pub reference: PathBuf,
    /// Local tree tracking which chunks this client has verified.
    pub local: PathBuf,
}

impl CachePaths {
    /// Derive the three sibling cache paths from a single base path.
    #[must_use]
    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let mut reference = base.clone();
        reference.set_extension("mrkl");
        let mut local = base.clone();
        local.set_extension("mrkl.local");
        Self {
            content: base,
            reference,
            local,
        }
    }
}

/// A read-only, integrity-verified random-access handle to a remote file.
pub struct VerifiedChannel {
    painter: Arc<Painter>,
    shadow: Arc<ShadowTree>,
    content_path: PathBuf,
    total_size: u64,
}

impl VerifiedChannel {
    /// Open a channel against `data_url`, using `cache` for local state.
    ///
    /// Runs the full five-step reference-tree acquisition protocol: fetches
    /// and validates the reference tree (or reuses it if its footer still
    /// matches the remote), ensures the content file exists, and either
    /// starts a fresh local tree or rebuilds one from content newer than the
    /// recorded local tree state.
    ///
    /// # Errors
    /// Returns [`Error::ReferenceUnavailable`] if the origin is unreachable,
    /// or [`Error::Io`] on a local filesystem failure.
    pub async fn open(
        client: Client,
        data_url: &str,
        cache: &CachePaths,
        sync_config: &SyncConfig,
    ) -> Result<Self> {
        let reference = Arc::new(ReferenceSync::open(&client, data_url, &cache.reference, sync_config).await?);
        let geometry = Geometry::new(reference.total_size());

        if !cache.content.exists() {
            tokio::fs::File::create(&cache.content).await?;
        }

        let local = Arc::new(open_or_rebuild_local_tree(
            &cache.local,
            &cache.content,
            &reference,
            geometry,
        )?);

        let shadow = Arc::new(ShadowTree::new(
            Arc::clone(&reference),
            Arc::clone(&local),
            cache.content.clone(),
            geometry,
        ));
        shadow.reconcile_from_content()?;

        let content_url = Url::parse(data_url).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let painter = Arc::new(Painter::new(
            client,
            content_url,
            reference,
            Arc::clone(&shadow),
            geometry,
            PainterConfig::for_geometry(&geometry),
        ));

        Ok(Self {
            painter,
            shadow,
            content_path: cache.content.clone(),
            total_size: geometry.total_size(),
        })
    }

    /// The reference tree's total content size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.total_size
    }

    /// Read up to `buf.len()` bytes starting at `position`, painting every
    /// chunk the range touches before copying from the content file.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `position >= size()`, or
    /// whatever error the underlying paint failed with.
    pub async fn read(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        if position >= self.total_size {
            return Err(Error::InvalidArgument(format!(
                "position {position} out of range for size {}",
                self.total_size
            )));
        }
        let effective_len = buf.len().min((self.total_size - position) as usize) as u64;
        if effective_len == 0 {
            return Ok(0);
        }

        self.painter.paint(position, position + effective_len).await?;

        let bytes = read_at(&self.content_path, position, effective_len as usize)?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Schedule `[position, position + length)` to be painted in the
    /// background, for latency hiding ahead of a future [`Self::read`].
    #[must_use]
    pub fn prebuffer(&self, position: u64, length: u64) -> Progress {
        let end = (position + length).min(self.total_size);
        self.painter.paint_async(position, end)
    }

    /// Writes are unsupported on this read-only channel.
    ///
    /// # Errors
    /// Always returns [`Error::Unsupported`].
    pub fn write(&self, _buf: &[u8], _position: u64) -> Result<usize> {
        Err(Error::Unsupported("write"))
    }

    /// Locking is unsupported on this read-only channel.
    ///
    /// # Errors
    /// Always returns [`Error::Unsupported`].
    pub fn lock(&self) -> Result<()> {
        Err(Error::Unsupported("lock"))
    }

    /// Truncation is unsupported on this read-only channel.
    ///
    /// # Errors
    /// Always returns [`Error::Unsupported`].
    pub fn truncate(&self, _len: u64) -> Result<()> {
        Err(Error::Unsupported("truncate"))
    }

    /// Whether chunk `i` is currently shadow-verified.
    #[must_use]
    pub fn is_verified(&self, i: u64) -> bool {
        self.shadow.is_verified(i)
    }

    /// Close the painter (flushing the local tree), then drop the content
    /// file handle.
    pub fn close(&self) {
        self.painter.close();
    }
}

fn open_or_rebuild_local_tree(
    local_path: &Path,
    content_path: &Path,
    reference: &MerkleTree,
    geometry: Geometry,
) -> Result<MerkleTree> {
    if !local_path.exists() {
        return Ok(MerkleTree::create_empty(local_path, geometry.total_size())?);
    }

    let local_mtime = std::fs::metadata(local_path).and_then(|m| m.modified()).ok();
    let content_mtime = std::fs::metadata(content_path).and_then(|m| m.modified()).ok();

    if let (Some(content_mtime), Some(local_mtime)) = (content_mtime, local_mtime) {
        if content_mtime > local_mtime {
            info!(path = ?local_path, "content newer than local tree, re-verifying from disk");
            return rebuild_local_tree_from_content(local_path, content_path, reference, geometry);
        }
    }

    match MerkleTree::load(local_path) {
        Ok(tree) => Ok(tree),
        Err(_) => Ok(MerkleTree::create_empty(local_path, geometry.total_size())?),
    }
}

/// Start a fresh local tree and mark only the chunks whose on-disk bytes
/// actually hash to the matching reference leaf as valid — mirrors
/// [`crate::shadow::ShadowTree::reconcile_from_content`]'s per-chunk check
/// rather than trusting the content file wholesale (`spec.md` §8 scenario 4).
fn rebuild_local_tree_from_content(
    local_path: &Path,
    content_path: &Path,
    reference: &MerkleTree,
    geometry: Geometry,
) -> Result<MerkleTree> {
    let local = MerkleTree::create_empty(local_path, geometry.total_size())?;
    for chunk_index in 0..geometry.total_chunks() {
        let (start, end) = geometry.chunk_boundary(chunk_index)?;
        let len = (end - start) as usize;
        let Ok(bytes) = read_at(content_path, start, len) else {
            continue;
        };
        let heap_idx = geometry.leaf_pos(chunk_index);
        let matches = reference
            .get_hash(heap_idx)
            .map(|h| h == leaf_hash(&bytes))
            .unwrap_or(false);
        if matches {
            local.submit_chunk(chunk_index, &bytes)?;
        }
    }
    Ok(local)
}

fn read_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_paths_derive_siblings() {
        let paths = CachePaths::from_base("/cache/dataset.bin");
        assert_eq!(paths.reference, PathBuf::from("/cache/dataset.mrkl"));
        assert_eq!(paths.local, PathBuf::from("/cache/dataset.mrkl.local"));
    }
}
