//! Chunk painter: ensures every chunk covering a requested byte range
//! becomes shadow-verified, deduplicating concurrent fetches and optionally
//! reading ahead of a sequential access pattern (`spec.md` §4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, Url};
use tracing::{debug, trace, warn};

use chunkvault_geometry::Geometry;
use chunkvault_merkle::{leaf_hash, MerkleTree};

use crate::error::{Error, Result};
use crate::inflight::{AcquireResult, InFlight, Outcome};
use crate::shadow::ShadowTree;

/// The five tunable knobs of the scheduling algorithm, defaulted per `spec.md` §4.5.
#[derive(Clone, Copy, Debug)]
pub struct PainterConfig {
    /// Fetches are sized at least this many bytes unless bounded by file end.
    pub min_download_size: u64,
    /// Upper bound on a single range GET.
    pub max_download_size: u64,
    /// Consecutive contiguous paint requests before read-ahead activates.
    pub autobuffer_threshold: u32,
    /// Number of additional max-sized fetches scheduled while autobuffering.
    pub readahead_requests: u32,
    /// Per-chunk verification retries before surfacing `ChunkVerificationFailed`.
    pub verify_retries: u8,
}

impl PainterConfig {
    /// Defaults scaled to `geometry`'s chunk size, as the spec defines them
    /// relative to it rather than as fixed byte counts.
    #[must_use]
    pub fn for_geometry(geometry: &Geometry) -> Self {
        Self {
            min_download_size: geometry.chunk_size(),
            max_download_size: 16 * geometry.chunk_size(),
            autobuffer_threshold: 10,
            readahead_requests: 4,
            verify_retries: 3,
        }
    }
}

struct AutoBufferState {
    last_end_chunk: Option<u64>,
    sequential_count: u32,
}

/// A handle to an in-progress [`Painter::paint_async`] call.
pub struct Progress(tokio::task::JoinHandle<Result<()>>);

impl Progress {
    /// Wait for the paint to finish, returning its result.
    ///
    /// # Errors
    /// Returns whatever error the paint failed with, or [`Error::Cancelled`]
    /// if the underlying task was aborted.
    pub async fn wait(self) -> Result<()> {
        self.0.await.map_err(|_| Error::Cancelled)?
    }
}

/// Schedules, deduplicates, and verifies chunk fetches against one origin.
pub struct Painter {
    client: Client,
    content_url: Url,
    reference: Arc<MerkleTree>,
    shadow: Arc<ShadowTree>,
    geometry: Geometry,
    config: PainterConfig,
    inflight: InFlight,
    autobuffer: Mutex<AutoBufferState>,
    closed: AtomicBool,
}

impl Painter {
    /// Build a painter over `content_url`, verifying fetched bytes against
    /// `reference` and committing them through `shadow`.
    #[must_use]
    pub fn new(
        client: Client,
        content_url: Url,
        reference: Arc<MerkleTree>,
        shadow: Arc<ShadowTree>,
        geometry: Geometry,
        config: PainterConfig,
    ) -> Self {
        Self {
            client,
            content_url,
            reference,
            shadow,
            geometry,
            config,
            inflight: InFlight::new(),
            autobuffer: Mutex::new(AutoBufferState {
                last_end_chunk: None,
                sequential_count: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Block until every chunk covering `[start, end)` is shadow-verified.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an empty or out-of-range
    /// range, [`Error::Cancelled`] if the painter has been closed, or a
    /// transport/verification error from the underlying fetch.
    pub async fn paint(&self, start: u64, end: u64) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if start >= end || end > self.geometry.total_size() {
            return Err(Error::InvalidArgument(format!(
                "invalid paint range [{start}, {end})"
            )));
        }

        let c_lo = self.geometry.chunk_of(start)?;
        let c_hi = self.geometry.chunk_of(end - 1)?;

        let mut need: Vec<u64> = (c_lo..=c_hi)
            .filter(|&c| !self.shadow.is_verified(c))
            .collect();

        let extended_hi = self.update_autobuffer(c_lo, c_hi);
        if extended_hi > c_hi {
            need.extend((c_hi + 1..=extended_hi).filter(|&c| !self.shadow.is_verified(c)));
        }

        if need.is_empty() {
            trace!(start, end, "paint satisfied entirely from shadow");
            return Ok(());
        }

        let mut window_futures = Vec::new();
        for run in contiguous_runs(&need) {
            for window in split_into_windows(&self.geometry, &run, self.config.max_download_size) {
                window_futures.push(self.fetch_window(window));
            }
        }

        let results = futures::future::join_all(window_futures).await;
        for r in results {
            r?;
        }
        Ok(())
    }

    /// Non-blocking variant of [`Self::paint`]; the returned [`Progress`]
    /// resolves once the paint completes.
    pub fn paint_async(self: &Arc<Self>, start: u64, end: u64) -> Progress {
        let painter = Arc::clone(self);
        Progress(tokio::spawn(async move { painter.paint(start, end).await }))
    }

    /// Block until no fetch is currently in flight.
    pub async fn await_all(&self) {
        while !self.inflight.is_idle() {
            tokio::task::yield_now().await;
        }
    }

    /// [`Self::await_all`] bounded by `timeout`; returns `false` on timeout
    /// without cancelling the outstanding fetches.
    pub async fn await_all_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.await_all()).await.is_ok()
    }

    /// Cancel pending fetches and flush the local tree. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.shadow.local().close() {
            warn!(error = %e, "failed to flush local tree on close");
        }
    }

    fn update_autobuffer(&self, c_lo: u64, c_hi: u64) -> u64 {
        let mut state = self.autobuffer.lock();
        let contiguous = state.last_end_chunk == Some(c_lo.wrapping_sub(1)) && c_lo > 0;
        state.sequential_count = if contiguous { state.sequential_count + 1 } else { 0 };
        state.last_end_chunk = Some(c_hi);

        if state.sequential_count < self.config.autobuffer_threshold {
            return c_hi;
        }

        let readahead_chunks = (u64::from(self.config.readahead_requests)
            * self.config.max_download_size)
            / self.geometry.chunk_size().max(1);
        let max_chunk = self.geometry.total_chunks().saturating_sub(1);
        debug!(readahead_chunks, "autobuffer threshold reached, reading ahead");
        (c_hi + readahead_chunks).min(max_chunk)
    }

    async fn fetch_window(&self, window: Vec<u64>) -> Result<()> {
        let mut owned = Vec::new();
        let mut waiters = Vec::new();
        for c in window {
            match self.inflight.acquire_or_wait(c) {
                AcquireResult::Owner => owned.push(c),
                waiter @ AcquireResult::Waiter(_) => waiters.push(waiter),
            }
        }

        let owned_fut = self.fetch_and_verify_owned(owned);
        let wait_fut = futures::future::join_all(waiters.into_iter().map(AcquireResult::wait));

        let (owned_result, waited) = futures::future::join(owned_fut, wait_fut).await;
        for outcome in waited.into_iter().flatten() {
            outcome.into_result()?;
        }
        owned_result
    }

    async fn fetch_and_verify_owned(&self, owned: Vec<u64>) -> Result<()> {
        let Some(&first) = owned.first() else {
            return Ok(());
        };
        let last = *owned.last().unwrap_or(&first);
        let (range_start, _) = self.geometry.chunk_boundary(first)?;
        let (_, range_end) = self.geometry.chunk_boundary(last)?;

        let batch = self.fetch_range(range_start, range_end).await;

        let mut first_err = None;
        for c in owned {
            let initial_bytes = batch.as_ref().ok().map(|bytes| {
                let (cs, ce) = self
                    .geometry
                    .chunk_boundary(c)
                    .expect("chunk index came from this geometry's own range");
                let rel = (cs - range_start) as usize..(ce - range_start) as usize;
                bytes[rel].to_vec()
            });

            let result = self.verify_with_retry(c, initial_bytes).await;
            match &result {
                Ok(()) => self.inflight.complete(c, Outcome::Done),
                Err(e) => self.inflight.complete(c, Outcome::Failed(e.to_string())),
            }
            if first_err.is_none() {
                first_err = result.err();
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn verify_with_retry(&self, chunk_index: u64, first_bytes: Option<Vec<u8>>) -> Result<()> {
        let heap_idx = self.geometry.leaf_pos(chunk_index);
        let mut bytes = match first_bytes {
            Some(b) => b,
            None => self.refetch_single_chunk(chunk_index).await?,
        };

        for attempt in 0..self.config.verify_retries.max(1) {
            let expected = self
                .reference
                .get_hash(heap_idx)
                .map_err(|_| Error::ReferenceMissing(chunk_index))?;
            let actual = leaf_hash(&bytes);
            if actual == expected {
                self.shadow.submit(chunk_index, &bytes)?;
                return Ok(());
            }
            warn!(chunk_index, attempt, "chunk verification mismatch, retrying");
            if attempt + 1 >= self.config.verify_retries.max(1) {
                return Err(Error::ChunkVerificationFailed {
                    chunk_index,
                    expected,
                    actual,
                });
            }
            bytes = self.refetch_single_chunk(chunk_index).await?;
        }
        unreachable!("loop always returns before exhausting verify_retries iterations")
    }

    async fn refetch_single_chunk(&self, chunk_index: u64) -> Result<Vec<u8>> {
        let (start, end) = self.geometry.chunk_boundary(chunk_index)?;
        self.fetch_range(start, end).await
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let response = self
            .client
            .get(self.content_url.clone())
            .header(reqwest::header::RANGE, format!("bytes={start}-{}", end - 1))
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::PARTIAL_CONTENT && status != reqwest::StatusCode::OK {
            return Err(Error::Transport(format!("unexpected status {status}")));
        }

        let bytes = response.bytes().await?;
        let expected_len = (end - start) as usize;
        if bytes.len() != expected_len {
            return Err(Error::Transport(format!(
                "short body: got {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }
}

/// Group sorted, deduplicated chunk indices into maximal contiguous runs.
fn contiguous_runs(need: &[u64]) -> Vec<Vec<u64>> {
    let mut runs = Vec::new();
    let mut current: Vec<u64> = Vec::new();
    for &c in need {
        if let Some(&last) = current.last() {
            if c != last + 1 {
                runs.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Split one contiguous run into fetch-unit windows bounded by
/// `max_download_size` bytes. A single oversized chunk still gets its own
/// window; `min_download_size` is satisfied naturally since every non-final
/// chunk is a full `chunk_size`.
fn split_into_windows(geometry: &Geometry, run: &[u64], max_download_size: u64) -> Vec<Vec<u64>> {
    let mut windows = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;

    for &c in run {
        let len = geometry.chunk_len(c).unwrap_or_else(|_| geometry.chunk_size());
        if !current.is_empty() && current_bytes + len > max_download_size {
            windows.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(c);
        current_bytes += len;
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_split_on_gaps() {
        let runs = contiguous_runs(&[0, 1, 2, 5, 6, 9]);
        assert_eq!(runs, vec![vec![0, 1, 2], vec![5, 6], vec![9]]);
    }

    #[test]
    fn windows_respect_max_download_size() {
        let geometry = Geometry::new(10 * chunkvault_geometry::MIN_CHUNK_SIZE);
        let run: Vec<u64> = (0..10).collect();
        let windows = split_into_windows(&geometry, &run, 3 * chunkvault_geometry::MIN_CHUNK_SIZE);
        assert!(windows.iter().all(|w| w.len() <= 3));
        assert_eq!(windows.iter().map(Vec::len).sum::<usize>(), 10);
    }

    fn test_painter(geometry: Geometry, config: PainterConfig) -> Painter {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0u8; geometry.total_size() as usize];
        let reference_path = dir.path().join("ref.mrkl");
        let reference = Arc::new(MerkleTree::build_from_data(&reference_path, &data).unwrap());
        let local_path = dir.path().join("local.mrkl");
        let local = Arc::new(MerkleTree::create_empty(&local_path, geometry.total_size()).unwrap());
        let content_path = dir.path().join("content.bin");
        std::fs::write(&content_path, &data).unwrap();
        let shadow = Arc::new(ShadowTree::new(Arc::clone(&reference), local, content_path, geometry));
        let content_url = Url::parse("http://localhost/data.bin").unwrap();
        Painter::new(Client::new(), content_url, reference, shadow, geometry, config)
    }

    /// Drives `update_autobuffer` through enough contiguous, sequential
    /// calls to cross `autobuffer_threshold`, then asserts the returned
    /// high bound extends past the requested range by the configured
    /// readahead (`spec.md` §8 scenario 2).
    #[test]
    fn autobuffer_extends_range_after_threshold_sequential_reads() {
        let geometry = Geometry::new(20 * chunkvault_geometry::MIN_CHUNK_SIZE);
        let config = PainterConfig {
            min_download_size: geometry.chunk_size(),
            max_download_size: geometry.chunk_size(),
            autobuffer_threshold: 3,
            readahead_requests: 5,
            verify_retries: 3,
        };
        let painter = test_painter(geometry, config);

        // First access establishes the starting point; no history yet.
        assert_eq!(painter.update_autobuffer(0, 0), 0);
        // Two more contiguous, sequential single-chunk accesses still sit
        // below the threshold.
        assert_eq!(painter.update_autobuffer(1, 1), 1);
        assert_eq!(painter.update_autobuffer(2, 2), 2);

        // The fourth contiguous access crosses autobuffer_threshold (3) and
        // should extend past c_hi by readahead_requests * max_download_size
        // / chunk_size == 5 chunks.
        let extended = painter.update_autobuffer(3, 3);
        assert_eq!(extended, 8);
    }

    #[test]
    fn autobuffer_resets_on_non_contiguous_access() {
        let geometry = Geometry::new(20 * chunkvault_geometry::MIN_CHUNK_SIZE);
        let config = PainterConfig {
            min_download_size: geometry.chunk_size(),
            max_download_size: geometry.chunk_size(),
            autobuffer_threshold: 3,
            readahead_requests: 5,
            verify_retries: 3,
        };
        let painter = test_painter(geometry, config);

        assert_eq!(painter.update_autobuffer(0, 0), 0);
        assert_eq!(painter.update_autobuffer(1, 1), 1);
        // A jump to a non-adjacent chunk resets the sequential count, so
        // even a fourth call right afterward stays below threshold.
        assert_eq!(painter.update_autobuffer(10, 10), 10);
        assert_eq!(painter.update_autobuffer(11, 11), 11);
        assert_eq!(painter.update_autobuffer(12, 12), 12);
    }
}
