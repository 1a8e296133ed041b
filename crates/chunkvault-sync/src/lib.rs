// crates/chunkvault-sync/src/lib.rs

//! Reference-tree acquisition: steps 1–3 of `spec.md` §4.4 — fetch and
//! validate the authoritative Merkle tree for a dataset's origin URL,
//! preferring a cheap footer probe over a full redownload whenever the
//! locally-cached reference is already current.
//!
//! Initializing and reconciling a *local* progress-tracking tree (steps 4–5
//! of the same protocol) is the caller's concern — typically
//! `chunkvault-transport`'s channel setup — since that tree's lifecycle is
//! tied to a specific channel's shadow state, not to reference acquisition.

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

use std::path::Path;

use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use chunkvault_merkle::{Footer, MerkleTree, FOOTER_LEN};

mod error;
pub use error::{Error, Result};

/// Retry/behavior knobs for reference-tree acquisition.
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    /// Number of attempts for a full reference download before giving up.
    pub retries: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { retries: 3 }
    }
}

/// Runs the reference-tree acquisition protocol and returns the resulting,
/// read-only [`MerkleTree`] cached at `reference_path`.
pub struct ReferenceSync;

impl ReferenceSync {
    /// Derive the `.mrkl` companion URL for a content URL.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `data_url` cannot be parsed.
    pub fn merkle_url(data_url: &str) -> Result<Url> {
        let mut url = Url::parse(data_url).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let path = url.path().to_owned();
        url.set_path(&format!("{path}.mrkl"));
        Ok(url)
    }

    /// Acquire the reference tree for `data_url`, reusing `reference_path`
    /// if its footer still matches the remote, otherwise redownloading and
    /// validating it (retrying up to `config.retries` times).
    ///
    /// # Errors
    /// Returns [`Error::ReferenceUnavailable`] if the origin cannot be
    /// reached or every retry attempt fails validation.
    pub async fn open(
        client: &Client,
        data_url: &str,
        reference_path: &Path,
        config: &SyncConfig,
    ) -> Result<MerkleTree> {
        let merkle_url = Self::merkle_url(data_url)?;

        if reference_path.exists() {
            match Self::remote_footer_matches(client, &merkle_url, reference_path).await {
                Ok(true) => {
                    info!(url = %merkle_url, "local reference footer matches remote, skipping redownload");
                    return Ok(MerkleTree::load(reference_path)?);
                }
                Ok(false) => debug!(url = %merkle_url, "local reference stale, redownloading"),
                Err(e) => {
                    warn!(url = %merkle_url, error = %e, "footer probe failed, falling back to full redownload");
                }
            }
        }

        Self::download_and_validate(client, &merkle_url, reference_path, config).await?;
        Ok(MerkleTree::load(reference_path)?)
    }

    /// Explicit re-run of the protocol (e.g. on a manual refresh request).
    ///
    /// # Errors
    /// Same as [`Self::open`].
    pub async fn refresh(
        client: &Client,
        data_url: &str,
        reference_path: &Path,
        config: &SyncConfig,
    ) -> Result<MerkleTree> {
        Self::open(client, data_url, reference_path, config).await
    }

    async fn remote_footer_matches(
        client: &Client,
        merkle_url: &Url,
        reference_path: &Path,
    ) -> Result<bool> {
        let local_bytes = tokio::fs::read(reference_path).await?;
        let local_footer = Footer::read_tail(&local_bytes)?;

        let remote_tail = fetch_tail(client, merkle_url, FOOTER_LEN).await?;
        let remote_footer = Footer::decode(&remote_tail)?;
        Ok(remote_footer == local_footer)
    }

    async fn download_and_validate(
        client: &Client,
        merkle_url: &Url,
        reference_path: &Path,
        config: &SyncConfig,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=config.retries.max(1) {
            match Self::try_download_once(client, merkle_url, reference_path).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, url = %merkle_url, error = %e, "reference download/validation attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::ReferenceUnavailable(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into()),
        ))
    }

    async fn try_download_once(client: &Client, merkle_url: &Url, reference_path: &Path) -> Result<()> {
        let response = client
            .get(merkle_url.clone())
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;

        let tmp_path = reference_path.with_extension("mrkl.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        // Validate before publishing: `load` checks the footer and the
        // tree-region digest, so a half-written or tampered download never
        // replaces a good local reference.
        MerkleTree::load(&tmp_path)?;
        tokio::fs::rename(&tmp_path, reference_path).await?;
        Ok(())
    }
}

/// Fetch the last `len` bytes of the resource at `url`, preferring a suffix
/// byte-range request but tolerating an origin that ignores it and returns
/// the full body instead.
async fn fetch_tail(client: &Client, url: &Url, len: usize) -> Result<Vec<u8>> {
    let response = client
        .get(url.clone())
        .header(reqwest::header::RANGE, format!("bytes=-{len}"))
        .send()
        .await?
        .error_for_status()?;
    let bytes = response.bytes().await?;

    if bytes.len() == len {
        return Ok(bytes.to_vec());
    }
    if bytes.len() > len {
        return Ok(bytes[bytes.len() - len..].to_vec());
    }
    Err(Error::ReferenceUnavailable(format!(
        "tail fetch returned {} bytes, expected {len}",
        bytes.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_url_appends_suffix() {
        let url = ReferenceSync::merkle_url("https://example.com/data/set.bin").unwrap();
        assert_eq!(url.as_str(), "https://example.com/data/set.bin.mrkl");
    }

    #[test]
    fn default_retries_match_spec() {
        assert_eq!(SyncConfig::default().retries, 3);
    }

    #[tokio::test]
    async fn open_downloads_and_caches_reference() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = tempfile::tempdir().unwrap();
        let content = vec![5u8; chunkvault_geometry::MIN_CHUNK_SIZE as usize];
        let source_tree_path = dir.path().join("source.mrkl");
        chunkvault_merkle::MerkleTree::build_from_data(&source_tree_path, &content).unwrap();
        let tree_bytes = std::fs::read(&source_tree_path).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.bin.mrkl"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tree_bytes.clone()))
            .mount(&server)
            .await;

        let reference_path = dir.path().join("reference.mrkl");
        let client = Client::new();
        let data_url = format!("{}/data.bin", server.uri());

        let tree = ReferenceSync::open(&client, &data_url, &reference_path, &SyncConfig::default())
            .await
            .unwrap();
        assert!(tree.root_hash().is_ok());
        assert!(reference_path.exists());
    }

    #[tokio::test]
    async fn open_skips_redownload_when_footer_matches() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = tempfile::tempdir().unwrap();
        let content = vec![3u8; chunkvault_geometry::MIN_CHUNK_SIZE as usize];
        let reference_path = dir.path().join("reference.mrkl");
        chunkvault_merkle::MerkleTree::build_from_data(&reference_path, &content).unwrap();
        let tree_bytes = std::fs::read(&reference_path).unwrap();
        let footer_tail = tree_bytes[tree_bytes.len() - FOOTER_LEN..].to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.bin.mrkl"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(footer_tail))
            .mount(&server)
            .await;

        let client = Client::new();
        let data_url = format!("{}/data.bin", server.uri());
        let tree = ReferenceSync::open(&client, &data_url, &reference_path, &SyncConfig::default())
            .await
            .unwrap();
        assert!(tree.root_hash().is_ok());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
