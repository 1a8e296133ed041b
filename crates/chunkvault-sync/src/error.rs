//! Error taxonomy for reference-tree acquisition (`spec.md` §7).

use thiserror::Error;

/// Errors raised while fetching and validating a remote reference tree.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote origin could not be reached, or every retry attempt failed.
    #[error("reference unavailable after retries: {0}")]
    ReferenceUnavailable(String),

    /// A URL passed to this crate was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying Merkle tree rejected the downloaded reference file.
    #[error(transparent)]
    Merkle(#[from] chunkvault_merkle::Error),

    /// Local filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
