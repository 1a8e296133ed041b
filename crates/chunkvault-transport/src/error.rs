//! Error taxonomy for the transport crate (`spec.md` §7), composed from the
//! lower crates' error types.

use thiserror::Error;

use chunkvault_merkle::Hash;

/// Errors raised by the painter, verified channel, and shadow tree.
#[derive(Debug, Error)]
pub enum Error {
    /// A requested index, position, or length fell outside what the
    /// reference tree's shape allows.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A persisted Merkle file failed its structural or digest check.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Local filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure, unexpected status, or short body.
    #[error("transport error: {0}")]
    Transport(String),

    /// A chunk's computed hash never matched the reference after exhausting
    /// `verify_retries`.
    #[error("chunk {chunk_index} failed verification")]
    ChunkVerificationFailed {
        /// Index of the offending chunk.
        chunk_index: u64,
        /// Hash the reference tree expected.
        expected: Hash,
        /// Hash actually computed from the downloaded bytes.
        actual: Hash,
    },

    /// The reference tree could not be acquired or validated from the origin.
    #[error("reference unavailable: {0}")]
    ReferenceUnavailable(String),

    /// The reference tree has no valid hash for a requested leaf.
    #[error("reference missing leaf {0}")]
    ReferenceMissing(u64),

    /// The operation was aborted by a channel `close()`.
    #[error("operation cancelled")]
    Cancelled,

    /// A write/lock/truncate operation was attempted on a read-only channel.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A chunk was read before it was shadow-verified.
    #[error("chunk {0} not verified")]
    NotVerified(u64),
}

impl From<chunkvault_merkle::Error> for Error {
    fn from(e: chunkvault_merkle::Error) -> Self {
        match e {
            chunkvault_merkle::Error::InvalidArgument(m) => Self::InvalidArgument(m),
            chunkvault_merkle::Error::Corrupt(m) => Self::Corrupt(m),
            chunkvault_merkle::Error::NotValid(i) => Self::ReferenceMissing(i),
            chunkvault_merkle::Error::Io(e) => Self::Io(e),
        }
    }
}

impl From<chunkvault_sync::Error> for Error {
    fn from(e: chunkvault_sync::Error) -> Self {
        match e {
            chunkvault_sync::Error::ReferenceUnavailable(m) => Self::ReferenceUnavailable(m),
            chunkvault_sync::Error::InvalidArgument(m) => Self::InvalidArgument(m),
            chunkvault_sync::Error::Merkle(e) => e.into(),
            chunkvault_sync::Error::Io(e) => Self::Io(e),
            chunkvault_sync::Error::Transport(e) => Self::Transport(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<chunkvault_geometry::Error> for Error {
    fn from(e: chunkvault_geometry::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

/// A `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
