//! Error taxonomy for the Merkle tree and footer codec (`spec.md` §7).

use thiserror::Error;

/// Fixed digest width in bytes (SHA-256).
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; HASH_SIZE];

/// Errors raised by [`crate::MerkleTree`] and [`crate::footer`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A requested node, chunk size, or byte buffer did not match what the
    /// tree's shape requires.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The persisted file failed a structural or digest check on load.
    #[error("corrupt merkle file: {0}")]
    Corrupt(String),

    /// A node's hash was requested but is not currently valid and cannot be
    /// derived (a leaf awaiting submission, or an internal node whose
    /// children are not both valid).
    #[error("node {0} has no valid hash")]
    NotValid(u64),

    /// Local filesystem or memory-map I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
