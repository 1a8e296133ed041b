// crates/chunkvault-merkle/src/lib.rs

//! Memory-mapped Merkle tree with lazy parent recomputation and a
//! self-describing footer.
//!
//! A tree lives in a single file: two contiguous arrays of SHA-256 hashes
//! (internal nodes, then leaves), a validity bitset tracking which of those
//! hashes are currently trustworthy, and a fixed-size [`footer::Footer`]
//! trailer that lets a reader verify the whole tree region with one digest
//! check before trusting anything else in the file.

#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

mod error;
mod footer;
mod hash;
mod layout;
mod tree;

pub use error::{Error, Hash, Result, HASH_SIZE};
pub use footer::{Footer, FOOTER_LEN, MAGIC, VERSION};
pub use hash::{empty_leaf_hash, leaf_hash, parent_hash, region_digest};
pub use layout::Layout;
pub use tree::MerkleTree;
