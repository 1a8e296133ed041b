// crates/chunkvault-transport/src/lib.rs

//! On-demand, integrity-verified remote-file transport.
//!
//! Composes [`chunkvault_merkle`] and [`chunkvault_sync`] into a read-only,
//! random-access channel (`channel`) backed by a chunk painter
//! (`painter`) that schedules and deduplicates ranged HTTP fetches, and a
//! shadow tree (`shadow`) that tracks which chunks are both verified and
//! durably written.

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

mod channel;
mod error;
mod inflight;
mod painter;
mod shadow;

pub use channel::{CachePaths, VerifiedChannel};
pub use error::{Error, Result};
pub use painter::{Painter, PainterConfig, Progress};
pub use shadow::ShadowTree;
