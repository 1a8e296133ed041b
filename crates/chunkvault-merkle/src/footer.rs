//! Fixed-layout trailer of a persisted Merkle file (`spec.md` §3, §4.3).
//!
//! All multi-byte scalars are big-endian. The footer's own length sits at
//! the last byte of the file so a reader can probe it with a single-byte
//! read followed by a small tail read, without knowing the layout version
//! in advance.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Hash, Result, HASH_SIZE};

/// Magic bytes identifying a chunkvault Merkle file.
pub const MAGIC: [u8; 4] = *b"CVMT";

/// Current on-disk format version.
pub const VERSION: u8 = 1;

/// Total encoded footer size in bytes.
pub const FOOTER_LEN: usize = 4 + 1 + 8 + 8 + 4 + HASH_SIZE + 1;

/// The fixed-size trailer of a persisted Merkle file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    /// Chunk size the tree was built with.
    pub chunk_size: u64,
    /// Total content size the tree covers.
    pub total_size: u64,
    /// Size in bytes of the embedded validity bitset.
    pub bitset_size: u32,
    /// Digest over the contiguous `leaves ∥ internals` region of the file.
    pub digest_of_tree: Hash,
}

impl Footer {
    /// Encode into exactly [`FOOTER_LEN`] bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        let mut off = 0;

        buf[off..off + 4].copy_from_slice(&MAGIC);
        off += 4;
        buf[off] = VERSION;
        off += 1;
        BigEndian::write_u64(&mut buf[off..off + 8], self.chunk_size);
        off += 8;
        BigEndian::write_u64(&mut buf[off..off + 8], self.total_size);
        off += 8;
        BigEndian::write_u32(&mut buf[off..off + 4], self.bitset_size);
        off += 4;
        buf[off..off + HASH_SIZE].copy_from_slice(&self.digest_of_tree);
        off += HASH_SIZE;
        buf[off] = FOOTER_LEN as u8;
        off += 1;
        debug_assert_eq!(off, FOOTER_LEN);

        buf
    }

    /// Decode from exactly [`FOOTER_LEN`] bytes.
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] on magic/version mismatch or a
    /// self-reported footer length that disagrees with [`FOOTER_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_LEN {
            return Err(Error::Corrupt(format!(
                "expected {FOOTER_LEN} footer bytes, got {}",
                buf.len()
            )));
        }
        let mut off = 0;

        let magic = &buf[off..off + 4];
        if magic != MAGIC {
            return Err(Error::Corrupt(format!("bad magic {magic:?}")));
        }
        off += 4;

        let version = buf[off];
        if version != VERSION {
            return Err(Error::Corrupt(format!("unsupported version {version}")));
        }
        off += 1;

        let chunk_size = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let total_size = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let bitset_size = BigEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let mut digest_of_tree = [0u8; HASH_SIZE];
        digest_of_tree.copy_from_slice(&buf[off..off + HASH_SIZE]);
        off += HASH_SIZE;

        let footer_length = buf[off];
        off += 1;
        if usize::from(footer_length) != FOOTER_LEN {
            return Err(Error::Corrupt(format!(
                "footer_length byte {footer_length} disagrees with FOOTER_LEN {FOOTER_LEN}"
            )));
        }
        debug_assert_eq!(off, FOOTER_LEN);

        Ok(Self {
            chunk_size,
            total_size,
            bitset_size,
            digest_of_tree,
        })
    }

    /// Read a footer from the last [`FOOTER_LEN`] bytes of `data`.
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] if `data` is shorter than [`FOOTER_LEN`] or
    /// the trailing bytes do not decode.
    pub fn read_tail(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_LEN {
            return Err(Error::Corrupt(format!(
                "file too short for footer: {} bytes",
                data.len()
            )));
        }
        Self::decode(&data[data.len() - FOOTER_LEN..])
    }
}
