//! Binary delta engine in the bsdiff family, with block-level
//! checksums.
//!
//! [`generate`] turns a reference and a target byte sequence into a
//! compact patch stream; [`apply`] streams that patch over the
//! reference to rebuild the target. The stream is cut into blocks,
//! each sealed by a flush record carrying CRC-32 checksums of the
//! reference bytes consumed and the target bytes produced. The applier
//! keeps every verified block in an on-disk cache, splices verified
//! blocks back over the reference the way the generator assumed, and
//! can fall back to cached blocks from an earlier run when the
//! reference itself fails verification.
//!
//! The patch stream is not compressed; pipe it through a compressor of
//! your choice if size matters.
//!
//! Both inputs are limited to 2^31 - 1 bytes.

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

mod diff;
mod patch;

pub use diff::{generate, DiffError};
pub use patch::{apply, PatchError};

/// Magic at the start of every patch stream. The trailing digit is the
/// format version.
pub const BLKDELTA_MAGIC: &[u8; 8] = b"BLKDLTA1";

/// Sentinel value of [`EntryHeader`]'s `seek` field marking a block
/// boundary.
///
/// This is `i32::MAX`, whose big-endian serialisation `7f ff ff ff`
/// cannot be confused with the all-zero end sentinel.
pub const FLUSH: u32 = 0x7FFF_FFFF;

/// Fixed-size patch file header: magic plus the size of the
/// reconstructed target, big-endian.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub struct PatchHeader {
    pub magic: [u8; 8],
    pub new_file_size: U64,
}

/// Fixed-size record header: three big-endian fields, no padding.
///
/// `seek` carries a signed value as its two's-complement bit pattern,
/// see [`seek_to_wire`]. A flush record reuses `diff` and `extra` to
/// carry the reference and target CRC-32 of the block it seals; no
/// payload follows it.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub struct EntryHeader {
    pub diff: U32,
    pub extra: U32,
    pub seek: U32,
}

impl EntryHeader {
    /// True for the all-zero record that terminates the stream.
    pub fn is_end(&self) -> bool {
        self.diff.get() == 0 && self.extra.get() == 0 && self.seek.get() == 0
    }

    /// True for a block-boundary record carrying checksums.
    pub fn is_flush(&self) -> bool {
        self.seek.get() == FLUSH
    }
}

/// Progress updates passed to the callback of [`generate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// A suffix sort over the reference is running.
    Sorting,
    /// How many bytes of the target have been scanned so far.
    Working(u64),
}

/// Encode a signed reference seek as the unsigned two's-complement bit
/// pattern carried on the wire.
pub fn seek_to_wire(seek: i64) -> u32 {
    if seek < 0 {
        (!((-seek) as u32)).wrapping_add(1)
    } else {
        seek as u32
    }
}

/// Decode the wire bit pattern back into a signed seek. The sign is
/// recovered by inspecting the top bit rather than by casting.
pub fn seek_from_wire(raw: u32) -> i64 {
    if raw & 0x8000_0000 != 0 {
        -(((!raw).wrapping_add(1)) as i64)
    } else {
        raw as i64
    }
}
