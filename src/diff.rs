use std::cmp::Ordering;
use std::io::Write;

use byteorder::WriteBytesExt;
#[cfg(not(feature = "c"))]
use divsufsort as cdivsufsort;
use log::debug;
use thiserror::Error;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::IntoBytes;

use crate::{seek_to_wire, EntryHeader, PatchHeader, State, BLKDELTA_MAGIC, FLUSH};

type Str = Box<str>;
type Result<T> = std::result::Result<T, DiffError>;

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("reference is larger than {} bytes", i32::MAX)]
    OldTooLarge,
    #[error("target is larger than {} bytes", i32::MAX)]
    NewTooLarge,
    #[error("io error while writing patch: {0}")]
    PatchIo(#[from] std::io::Error),
    #[error("patch generation failed: {0}")]
    Algorithm(Str),
}

const FUZZ: isize = 8;

fn write_header(patch: &mut impl Write, len: u64) -> Result<()> {
    patch
        .write_all(
            PatchHeader {
                magic: *BLKDELTA_MAGIC,
                new_file_size: U64::new(len),
            }
            .as_bytes(),
        )
        .map_err(|e| e.into())
}

fn write_ending(patch: &mut impl Write) -> Result<()> {
    patch
        .write_all(
            EntryHeader {
                diff: Default::default(),
                extra: Default::default(),
                seek: Default::default(),
            }
            .as_bytes(),
        )
        .map_err(|e| e.into())
}

fn write_flush(patch: &mut impl Write, oldcrc: u32, newcrc: u32) -> Result<()> {
    patch
        .write_all(
            EntryHeader {
                diff: U32::new(oldcrc),
                extra: U32::new(newcrc),
                seek: U32::new(FLUSH),
            }
            .as_bytes(),
        )
        .map_err(|e| e.into())
}

fn suffix_sort(old: &[u8]) -> Vec<i32> {
    let mut sorted = cdivsufsort::sort(old).into_parts().1;
    // One extra slot so the binary search range is [0, len] inclusive.
    sorted.push(0);
    sorted
}

/// Validate a cut's computed lengths and seek and pack them into a
/// record header. The flush sentinel lives in the seek field's value
/// space, so a colliding seek must abort rather than corrupt the
/// stream.
fn record_header(diff: isize, extra: isize, seek: isize) -> Result<EntryHeader> {
    if seek as i64 == i64::from(FLUSH) {
        return Err(DiffError::Algorithm(
            "record seek collides with the flush sentinel".into(),
        ));
    }
    let diff = u32::try_from(diff)
        .map_err(|_| DiffError::Algorithm("diff length does not fit the wire format".into()))?;
    let extra = u32::try_from(extra)
        .map_err(|_| DiffError::Algorithm("extra length does not fit the wire format".into()))?;
    Ok(EntryHeader {
        diff: U32::new(diff),
        extra: U32::new(extra),
        seek: U32::new(seek_to_wire(seek as i64)),
    })
}

/// Generate a patch that rebuilds `new` from `old`.
///
/// The target is processed in blocks of up to `block_size` bytes; pass
/// [`None`] (or 0) to cover the whole target in a single block. Each
/// block ends with a flush record carrying CRC-32 checksums of the
/// reference bytes consumed and the target bytes produced, and the
/// finished block then stands in for the same region of the reference
/// while the blocks after it are diffed, exactly as the applier will
/// replay it. A smaller `block_size` re-runs the suffix sort more
/// often but gives the applier finer units of verification and
/// recovery.
///
/// `progress` is a function that will be called periodically with
/// progress updates. Both inputs are limited to 2^31 - 1 bytes.
pub fn generate(
    old: &[u8],
    new: &[u8],
    patch: &mut impl Write,
    block_size: impl Into<Option<usize>>,
    mut progress: impl FnMut(State),
) -> Result<()> {
    if old.len() > i32::MAX as usize {
        return Err(DiffError::OldTooLarge);
    }
    if new.len() > i32::MAX as usize {
        return Err(DiffError::NewTooLarge);
    }
    write_header(patch, new.len() as u64)?;
    if new.is_empty() {
        write_ending(patch)?;
        patch.flush()?;
        return Ok(());
    }
    let block_size = match block_size.into() {
        None | Some(0) => new.len(),
        Some(n) => n,
    };

    // The block overlays need the reference to cover the whole target,
    // so a short reference is padded with zeroes up front. The applier
    // mirrors this by reading absent reference bytes as zero.
    let mut old = old.to_vec();
    if old.len() < new.len() {
        old.resize(new.len(), 0);
    }

    let mut scan: isize = 0;
    let mut len: isize = 0;
    let mut pos: isize = 0;
    let mut lastoffset: isize = 0;
    let mut lastscan: isize = 0;
    let mut lastpos: isize = 0;
    let mut oldcrc = crc32fast::Hasher::new();
    let mut newcrc = crc32fast::Hasher::new();

    while (lastscan as usize) < new.len() {
        let block_start = lastscan;
        let scansize = new.len().min(lastscan as usize + block_size) as isize;

        progress(State::Sorting);
        debug!("suffix sorting {} reference bytes", old.len());
        let sorted = suffix_sort(&old);
        len = 0;

        while scan < scansize {
            let mut num_less_than_eight = 0;
            let mut oldscore: isize = 0;
            scan += len;
            let mut scsc = scan;
            // If we come across a large block of data that only differs
            // by less than 8 bytes, this loop will take a long time to
            // go past that block of data. We need to track the number of
            // times we're stuck in the block and break out of it.
            while scan < scansize {
                if scan % 10_000 == 0 {
                    progress(State::Working(scan as u64));
                }
                let prev_len = len;
                let prev_oldscore = oldscore;
                let prev_pos = pos;

                len = search(
                    &sorted,
                    &old,
                    &new[scan as usize..scansize as usize],
                    0,
                    old.len(),
                    &mut pos,
                );

                while scsc < scan + len {
                    if (scsc + lastoffset < old.len() as isize)
                        && (old[(scsc + lastoffset) as usize] == new[scsc as usize])
                    {
                        oldscore += 1;
                    }
                    scsc += 1;
                }

                if ((len == oldscore) && (len != 0)) || (len > oldscore + 8) {
                    break;
                }

                if (scan + lastoffset < old.len() as isize)
                    && (old[(scan + lastoffset) as usize] == new[scan as usize])
                {
                    oldscore -= 1;
                }

                if prev_len - FUZZ <= len
                    && len <= prev_len
                    && prev_oldscore - FUZZ <= oldscore
                    && oldscore <= prev_oldscore
                    && prev_pos <= pos
                    && pos <= prev_pos + FUZZ
                    && oldscore <= len
                    && len <= oldscore + FUZZ
                {
                    num_less_than_eight += 1;
                } else {
                    num_less_than_eight = 0;
                }

                if num_less_than_eight > 100 {
                    break;
                }

                scan += 1;
            }

            if (len != oldscore) || (scan == scansize) {
                let mut s = 0;
                let mut s_f = 0;
                let mut lenf = 0;
                let mut i = 0;
                while (lastscan + i < scan) && (lastpos + i < old.len() as isize) {
                    if old[(lastpos + i) as usize] == new[(lastscan + i) as usize] {
                        s += 1;
                    }
                    i += 1;
                    if s * 2 - i > s_f * 2 - lenf {
                        s_f = s;
                        lenf = i;
                    }
                }
                let mut lenb = 0;
                if scan < scansize {
                    let mut s = 0;
                    let mut s_b = 0;
                    i = 1;
                    while (scan >= lastscan + i) && (pos >= i) {
                        if old[(pos - i) as usize] == new[(scan - i) as usize] {
                            s += 1;
                        }
                        if s * 2 - i > s_b * 2 - lenb {
                            s_b = s;
                            lenb = i;
                        }
                        i += 1;
                    }
                }
                if lastscan + lenf > scan - lenb {
                    let overlap = (lastscan + lenf) - (scan - lenb);
                    let mut s = 0;
                    let mut s_s = 0;
                    let mut lens = 0;
                    for i in 0..overlap {
                        if new[(lastscan + lenf - overlap + i) as usize]
                            == old[(lastpos + lenf - overlap + i) as usize]
                        {
                            s += 1;
                        }
                        if new[(scan - lenb + i) as usize] == old[(pos - lenb + i) as usize] {
                            s -= 1;
                        }
                        if s > s_s {
                            s_s = s;
                            lens = i + 1;
                        }
                    }
                    lenf += lens - overlap;
                    lenb -= lens;
                }
                let extra = (scan - lenb) - (lastscan + lenf);
                if lenf < 0 || extra < 0 {
                    return Err(DiffError::Algorithm(
                        "invalid state while creating patch".into(),
                    ));
                }
                let seek = (pos - lenb) - (lastpos + lenf);
                let header = record_header(lenf, extra, seek)?;
                // A cut can be a complete no-op (nothing to emit and
                // nowhere to seek); writing one would collide with the
                // end sentinel.
                if lenf != 0 || extra != 0 || seek != 0 {
                    patch.write_all(header.as_bytes())?;
                    for i in 0..lenf {
                        patch.write_u8(
                            new[(lastscan + i) as usize].wrapping_sub(old[(lastpos + i) as usize]),
                        )?;
                    }
                    if extra != 0 {
                        patch.write_all(&new[(lastscan + lenf) as usize..(scan - lenb) as usize])?;
                    }
                }

                oldcrc.update(&old[lastpos as usize..(lastpos + lenf) as usize]);
                newcrc.update(&new[lastscan as usize..(scan - lenb) as usize]);

                lastscan = scan - lenb;
                lastpos = pos - lenb;
                lastoffset = pos - scan;
            }
        }

        // Block complete: seal it with the two checksums, then let the
        // covered target bytes stand in for the same region of the
        // reference, the way the applier will see it after splicing.
        let old_digest = oldcrc.clone().finalize();
        let new_digest = newcrc.clone().finalize();
        write_flush(patch, old_digest, new_digest)?;
        debug!(
            "flushed block {}..{} (oldcrc {:08x}, newcrc {:08x})",
            block_start, scansize, old_digest, new_digest
        );
        oldcrc = crc32fast::Hasher::new();
        newcrc = crc32fast::Hasher::new();

        if (lastscan as usize) < new.len() {
            old[block_start as usize..scansize as usize]
                .copy_from_slice(&new[block_start as usize..scansize as usize]);
        }
    }
    write_ending(patch)?;
    patch.flush()?;
    Ok(())
}

fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .enumerate()
        .take_while(|(_, (old, new))| old == new)
        .last()
        .map_or(0, |(i, _)| i + 1)
}

/// Compares lexicographically the common part of these slices, i.e. takes the smallest length and
/// compares within that.
fn min_memcmp(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().min(b.len());
    a[..len].cmp(&b[..len])
}

/// This is a binary search of the string `new` in the `old` string using the suffix array
/// `sorted`. `st` and `en` is the start and end of the search range (inclusive).
/// Returns the length of the longest prefix found and stores the position of the
/// string found in `*pos`. Ties between the two final candidates go to the
/// higher index.
fn search(sorted: &[i32], old: &[u8], new: &[u8], st: usize, en: usize, pos: &mut isize) -> isize {
    if en - st < 2 {
        let x = match_len(&old[(sorted[st] as usize)..], new) as isize;
        let y = match_len(&old[(sorted[en] as usize)..], new) as isize;

        if x > y {
            *pos = sorted[st] as isize;
            x
        } else {
            *pos = sorted[en] as isize;
            y
        }
    } else {
        let x = st + (en - st) / 2;
        if min_memcmp(&old[(sorted[x] as usize)..], new) != Ordering::Greater {
            search(sorted, old, new, x, en, pos)
        } else {
            search(sorted, old, new, st, x, pos)
        }
    }
}
