//! Wire-level checks: stream structure, checksum coherence, and how
//! the applier reports damaged streams.

use std::io::Cursor;

use blkdelta::{apply, generate, EntryHeader, PatchError, PatchHeader, BLKDELTA_MAGIC};
use zerocopy::FromBytes;

enum Record<'a> {
    Normal {
        diff: &'a [u8],
        extra: &'a [u8],
        seek: i64,
    },
    Flush {
        oldcrc: u32,
        newcrc: u32,
    },
}

/// Parse a whole patch stream, asserting it is END-terminated with no
/// trailing bytes.
fn parse(patch: &[u8]) -> (u64, Vec<Record<'_>>) {
    let (header, mut rest) = PatchHeader::read_from_prefix(patch).expect("patch header");
    assert_eq!(&header.magic, BLKDELTA_MAGIC);
    let mut records = Vec::new();
    loop {
        let (entry, tail) = EntryHeader::read_from_prefix(rest).expect("record header");
        rest = tail;
        if entry.is_end() {
            break;
        }
        if entry.is_flush() {
            records.push(Record::Flush {
                oldcrc: entry.diff.get(),
                newcrc: entry.extra.get(),
            });
            continue;
        }
        let diff_len = entry.diff.get() as usize;
        let extra_len = entry.extra.get() as usize;
        let (diff, tail) = rest.split_at(diff_len);
        let (extra, tail) = tail.split_at(extra_len);
        rest = tail;
        records.push(Record::Normal {
            diff,
            extra,
            seek: blkdelta::seek_from_wire(entry.seek.get()),
        });
    }
    assert!(rest.is_empty(), "bytes after the end sentinel");
    (header.new_file_size.get(), records)
}

fn make_patch(old: &[u8], new: &[u8], block_size: Option<usize>) -> Vec<u8> {
    let mut patch = Vec::new();
    generate(old, new, &mut patch, block_size, |_| {}).expect("generate");
    patch
}

fn lcg_bytes(len: usize, mut seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((seed >> 24) as u8);
    }
    out
}

/// Re-decode a patch with bookkeeping completely independent of the
/// library applier, checking every invariant the stream promises: the
/// per-flush checksums cover exactly the reference bytes consumed and
/// the target bytes produced since the previous flush, flush
/// boundaries tile the target at block-size multiples, and the record
/// payloads reproduce the target.
fn replay_and_check(old: &[u8], new: &[u8], block_size: usize) {
    let patch = make_patch(old, new, Some(block_size));
    let (declared, records) = parse(&patch);
    assert_eq!(declared, new.len() as u64);

    let mut reference = old.to_vec();
    let mut out: Vec<u8> = Vec::new();
    let mut cursor: i64 = 0;
    let mut block_start = 0usize;
    let mut oldcrc = crc32fast::Hasher::new();

    for record in &records {
        match record {
            Record::Normal { diff, extra, seek } => {
                assert!(cursor >= 0, "reference cursor went negative");
                let ref_bytes: Vec<u8> = (0..diff.len())
                    .map(|i| {
                        let at = cursor as usize + i;
                        reference.get(at).copied().unwrap_or(0)
                    })
                    .collect();
                oldcrc.update(&ref_bytes);
                out.extend(
                    ref_bytes
                        .iter()
                        .zip(diff.iter())
                        .map(|(r, d)| r.wrapping_add(*d)),
                );
                out.extend_from_slice(extra);
                cursor += diff.len() as i64 + seek;
            }
            Record::Flush { oldcrc: want_old, newcrc: want_new } => {
                assert_eq!(
                    oldcrc.clone().finalize(),
                    *want_old,
                    "flush oldcrc does not match the reference bytes consumed"
                );
                assert_eq!(
                    crc32fast::hash(&out[block_start..]),
                    *want_new,
                    "flush newcrc does not match the block produced"
                );
                assert!(
                    out.len() % block_size == 0 || out.len() == new.len(),
                    "flush at {} does not tile the target at {}-byte blocks",
                    out.len(),
                    block_size
                );
                if reference.len() < out.len() {
                    reference.resize(out.len(), 0);
                }
                reference[block_start..out.len()].copy_from_slice(&out[block_start..]);
                block_start = out.len();
                oldcrc = crc32fast::Hasher::new();
            }
        }
    }
    assert_eq!(out, new, "replayed output does not match the target");
    assert_eq!(block_start, out.len(), "target bytes after the final flush");
}

#[test]
fn stream_checksums_and_tiling() {
    let old = lcg_bytes(20_000, 11);
    let mut new = old.clone();
    new[3_000] ^= 0x40;
    new.splice(9_000..9_000, lcg_bytes(37, 12));
    new.truncate(18_500);
    for block_size in [1_000, 4_096, 18_500, 40_000] {
        replay_and_check(&old, &new, block_size);
    }
}

#[test]
fn record_lengths_cover_the_target() {
    let old = lcg_bytes(10_000, 31);
    let new = lcg_bytes(10_000, 32);
    let patch = make_patch(&old, &new, Some(2_048));
    let (_, records) = parse(&patch);
    let covered: usize = records
        .iter()
        .map(|r| match r {
            Record::Normal { diff, extra, .. } => diff.len() + extra.len(),
            Record::Flush { .. } => 0,
        })
        .sum();
    assert_eq!(covered, new.len());
}

#[test]
fn empty_target_stream_is_header_and_end() {
    let patch = make_patch(b"reference", b"", None);
    let (declared, records) = parse(&patch);
    assert_eq!(declared, 0);
    assert!(records.is_empty());
}

fn apply_to(old: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    let cache = tempfile::tempdir().expect("cache dir");
    let mut reference = Cursor::new(old.to_vec());
    let mut out = Vec::new();
    apply(&mut reference, &mut out, &mut Cursor::new(patch), cache.path())?;
    Ok(out)
}

#[test]
fn rejects_bad_magic() {
    let old = b"some old data";
    let mut patch = make_patch(old, b"some new data", None);
    patch[0] ^= 0xFF;
    assert!(matches!(apply_to(old, &patch), Err(PatchError::BadMagic)));
}

#[test]
fn rejects_truncated_stream() {
    let old = b"some old data";
    let mut patch = make_patch(old, b"some new data", None);
    // Drop the end sentinel.
    patch.truncate(patch.len() - 12);
    assert!(matches!(
        apply_to(old, &patch),
        Err(PatchError::PatchShort(_)) | Err(PatchError::PatchIo(_))
    ));
}

#[test]
fn rejects_corrupt_diff_field() {
    let old = b"hello world";
    let mut patch = make_patch(old, b"hello there", None);
    // First record header sits right after the 16-byte file header;
    // blow up its diff count.
    patch[16] ^= 0xFF;
    assert!(matches!(
        apply_to(old, &patch),
        Err(PatchError::PatchShort(_)) | Err(PatchError::Algorithm(_))
    ));
}

#[test]
fn rejects_size_mismatch() {
    let old = b"hello world";
    let mut patch = make_patch(old, b"hello there", None);
    // Bump the declared output size: the stream now ends one byte
    // short of its own header.
    patch[15] = patch[15].wrapping_add(1);
    assert!(matches!(
        apply_to(old, &patch),
        Err(PatchError::PatchShort(_))
    ));
}
