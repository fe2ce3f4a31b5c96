use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use thiserror::Error;
use zerocopy::FromBytes;

use crate::{seek_from_wire, EntryHeader, PatchHeader, BLKDELTA_MAGIC};

type Str = Box<str>;
type Result<T> = std::result::Result<T, PatchError>;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("io error on the reference file: {0}")]
    OldIo(#[source] std::io::Error),
    #[error("io error while writing the output: {0}")]
    NewIo(#[source] std::io::Error),
    #[error("io error while reading the patch: {0}")]
    PatchIo(#[source] std::io::Error),
    #[error("patch ended early: {0}")]
    PatchShort(Str),
    #[error("patch header carries an unknown magic")]
    BadMagic,
    #[error("patch application failed: {0}")]
    Algorithm(Str),
}

const BUF_SIZE: usize = 32 * 1024;

fn patch_read_err(err: std::io::Error) -> PatchError {
    if err.kind() == ErrorKind::UnexpectedEof {
        PatchError::PatchShort("patch stream ended inside a record".into())
    } else {
        PatchError::PatchIo(err)
    }
}

macro_rules! read {
    ($reader: expr, $type: ty) => {{
        let mut buf = [0; size_of::<$type>()];
        let data: Result<$type> = $reader
            .read_exact(&mut buf)
            .map_err(patch_read_err)
            .and_then(|_| {
                <$type>::read_from_bytes(&buf[..])
                    .map_err(|_| PatchError::Algorithm("malformed record header".into()))
            });
        data
    }};
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut bytes_read = 0;
    while bytes_read < buf.len() {
        match reader.read(&mut buf[bytes_read..]) {
            Ok(0) => break,
            Ok(n) => {
                bytes_read += n;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(bytes_read)
}

/// On-disk store of verified blocks, one file per block named after the
/// CRC-32 of its contents. The block under reconstruction lives in a
/// scratch file that is renamed into the store once it checks out.
struct BlockCache {
    dir: PathBuf,
    scratch: PathBuf,
}

impl BlockCache {
    fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(PatchError::NewIo)?;
        Ok(BlockCache {
            dir: dir.to_path_buf(),
            scratch: dir.join("block.tmp"),
        })
    }

    fn entry(&self, crc: u32) -> PathBuf {
        self.dir.join(format!("{crc:08x}.blk"))
    }

    fn begin(&self) -> Result<File> {
        File::create(&self.scratch).map_err(PatchError::NewIo)
    }

    /// Fsync and close the scratch file, then either promote it into
    /// the store under the given checksum or unlink it.
    fn seal(&self, block: File, promote: Option<u32>) -> Result<()> {
        block.sync_all().map_err(PatchError::NewIo)?;
        drop(block);
        match promote {
            Some(crc) => fs::rename(&self.scratch, self.entry(crc)).map_err(PatchError::NewIo),
            None => fs::remove_file(&self.scratch).map_err(PatchError::NewIo),
        }
    }

    fn discard(&self, block: File) -> Result<()> {
        drop(block);
        fs::remove_file(&self.scratch).map_err(PatchError::NewIo)
    }
}

fn apply_diff(
    patch_f: &mut impl Read,
    old_f: &mut impl Read,
    new_f: &mut impl Write,
    block_f: &mut File,
    oldcrc: &mut crc32fast::Hasher,
    mut size: u64,
) -> Result<()> {
    let mut old = [0; BUF_SIZE];
    let mut patch = [0; BUF_SIZE];
    while size > 0 {
        let to_read = BUF_SIZE.min(size as usize);
        let old = &mut old[..to_read];
        let patch = &mut patch[..to_read];

        patch_f.read_exact(patch).map_err(patch_read_err)?;
        let have = read_up_to(old_f, old).map_err(PatchError::OldIo)?;
        // Reference bytes past end-of-file read as zero, the same
        // padding the generator diffed against.
        old[have..].fill(0);
        oldcrc.update(old);

        old.iter_mut()
            .zip(patch.iter())
            .for_each(|(old, patch)| *old = old.wrapping_add(*patch));

        new_f.write_all(old).map_err(PatchError::NewIo)?;
        block_f.write_all(old).map_err(PatchError::NewIo)?;

        size -= to_read as u64;
    }
    Ok(())
}

fn copy_bytes(
    src: &mut impl Read,
    dst: &mut impl Write,
    block_f: &mut File,
    mut bytes: u64,
) -> Result<()> {
    let mut buf = [0; BUF_SIZE];
    while bytes > 0 {
        let to_read = BUF_SIZE.min(bytes as usize);
        let buf = &mut buf[..to_read];
        src.read_exact(buf).map_err(patch_read_err)?;
        dst.write_all(buf).map_err(PatchError::NewIo)?;
        block_f.write_all(buf).map_err(PatchError::NewIo)?;
        bytes -= to_read as u64;
    }
    Ok(())
}

/// Apply a patch file created by [`generate`][crate::generate].
///
/// `old` is the reference the patch was generated against. It must be
/// seekable, and writable too: whenever a finished block is available
/// in the cache, its contents are spliced back over the corresponding
/// reference region, which is the state the generator assumed when it
/// diffed the blocks after it.
///
/// `cache_dir` receives one file per verified block, named after the
/// block's CRC-32. Entries left there by an earlier run double as an
/// alternate source when the reference itself fails verification, so
/// an interrupted update can be re-applied over a half-written
/// reference and still converge.
pub fn apply(
    old: &mut (impl Read + Write + Seek),
    new: &mut impl Write,
    patch: &mut impl Read,
    cache_dir: &Path,
) -> Result<()> {
    let header = read!(patch, PatchHeader)?;
    if &header.magic != BLKDELTA_MAGIC {
        return Err(PatchError::BadMagic);
    }
    let cache = BlockCache::open(cache_dir)?;
    let mut block = cache.begin()?;
    let mut bytes_written: u64 = 0;
    let mut old_pos: i64 = 0;
    let mut oldcrc = crc32fast::Hasher::new();
    loop {
        let entry = read!(patch, EntryHeader)?;
        if entry.is_end() {
            new.flush().map_err(PatchError::NewIo)?;
            cache.discard(block)?;
            return if bytes_written == header.new_file_size.get() {
                Ok(())
            } else {
                Err(PatchError::PatchShort(
                    format!(
                        "output is {} bytes, header declared {}",
                        bytes_written,
                        header.new_file_size.get()
                    )
                    .into(),
                ))
            };
        }
        if entry.is_flush() {
            let want_old = entry.diff.get();
            let want_new = entry.extra.get();
            let block_len = block.stream_position().map_err(PatchError::NewIo)?;
            let block_start = bytes_written - block_len;
            let verified = oldcrc.clone().finalize() == want_old;
            if verified {
                debug!("block {block_start}..{bytes_written} verified, caching as {want_new:08x}");
            } else {
                debug!("block {block_start}..{bytes_written} failed reference checksum");
            }
            cache.seal(block, verified.then_some(want_new))?;
            let entry_path = cache.entry(want_new);
            if entry_path.exists() {
                let data = fs::read(&entry_path).map_err(PatchError::NewIo)?;
                if crc32fast::hash(&data) != want_new {
                    return Err(PatchError::Algorithm(
                        format!("cached block {want_new:08x} failed its checksum").into(),
                    ));
                }
                old.seek(SeekFrom::Start(block_start))
                    .map_err(PatchError::OldIo)?;
                old.write_all(&data).map_err(PatchError::OldIo)?;
                debug!(
                    "spliced block {want_new:08x} over reference {block_start}..{}",
                    block_start + data.len() as u64
                );
            }
            block = cache.begin()?;
            oldcrc = crc32fast::Hasher::new();
            continue;
        }

        let diff = u64::from(entry.diff.get());
        let extra = u64::from(entry.extra.get());
        let seek = seek_from_wire(entry.seek.get());
        trace!("record: diff {diff}, extra {extra}, seek {seek}");

        old.seek(SeekFrom::Start(old_pos as u64))
            .map_err(PatchError::OldIo)?;
        apply_diff(patch, old, new, &mut block, &mut oldcrc, diff)?;
        old_pos += diff as i64;
        copy_bytes(patch, new, &mut block, extra)?;
        old_pos = match old_pos.checked_add(seek) {
            Some(p) if p >= 0 => p,
            _ => {
                return Err(PatchError::OldIo(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "patch seeks out of the reference's range",
                )))
            }
        };
        bytes_written += diff + extra;
    }
}
