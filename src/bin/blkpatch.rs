use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use log::info;
use tempfile::NamedTempFile;

/// Rebuild a target file by applying a patch to its reference.
#[derive(FromArgs)]
struct Args {
    /// reference file; verified blocks are spliced back into it
    #[argh(positional)]
    old: PathBuf,

    /// output file, or a directory to create the output in
    #[argh(positional)]
    new: PathBuf,

    /// patch stream to apply
    #[argh(positional)]
    patch: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let mut old = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.old)
        .with_context(|| format!("opening reference {}", args.old.display()))?;
    let mut patch = BufReader::new(
        File::open(&args.patch)
            .with_context(|| format!("opening patch {}", args.patch.display()))?,
    );

    if args.new.is_dir() {
        let tmp = NamedTempFile::new_in(&args.new)
            .with_context(|| format!("creating output in {}", args.new.display()))?;
        let mut out = BufWriter::new(tmp);
        blkdelta::apply(&mut old, &mut out, &mut patch, &args.new)?;
        let tmp = out
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing output: {err}"))?;
        let (_, path) = tmp.keep().context("persisting output")?;
        info!("wrote {}", path.display());
    } else {
        let cache_dir = match args.new.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let out = File::create(&args.new)
            .with_context(|| format!("creating output {}", args.new.display()))?;
        let mut out = BufWriter::new(out);
        blkdelta::apply(&mut old, &mut out, &mut patch, &cache_dir)?;
        out.into_inner()
            .map_err(|err| anyhow::anyhow!("flushing output: {err}"))?;
    }
    Ok(())
}
