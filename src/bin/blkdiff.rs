use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use blkdelta::State;
use log::{debug, trace};

/// Generate a block-checksummed binary delta between two files.
#[derive(FromArgs)]
struct Args {
    /// reference file the patch will be applied against
    #[argh(positional)]
    old: PathBuf,

    /// target file the patch reconstructs
    #[argh(positional)]
    new: PathBuf,

    /// where to write the patch stream
    #[argh(positional)]
    patch: PathBuf,

    /// bytes of target per checksummed block, 0 for a single block
    #[argh(positional, default = "0")]
    block_size: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let old = fs::read(&args.old)
        .with_context(|| format!("reading reference {}", args.old.display()))?;
    let new = fs::read(&args.new)
        .with_context(|| format!("reading target {}", args.new.display()))?;
    let mut patch = BufWriter::new(
        fs::File::create(&args.patch)
            .with_context(|| format!("creating patch {}", args.patch.display()))?,
    );

    let block_size = (args.block_size != 0).then_some(args.block_size);
    blkdelta::generate(&old, &new, &mut patch, block_size, |state| match state {
        State::Sorting => debug!("suffix sorting"),
        State::Working(bytes) => trace!("scanned {bytes} target bytes"),
    })?;
    Ok(())
}
