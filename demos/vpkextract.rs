use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error, Result};
use log::*;
use memmap2::Mmap;
use rayon::prelude::*;
use structopt::StructOpt;

use rvpk::block::{Memory, OpenedBlock};
use rvpk::naming::{block_file_name, parse_volume_path};
use rvpk::{BlockIndex, FileEntry, VpkArchive};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "vpkextract",
    about = "Dumps a VPK archive into the current directory"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<PathBuf>,

    /// Prints the tree of files in the archive instead of extracting them.
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// The prefix of the directory block's name (e.g., "english")
    #[structopt(short, long, default_value = "")]
    prefix: String,

    /// Decompress each file's chunks on this many threads.
    #[structopt(short = "j", long, default_value = "1")]
    chunk_threads: usize,

    /// Memory map blocks instead of reading them.
    #[structopt(short, long)]
    mmap: bool,

    /// Only extract what's under this path in the archive.
    #[structopt(short, long, default_value = ".")]
    root: String,

    #[structopt(name("VPK file"))]
    vpk_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    info!("Opening {:#?}", &args.vpk_path);
    let mut archive = if args.mmap {
        open_mapped(&args.vpk_path, &args.prefix)
    } else {
        VpkArchive::open_path(&args.vpk_path, &args.prefix).map_err(Error::from)
    }
    .context("Couldn't load archive")?;

    if let Some(chto) = &args.directory {
        std::env::set_current_dir(chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto.display()))?;
    }

    let files = walk(&archive, &args.root)?;
    let result = if args.dry_run {
        print_tree(&files)
    } else {
        read_vpk(&archive, &files, args.chunk_threads)
    };
    archive.close()?;
    result
}

fn open_mapped(vpk_path: &std::path::Path, prefix: &str) -> Result<VpkArchive> {
    let (dir, name) = parse_volume_path(vpk_path, prefix)?;
    let prefix = prefix.to_owned();
    let archive = VpkArchive::new(move |index: BlockIndex| -> io::Result<OpenedBlock> {
        let path = dir.join(block_file_name(&prefix, &name, index));
        debug!("Memory mapping {}", path.display());
        let file = File::open(&path)?;
        let mapping = unsafe { Mmap::map(&file)? };
        Ok(OpenedBlock::shared(Arc::new(Memory(mapping))))
    })?;
    Ok(archive)
}

/// Collects every file under `root` by listing directories, depth first.
fn walk<'a>(archive: &'a VpkArchive, root: &str) -> Result<Vec<(String, &'a FileEntry)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_owned()];
    while let Some(path) = pending.pop() {
        let node = archive
            .open(&path)
            .with_context(|| format!("Couldn't open {path}"))?;
        if let Some(entry) = node.stat().entry() {
            files.push((path, entry));
            continue;
        }
        let mut dir = match node.into_dir() {
            Some(dir) => dir,
            None => continue,
        };
        while let Some(children) = dir.read_dir(64) {
            for child in children.iter().rev() {
                let child_path = if path == "." {
                    child.name().to_owned()
                } else {
                    format!("{path}/{}", child.name())
                };
                match child.entry() {
                    Some(entry) => files.push((child_path, entry)),
                    None => pending.push(child_path),
                }
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn print_tree(files: &[(String, &FileEntry)]) -> Result<()> {
    for (path, entry) in files {
        println!(
            "{path} ({} bytes, {} stored, block {})",
            entry.size(),
            entry.compressed_size(),
            entry.block
        );
    }
    Ok(())
}

fn read_vpk(
    archive: &VpkArchive,
    files: &[(String, &FileEntry)],
    chunk_threads: usize,
) -> Result<()> {
    files.par_iter().try_for_each(|(path, entry)| -> Result<()> {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent.display()))?;
        }
        let mut reader = if chunk_threads > 1 {
            archive.open_file_parallel(entry, chunk_threads)?
        } else {
            archive.open_file(entry)?
        };
        let mut sink = File::create(&path)
            .with_context(|| format!("Couldn't create file {}", path.display()))?;
        io::copy(&mut reader, &mut sink)
            .with_context(|| format!("Couldn't extract {}", path.display()))?;
        Ok(())
    })
}
