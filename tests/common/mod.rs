//! Writes VPK archives to disk for the integration tests.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use rvpk::fixture::ArchiveBuilder;
use rvpk::naming::block_file_name;
use rvpk::BlockIndex;

/// A file to write: its path, the block holding it, and its chunks
pub struct TestFile {
    pub path: String,
    pub block: BlockIndex,
    pub chunks: Vec<Vec<u8>>,
}

impl TestFile {
    pub fn new(path: &str, block: BlockIndex, chunks: &[&[u8]]) -> Self {
        Self {
            path: path.to_owned(),
            block,
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Writes the archive's blocks into `dir`, returning the directory block's path.
pub fn write_archive(dir: &Path, prefix: &str, name: &str, files: &[TestFile]) -> Result<PathBuf> {
    let mut builder = ArchiveBuilder::new();
    for file in files {
        let chunks: Vec<&[u8]> = file.chunks.iter().map(Vec::as_slice).collect();
        builder = builder.stored_in(file.block, &file.path, &chunks);
    }
    let archive = builder.build();

    let dir_path = dir.join(block_file_name(prefix, name, BlockIndex::DIR));
    fs::write(&dir_path, &archive.dir)?;
    for (index, payload) in &archive.blocks {
        fs::write(dir.join(block_file_name(prefix, name, *index)), payload)?;
    }
    Ok(dir_path)
}
