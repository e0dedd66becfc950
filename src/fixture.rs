//! Builds small archives in memory for tests.
//!
//! Not part of the API; public only so integration tests can share it.

use std::collections::BTreeMap;
use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::block::{BlockIndex, Memory, OpenedBlock};
use crate::format::{HEADER_SIZE, MAGIC, MAJOR_VERSION, MINOR_VERSION};

/// Raw DEFLATE, as compressed chunks are stored.
pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes).expect("writes to a Vec can't fail");
    encoder.finish().expect("writes to a Vec can't fail")
}

/// Length of the tree in a built directory block
pub fn tree_length(dir: &[u8]) -> usize {
    u32::from_le_bytes(dir[8..12].try_into().expect("four bytes")) as usize
}

struct PendingFile {
    path: String,
    block: BlockIndex,
    chunks: Vec<Vec<u8>>,
    crc32: Option<u32>,
}

#[derive(Default)]
pub struct ArchiveBuilder {
    files: Vec<PendingFile>,
}

fn push_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

pub struct BuiltArchive {
    pub dir: Vec<u8>,
    pub blocks: BTreeMap<BlockIndex, Vec<u8>>,
}

impl BuiltArchive {
    /// Serves every block from memory.
    pub fn resolver(&self) -> impl FnMut(BlockIndex) -> io::Result<OpenedBlock> {
        let dir = self.dir.clone();
        let blocks = self.blocks.clone();
        move |index| {
            if index.is_dir() {
                return Ok(OpenedBlock::new(Memory(dir.clone())));
            }
            blocks
                .get(&index)
                .map(|b| OpenedBlock::new(Memory(b.clone())))
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no block {index}")))
        }
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file stored in the directory block.
    pub fn file(self, path: &str, chunks: &[&[u8]]) -> Self {
        self.stored_in(BlockIndex::DIR, path, chunks)
    }

    pub fn stored_in(mut self, block: BlockIndex, path: &str, chunks: &[&[u8]]) -> Self {
        self.files.push(PendingFile {
            path: path.to_owned(),
            block,
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            crc32: None,
        });
        self
    }

    /// Gives the last added file the wrong CRC-32.
    pub fn bad_crc(mut self) -> Self {
        let last = self.files.last_mut().expect("no file to corrupt");
        let good = crc32fast::hash(&last.chunks.concat());
        last.crc32 = Some(!good);
        self
    }

    pub fn build(self) -> BuiltArchive {
        let mut payloads: BTreeMap<BlockIndex, Vec<u8>> = BTreeMap::new();
        // extension -> directory -> (name, entry record)
        let mut tree: BTreeMap<String, BTreeMap<String, Vec<(String, Vec<u8>)>>> = BTreeMap::new();

        for file in self.files {
            let payload = payloads.entry(file.block).or_default();
            let crc32 = file
                .crc32
                .unwrap_or_else(|| crc32fast::hash(&file.chunks.concat()));

            let mut record = Vec::new();
            record.extend_from_slice(&crc32.to_le_bytes());
            record.extend_from_slice(&0u16.to_le_bytes());
            record.extend_from_slice(&file.block.0.to_le_bytes());
            for (i, chunk) in file.chunks.iter().enumerate() {
                let compressed = deflate(chunk);
                let stored = if compressed.len() < chunk.len() {
                    compressed
                } else {
                    chunk.clone()
                };
                record.extend_from_slice(&0u32.to_le_bytes());
                record.extend_from_slice(&0u16.to_le_bytes());
                record.extend_from_slice(&(payload.len() as u64).to_le_bytes());
                record.extend_from_slice(&(stored.len() as u64).to_le_bytes());
                record.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
                let terminator: u16 = if i + 1 == file.chunks.len() { 0xffff } else { 0 };
                record.extend_from_slice(&terminator.to_le_bytes());
                payload.extend_from_slice(&stored);
            }

            let (dir, file_name) = match file.path.rfind('/') {
                Some(i) => (&file.path[..i], &file.path[i + 1..]),
                None => (" ", file.path.as_str()),
            };
            let (name, ext) = match file_name.rfind('.') {
                Some(i) => (&file_name[..i], &file_name[i + 1..]),
                None => (file_name, " "),
            };
            tree.entry(ext.to_owned())
                .or_default()
                .entry(dir.to_owned())
                .or_default()
                .push((name.to_owned(), record));
        }

        let mut tree_bytes = Vec::new();
        for (ext, dirs) in &tree {
            push_str(ext, &mut tree_bytes);
            for (dir, files) in dirs {
                push_str(dir, &mut tree_bytes);
                for (name, record) in files {
                    push_str(name, &mut tree_bytes);
                    tree_bytes.extend_from_slice(record);
                }
                push_str("", &mut tree_bytes);
            }
            push_str("", &mut tree_bytes);
        }
        push_str("", &mut tree_bytes);

        let mut dir = Vec::with_capacity(HEADER_SIZE as usize + tree_bytes.len());
        dir.extend_from_slice(&MAGIC.to_le_bytes());
        dir.extend_from_slice(&MAJOR_VERSION.to_le_bytes());
        dir.extend_from_slice(&MINOR_VERSION.to_le_bytes());
        dir.extend_from_slice(&(tree_bytes.len() as u32).to_le_bytes());
        dir.extend_from_slice(&0u32.to_le_bytes());
        dir.extend_from_slice(&tree_bytes);
        if let Some(payload) = payloads.remove(&BlockIndex::DIR) {
            dir.extend_from_slice(&payload);
        }

        BuiltArchive {
            dir,
            blocks: payloads,
        }
    }
}
