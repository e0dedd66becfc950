//! Code specific to the VPK directory format.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] module.
//!
//! The directory block starts with a fixed header,
//! followed by a "tree" grouping files by extension, then by directory:
//!
//! ```text
//! magic               4 bytes  (0x55aa1234)
//! major version       2 bytes  (2)
//! minor version       2 bytes  (3)
//! tree length         4 bytes
//! signature length    4 bytes  (0, we don't check signatures)
//! tree                (tree length bytes)
//! payload             (everything else in the directory block)
//! ```
//!
//! ```text
//! for each extension:  "ext\0"          ("" ends the list, " " means none)
//!   for each dir:      "some/dir\0"     ("" ends the list, " " means root)
//!     for each file:   "name\0"         ("" ends the list)
//!       crc32                 4 bytes
//!       preload bytes         2 bytes  (must be 0)
//!       block index           2 bytes  (0x7fff = the directory block)
//!       for each chunk:
//!         load flags          4 bytes
//!         texture flags       2 bytes
//!         offset in block     8 bytes
//!         compressed size     8 bytes
//!         uncompressed size   8 bytes
//!         terminator          2 bytes  (0xffff = last chunk, 0 = more follow)
//! ```
//!
//! All integers are little-endian.
//!
//! [`read`]: ../read/index.html

use camino::Utf8PathBuf;
use log::*;
use memchr::memchr;

use crate::arch::usize;
use crate::block::{BlockIndex, ReadAt};
use crate::fs::valid_path;
use crate::result::*;

/// Directory block magic number
pub const MAGIC: u32 = 0x55aa1234;
pub const MAJOR_VERSION: u16 = 2;
pub const MINOR_VERSION: u16 = 3;
/// Size of the fixed header preceding the tree
pub const HEADER_SIZE: u64 = 16;

const LAST_CHUNK: u16 = 0xffff;
const MORE_CHUNKS: u16 = 0;

/// Stands in for an empty extension or directory in the tree.
const NONE: &str = " ";

/// The root metadata of an archive, read from its directory block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub major_version: u16,
    pub minor_version: u16,
    /// Length of the tree in bytes
    pub tree_length: u32,
    /// Every file in the archive, in the order the tree lists them
    pub files: Vec<FileEntry>,
}

/// Metadata for a single file in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Slash-separated path of the file, relative to the archive root
    pub path: Utf8PathBuf,

    /// The block holding the file's chunks
    pub block: BlockIndex,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// The file's contents, in order
    pub chunks: Vec<ChunkEntry>,
}

impl FileEntry {
    /// Uncompressed size of the file in bytes
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.uncompressed_size).sum()
    }

    /// Compressed size of the file in bytes
    pub fn compressed_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.compressed_size).sum()
    }
}

/// An independently-compressed piece of a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub load_flags: u32,
    pub texture_flags: u16,
    /// Where the chunk starts in its block
    /// (for the directory block, relative to the end of the tree)
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl ChunkEntry {
    /// Chunks whose sizes match are stored as-is; the rest are DEFLATEd.
    pub fn is_compressed(&self) -> bool {
        self.compressed_size != self.uncompressed_size
    }
}

fn invalid<S: Into<String>>(why: S) -> VpkError {
    VpkError::InvalidArchive(why.into())
}

/// Splits `n` bytes off the front of the input, shrinking it.
fn take<'a>(input: &mut &'a [u8], n: usize, what: &str) -> VpkResult<&'a [u8]> {
    if input.len() < n {
        return Err(invalid(format!("Tree ended while reading {what}")));
    }
    let (front, rest) = input.split_at(n);
    *input = rest;
    Ok(front)
}

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8], what: &str) -> VpkResult<u64> {
    let bytes = take(input, std::mem::size_of::<u64>(), what)?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("took eight bytes")))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8], what: &str) -> VpkResult<u32> {
    let bytes = take(input, std::mem::size_of::<u32>(), what)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("took four bytes")))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8], what: &str) -> VpkResult<u16> {
    let bytes = take(input, std::mem::size_of::<u16>(), what)?;
    Ok(u16::from_le_bytes(bytes.try_into().expect("took two bytes")))
}

/// Reads a NUL-terminated UTF-8 string from the front of the provided slice, shrinking it.
fn read_str<'a>(input: &mut &'a [u8], what: &str) -> VpkResult<&'a str> {
    let end = memchr(0, input).ok_or_else(|| invalid(format!("Unterminated {what}")))?;
    let s = std::str::from_utf8(&input[..end])
        .map_err(|_| invalid(format!("{what} isn't valid UTF-8")))?;
    *input = &input[end + 1..];
    Ok(s)
}

impl Directory {
    /// Reads the directory from the start of the directory block.
    pub fn parse(source: &dyn ReadAt) -> VpkResult<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        source
            .read_exact_at(&mut header, 0)
            .map_err(|e| invalid(format!("Couldn't read header: {e}")))?;
        let mut header = &header[..];

        let magic = read_u32(&mut header, "magic")?;
        if magic != MAGIC {
            return Err(invalid(format!("Bad magic {magic:#010x}")));
        }
        let major_version = read_u16(&mut header, "major version")?;
        let minor_version = read_u16(&mut header, "minor version")?;
        if (major_version, minor_version) != (MAJOR_VERSION, MINOR_VERSION) {
            return Err(VpkError::Unsupported(format!(
                "Version {major_version}.{minor_version}"
            )));
        }
        let tree_length = read_u32(&mut header, "tree length")?;
        let signature_length = read_u32(&mut header, "signature length")?;
        if signature_length != 0 {
            return Err(VpkError::Unsupported(format!(
                "Signed directory ({signature_length} signature bytes)"
            )));
        }
        trace!("VPK v{major_version}.{minor_version}, {tree_length} byte tree");

        let source_len = source.size()?;
        if HEADER_SIZE + u64::from(tree_length) > source_len {
            return Err(invalid(format!(
                "{tree_length} byte tree doesn't fit in the {source_len} byte directory block"
            )));
        }
        let mut tree = vec![0u8; usize(tree_length)?];
        source
            .read_exact_at(&mut tree, HEADER_SIZE)
            .map_err(|e| invalid(format!("Couldn't read {tree_length} byte tree: {e}")))?;
        let files = parse_tree(&tree)?;
        debug!("Read {} entries from the directory", files.len());

        Ok(Self {
            major_version,
            minor_version,
            tree_length,
            files,
        })
    }

    /// Returns where payload data starts in the directory block,
    /// given the block's total length.
    pub fn chunk_offset(&self, source_len: u64) -> VpkResult<u64> {
        let offset = HEADER_SIZE + u64::from(self.tree_length);
        if offset > source_len {
            return Err(invalid(format!(
                "Chunk offset {offset} is past the end of the {source_len} byte directory block"
            )));
        }
        Ok(offset)
    }
}

fn parse_tree(mut tree: &[u8]) -> VpkResult<Vec<FileEntry>> {
    let mut files = Vec::new();
    loop {
        let ext = read_str(&mut tree, "extension")?;
        if ext.is_empty() {
            break;
        }
        loop {
            let dir = read_str(&mut tree, "directory")?;
            if dir.is_empty() {
                break;
            }
            loop {
                let name = read_str(&mut tree, "file name")?;
                if name.is_empty() {
                    break;
                }
                let path = join_path(ext, dir, name)?;
                let entry = parse_entry(&mut tree, path)?;
                trace!("{:?}", entry);
                files.push(entry);
            }
        }
    }
    if !tree.is_empty() {
        return Err(invalid(format!("{} trailing bytes after tree", tree.len())));
    }
    Ok(files)
}

fn join_path(ext: &str, dir: &str, name: &str) -> VpkResult<Utf8PathBuf> {
    let mut path = String::with_capacity(dir.len() + name.len() + ext.len() + 2);
    if dir != NONE {
        path.push_str(dir);
        path.push('/');
    }
    path.push_str(name);
    if ext != NONE {
        path.push('.');
        path.push_str(ext);
    }
    if path == "." || !valid_path(&path) {
        return Err(invalid(format!("Bad path {path:?} in tree")));
    }
    Ok(path.into())
}

fn parse_entry(tree: &mut &[u8], path: Utf8PathBuf) -> VpkResult<FileEntry> {
    let crc32 = read_u32(tree, "CRC-32")?;
    let preload_bytes = read_u16(tree, "preload length")?;
    if preload_bytes != 0 {
        return Err(VpkError::Unsupported(format!(
            "{path} has {preload_bytes} preload bytes"
        )));
    }
    let block = BlockIndex(read_u16(tree, "block index")?);

    let mut chunks = Vec::new();
    loop {
        chunks.push(ChunkEntry {
            load_flags: read_u32(tree, "load flags")?,
            texture_flags: read_u16(tree, "texture flags")?,
            offset: read_u64(tree, "chunk offset")?,
            compressed_size: read_u64(tree, "compressed size")?,
            uncompressed_size: read_u64(tree, "uncompressed size")?,
        });
        match read_u16(tree, "chunk terminator")? {
            LAST_CHUNK => break,
            MORE_CHUNKS => {}
            other => {
                return Err(invalid(format!(
                    "Bad chunk terminator {other:#06x} for {path}"
                )))
            }
        }
    }

    Ok(FileEntry {
        path,
        block,
        crc32,
        chunks,
    })
}
