//! Tools for reading a VPK archive.
//!
//! To start reading an archive, first create a [`VpkArchive`] from a
//! [`BlockResolver`], or from a path with [`VpkArchive::open_path()`].
//!
//! [`VpkArchive`]: struct.VpkArchive.html
//! [`BlockResolver`]: ../block/trait.BlockResolver.html
//! [`VpkArchive::open_path()`]: struct.VpkArchive.html#method.open_path

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::*;

use crate::block::*;
use crate::chunk::{ChunksReader, SectionReader};
use crate::crc_reader::Crc32Reader;
use crate::format::{ChunkEntry, Directory, FileEntry};
use crate::naming::parse_volume_path;
use crate::parallel::ParallelReader;
use crate::result::*;

/// A VPK archive to be read
///
/// Every block the directory refers to is opened up front
/// and shared by everything read from the archive afterwards.
pub struct VpkArchive {
    /// Metadata from the directory block
    root: Directory,
    /// Every opened block, including the directory block
    /// (windowed to start where its payload does).
    blocks: BTreeMap<BlockIndex, OpenedBlock>,
}

impl VpkArchive {
    /// Opens the archive with one of its blocks at `path`,
    /// e.g., `vpk/englishclient_mp_common.bsp.pak000_dir.vpk` with the prefix `english`.
    pub fn open_path<P: AsRef<Path>>(path: P, prefix: &str) -> VpkResult<Self> {
        let (dir, name) = parse_volume_path(path, prefix)?;
        Self::open_dir(dir, prefix, &name)
    }

    /// Opens the archive called `name` in `dir`.
    ///
    /// See the [`naming`](../naming/index.html) module for how blocks are named.
    pub fn open_dir<P: Into<PathBuf>>(dir: P, prefix: &str, name: &str) -> VpkResult<Self> {
        Self::new(FsResolver::new(dir, prefix, name))
    }

    /// Reads the archive's directory and opens every block it refers to.
    ///
    /// ```no_run
    /// # use rvpk::*;
    /// # use rvpk::block::*;
    /// let dir = std::fs::read("englishclient_frontend.bsp.pak000_dir.vpk")?;
    /// let archive = VpkArchive::new(|index: BlockIndex| -> std::io::Result<OpenedBlock> {
    ///     if index.is_dir() {
    ///         Ok(OpenedBlock::new(Memory(dir.clone())))
    ///     } else {
    ///         let name = format!("client_frontend.bsp.pak000_{:03}.vpk", index.0);
    ///         Ok(OpenedBlock::new(std::fs::File::open(name)?))
    ///     }
    /// })?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// If anything fails, blocks opened so far are released before returning.
    pub fn new<R: BlockResolver>(mut resolver: R) -> VpkResult<Self> {
        let mut blocks = BTreeMap::new();
        match open_blocks(&mut resolver, &mut blocks) {
            Ok(root) => Ok(Self { root, blocks }),
            Err(e) => {
                for (index, err) in release_all(&mut blocks).0 {
                    warn!("Couldn't release block {index} after failing to open the archive: {err}");
                }
                Err(e)
            }
        }
    }

    /// Returns the archive's decoded directory.
    pub fn directory(&self) -> &Directory {
        &self.root
    }

    /// Returns every file in the archive, in directory order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.root.files
    }

    /// Finds the file with exactly the given archive path.
    pub fn find(&self, path: &str) -> VpkResult<&FileEntry> {
        self.entries()
            .iter()
            .find(|f| f.path.as_str() == path)
            .ok_or_else(|| VpkError::NotExist(path.into()))
    }

    fn source(&self, index: BlockIndex) -> VpkResult<Arc<dyn ReadAt>> {
        self.blocks
            .get(&index)
            .map(|b| b.source.clone())
            .ok_or(VpkError::NoSuchBlock(index))
    }

    /// Reads the given file from the archive.
    ///
    /// The CRC-32 is checked when the reader hits EOF;
    /// reading only part of the file never checks it.
    pub fn open_file(&self, entry: &FileEntry) -> VpkResult<Box<dyn io::Read + Send>> {
        debug!("Reading {} from block {}", entry.path, entry.block);
        let chunks = ChunksReader::new(
            self.source(entry.block)?,
            entry.path.clone(),
            entry.chunks.clone(),
        );
        Ok(Box::new(Crc32Reader::new(
            chunks,
            entry.crc32,
            entry.path.clone(),
        )))
    }

    /// Like [`open_file()`](#method.open_file), but decompresses chunks
    /// on `workers` threads, going no more than `workers` chunks ahead of the reader.
    pub fn open_file_parallel(
        &self,
        entry: &FileEntry,
        workers: usize,
    ) -> VpkResult<Box<dyn io::Read + Send>> {
        let reader = ParallelReader::new(self.source(entry.block)?, entry, workers)?;
        Ok(Box::new(reader))
    }

    /// Reads a single chunk of a file exactly as stored (i.e., still compressed).
    pub fn open_chunk_raw(
        &self,
        entry: &FileEntry,
        chunk: &ChunkEntry,
    ) -> VpkResult<Box<dyn io::Read + Send>> {
        let reader = SectionReader::for_chunk(self.source(entry.block)?, chunk)?;
        Ok(Box::new(reader))
    }

    /// Returns the source of the given block.
    ///
    /// The directory block's source starts where its payload does.
    pub fn open_block_raw(&self, index: BlockIndex) -> VpkResult<Arc<dyn ReadAt>> {
        self.source(index)
    }

    /// Releases every block.
    ///
    /// Keeps going if releasing some blocks fails, and reports all failures.
    /// Closing an archive a second time does nothing.
    pub fn close(&mut self) -> VpkResult<()> {
        let errors = release_all(&mut self.blocks);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(VpkError::Close(errors))
        }
    }
}

fn open_blocks<R: BlockResolver>(
    resolver: &mut R,
    blocks: &mut BTreeMap<BlockIndex, OpenedBlock>,
) -> VpkResult<Directory> {
    let dir = resolver
        .resolve(BlockIndex::DIR)
        .map_err(VpkError::DirOpen)?;
    let dir_source = dir.source.clone();
    // Registered before parsing so a bad directory still gets released.
    blocks.insert(BlockIndex::DIR, dir);

    let root = Directory::parse(&*dir_source)?;
    let chunk_offset = root.chunk_offset(dir_source.size()?)?;
    trace!("Directory block payload starts at {chunk_offset}");
    let payload: Arc<dyn ReadAt> = Arc::new(Window::new(dir_source, chunk_offset));
    blocks
        .entry(BlockIndex::DIR)
        .and_modify(|b| b.source = payload);

    let referenced: BTreeSet<BlockIndex> = root.files.iter().map(|f| f.block).collect();
    for index in referenced {
        if blocks.contains_key(&index) {
            continue;
        }
        let block = resolver
            .resolve(index)
            .map_err(|source| VpkError::BlockOpen { index, source })?;
        debug!("Opened block {index}");
        blocks.insert(index, block);
    }
    Ok(root)
}

/// Runs (and forgets) every block's release action.
fn release_all(blocks: &mut BTreeMap<BlockIndex, OpenedBlock>) -> CloseErrors {
    let mut errors = CloseErrors::default();
    for (index, block) in blocks.iter_mut() {
        if let Some(release) = block.release.take() {
            trace!("Releasing block {index}");
            if let Err(e) = release() {
                errors.0.push((*index, e));
            }
        }
    }
    errors
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixture::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scenario() -> BuiltArchive {
        ArchiveBuilder::new()
            .file("a/b.txt", &[&[b'b'; 10], &[b'B'; 20]])
            .file("a/c.txt", &[b"ccccc"])
            .stored_in(BlockIndex(0), "d.txt", &[b"d"])
            .stored_in(BlockIndex(3), "e/f/g.bin", &[b"gee", b" whiz"])
            .build()
    }

    fn read_all(mut reader: impl Read) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn opens_referenced_blocks_once() {
        let archive = scenario();
        let mut inner = archive.resolver();
        let mut requested = vec![];
        let vpk = VpkArchive::new(|index: BlockIndex| {
            requested.push(index);
            inner(index)
        })
        .unwrap();
        assert_eq!(requested, [BlockIndex::DIR, BlockIndex(0), BlockIndex(3)]);
        assert_eq!(vpk.entries().len(), 4);
    }

    #[test]
    fn reads_every_file() {
        let vpk = VpkArchive::new(scenario().resolver()).unwrap();
        let b = vpk.find("a/b.txt").unwrap();
        assert_eq!(b.size(), 30);
        let mut expected = vec![b'b'; 10];
        expected.extend_from_slice(&[b'B'; 20]);
        assert_eq!(read_all(vpk.open_file(b).unwrap()).unwrap(), expected);

        let g = vpk.find("e/f/g.bin").unwrap();
        assert_eq!(read_all(vpk.open_file(g).unwrap()).unwrap(), b"gee whiz");
        let d = vpk.find("d.txt").unwrap();
        assert_eq!(read_all(vpk.open_file(d).unwrap()).unwrap(), b"d");

        for entry in vpk.entries() {
            let sequential = read_all(vpk.open_file(entry).unwrap()).unwrap();
            assert_eq!(sequential.len() as u64, entry.size());
            for workers in 1..=4 {
                let parallel = read_all(vpk.open_file_parallel(entry, workers).unwrap()).unwrap();
                assert_eq!(sequential, parallel);
            }
        }
    }

    #[test]
    fn raw_chunks_and_blocks() {
        let archive = scenario();
        let vpk = VpkArchive::new(archive.resolver()).unwrap();

        let g = vpk.find("e/f/g.bin").unwrap();
        let raw = read_all(vpk.open_chunk_raw(g, &g.chunks[1]).unwrap()).unwrap();
        assert_eq!(raw, b" whiz");

        let b = vpk.find("a/b.txt").unwrap();
        assert!(b.chunks[1].is_compressed());
        assert!(b.compressed_size() < b.size());
        let raw = read_all(vpk.open_chunk_raw(b, &b.chunks[1]).unwrap()).unwrap();
        assert_eq!(raw.len() as u64, b.chunks[1].compressed_size);

        let block = vpk.open_block_raw(BlockIndex(3)).unwrap();
        assert_eq!(block.size().unwrap(), archive.blocks[&BlockIndex(3)].len() as u64);

        // The directory block is windowed past its metadata.
        let dir = vpk.open_block_raw(BlockIndex::DIR).unwrap();
        let tree_end = 16 + tree_length(&archive.dir) as u64;
        assert_eq!(dir.size().unwrap(), archive.dir.len() as u64 - tree_end);

        match vpk.open_block_raw(BlockIndex(9)) {
            Err(VpkError::NoSuchBlock(BlockIndex(9))) => {}
            other => panic!("expected NoSuchBlock, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_block_fails_and_releases() {
        let archive = scenario();
        let mut inner = archive.resolver();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let result = VpkArchive::new(move |index: BlockIndex| -> io::Result<OpenedBlock> {
            if index == BlockIndex(3) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
            }
            let counter = counter.clone();
            Ok(inner(index)?.with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        });
        match result {
            Err(VpkError::BlockOpen { index, source }) => {
                assert_eq!(index, BlockIndex(3));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected BlockOpen, got {:?}", other.map(|_| ())),
        }
        // The directory and block 0 were opened before block 3 failed.
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bad_directory_fails_and_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let result = VpkArchive::new(move |_index: BlockIndex| -> io::Result<OpenedBlock> {
            let counter = counter.clone();
            Ok(OpenedBlock::new(Memory(b"not a vpk".to_vec())).with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        });
        assert!(matches!(result, Err(VpkError::InvalidArchive(_))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_directory() {
        let result = VpkArchive::new(|_index: BlockIndex| -> io::Result<OpenedBlock> {
            Err(io::Error::new(io::ErrorKind::NotFound, "nope"))
        });
        assert!(matches!(result, Err(VpkError::DirOpen(_))));
    }

    #[test]
    fn close_reports_every_failure() {
        let archive = scenario();
        let mut inner = archive.resolver();
        let mut vpk = VpkArchive::new(move |index: BlockIndex| -> io::Result<OpenedBlock> {
            let block = inner(index)?;
            Ok(if index.is_dir() {
                block.with_release(|| Ok(()))
            } else {
                block.with_release(move || {
                    Err(io::Error::new(io::ErrorKind::Other, format!("stuck {index}")))
                })
            })
        })
        .unwrap();

        match vpk.close() {
            Err(VpkError::Close(errors)) => {
                let failed: Vec<_> = errors.iter().map(|(i, _)| *i).collect();
                assert_eq!(failed, [BlockIndex(0), BlockIndex(3)]);
                let message = VpkError::Close(errors).to_string();
                assert!(message.contains("stuck 000") && message.contains("stuck 003"));
            }
            other => panic!("expected Close, got {:?}", other),
        }
        // Everything was already released.
        vpk.close().unwrap();
    }

    #[test]
    fn bad_crc_only_at_eof() {
        let archive = ArchiveBuilder::new()
            .file("oops.txt", &[b"some bytes", b"more bytes"])
            .bad_crc()
            .build();
        let vpk = VpkArchive::new(archive.resolver()).unwrap();
        let entry = vpk.find("oops.txt").unwrap();

        let mut prefix = [0u8; 15];
        vpk.open_file(entry).unwrap().read_exact(&mut prefix).unwrap();
        assert_eq!(&prefix, b"some bytesmore ");

        let err = read_all(vpk.open_file(entry).unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = read_all(vpk.open_file_parallel(entry, 2).unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn find_missing() {
        let vpk = VpkArchive::new(scenario().resolver()).unwrap();
        assert!(matches!(vpk.find("a"), Err(VpkError::NotExist(_))));
    }
}
