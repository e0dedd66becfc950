//! Blocks, the random-access sources backing them, and the resolvers that open them.
//!
//! A VPK archive is spread across several files ("blocks"):
//! a directory block holding the metadata (and sometimes payload),
//! plus numbered data blocks holding the rest of the payload.
//! [`VpkArchive`] doesn't care where blocks live; it asks a [`BlockResolver`]
//! for each one it needs and reads them through the [`ReadAt`] trait.
//!
//! [`VpkArchive`]: ../read/struct.VpkArchive.html

use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::*;
use parking_lot::RwLock;

use crate::naming::block_file_name;

/// Identifies a block of the archive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub u16);

impl BlockIndex {
    /// The reserved index of the directory block.
    pub const DIR: BlockIndex = BlockIndex(0x7fff);

    pub fn is_dir(self) -> bool {
        self == Self::DIR
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dir() {
            f.write_str("dir")
        } else {
            write!(f, "{:03}", self.0)
        }
    }
}

/// A source of bytes that can be read at arbitrary offsets.
///
/// Reads don't share a cursor,
/// so any number of threads can read from the same source at once.
pub trait ReadAt: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`.
    /// Returns 0 at (or past) the end of the source.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// The total length of the source in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Fills `buf` starting at `offset`, failing if the source ends first.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source ended before the requested range",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    // seek_read moves the file cursor, but nothing here uses it.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned reads aren't available on this platform",
        ))
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// In-memory bytes (a `Vec`, a boxed slice, a memory map...) as a source.
#[derive(Debug, Clone)]
pub struct Memory<T>(pub T);

impl<T: AsRef<[u8]> + Send + Sync> ReadAt for Memory<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let bytes = self.0.as_ref();
        let start = match usize::try_from(offset) {
            Ok(start) if start < bytes.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.0.as_ref().len() as u64)
    }
}

/// A view of another source starting at a fixed offset and running to its end.
///
/// The directory block stores its metadata up front,
/// so its payload offsets are relative to where the metadata ends.
pub struct Window {
    inner: Arc<dyn ReadAt>,
    start: u64,
}

impl Window {
    pub fn new(inner: Arc<dyn ReadAt>, start: u64) -> Self {
        Self { inner, start }
    }
}

impl ReadAt for Window {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match self.start.checked_add(offset) {
            Some(offset) => self.inner.read_at(buf, offset),
            None => Ok(0),
        }
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.inner.size()?.saturating_sub(self.start))
    }
}

/// A file on disk that can be closed while other handles to it are still around.
///
/// Reads after [`close()`](#method.close) fail instead of touching the file.
pub struct FileSource {
    file: RwLock<Option<File>>,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        Self {
            file: RwLock::new(Some(file)),
        }
    }

    /// Closes the underlying file.
    pub fn close(&self) -> io::Result<()> {
        drop(self.file.write().take());
        Ok(())
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "block source already closed")
}

impl ReadAt for FileSource {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match &*self.file.read() {
            Some(file) => ReadAt::read_at(file, buf, offset),
            None => Err(closed()),
        }
    }

    fn size(&self) -> io::Result<u64> {
        match &*self.file.read() {
            Some(file) => ReadAt::size(file),
            None => Err(closed()),
        }
    }
}

/// Releases whatever backs a block when the archive is closed.
pub type Release = Box<dyn FnOnce() -> io::Result<()> + Send + Sync>;

/// A block as provided by a [`BlockResolver`]:
/// its source, plus what to do (if anything) when the archive is closed.
pub struct OpenedBlock {
    pub source: Arc<dyn ReadAt>,
    pub release: Option<Release>,
}

impl OpenedBlock {
    /// A block with nothing to release.
    pub fn new<S: ReadAt + 'static>(source: S) -> Self {
        Self::shared(Arc::new(source))
    }

    pub fn shared(source: Arc<dyn ReadAt>) -> Self {
        Self {
            source,
            release: None,
        }
    }

    /// Runs `release` when the archive is closed.
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() -> io::Result<()> + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }
}

impl fmt::Debug for OpenedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedBlock")
            .field("releasable", &self.release.is_some())
            .finish()
    }
}

/// Opens blocks on demand.
///
/// The directory block ([`BlockIndex::DIR`]) is always requested first.
/// Any closure taking a `BlockIndex` and returning an `OpenedBlock` works.
pub trait BlockResolver {
    fn resolve(&mut self, index: BlockIndex) -> io::Result<OpenedBlock>;
}

impl<F> BlockResolver for F
where
    F: FnMut(BlockIndex) -> io::Result<OpenedBlock>,
{
    fn resolve(&mut self, index: BlockIndex) -> io::Result<OpenedBlock> {
        self(index)
    }
}

/// Opens blocks from files named after the usual VPK convention
/// (see [`block_file_name()`](../naming/fn.block_file_name.html)).
#[derive(Debug, Clone)]
pub struct FsResolver {
    pub dir: PathBuf,
    pub prefix: String,
    pub name: String,
}

impl FsResolver {
    pub fn new<P: Into<PathBuf>>(dir: P, prefix: &str, name: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_owned(),
            name: name.to_owned(),
        }
    }
}

impl BlockResolver for FsResolver {
    fn resolve(&mut self, index: BlockIndex) -> io::Result<OpenedBlock> {
        let path = self
            .dir
            .join(block_file_name(&self.prefix, &self.name, index));
        debug!("Opening block {} from {}", index, path.display());
        let file = File::open(&path).map_err(|e| {
            io::Error::new(e.kind(), format!("couldn't open {}: {}", path.display(), e))
        })?;
        let source = Arc::new(FileSource::new(file));
        let to_close = source.clone();
        Ok(OpenedBlock::shared(source).with_release(move || to_close.close()))
    }
}
