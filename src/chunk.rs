//! Reading chunks out of their blocks.

use std::cmp;
use std::io::{self, Read};
use std::sync::Arc;

use camino::Utf8PathBuf;
use flate2::read::DeflateDecoder;
use log::*;

use crate::arch::usize;
use crate::block::ReadAt;
use crate::format::ChunkEntry;

/// Reads a byte range of a shared source.
pub struct SectionReader {
    source: Arc<dyn ReadAt>,
    position: u64,
    end: u64,
}

impl SectionReader {
    pub fn new(source: Arc<dyn ReadAt>, offset: u64, len: u64) -> io::Result<Self> {
        let end = offset.checked_add(len).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{len} byte range at {offset} overflows"),
            )
        })?;
        Ok(Self {
            source,
            position: offset,
            end,
        })
    }

    /// The stored bytes of the given chunk
    pub fn for_chunk(source: Arc<dyn ReadAt>, chunk: &ChunkEntry) -> io::Result<Self> {
        Self::new(source, chunk.offset, chunk.compressed_size)
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end - self.position;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = cmp::min(buf.len() as u64, remaining) as usize;
        let n = self.source.read_at(&mut buf[..max], self.position)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block ended {remaining} bytes short of the chunk's end"),
            ));
        }
        self.position += n as u64;
        Ok(n)
    }
}

/// Makes sure a chunk decompresses to exactly the size the directory promised.
struct SizedChunk<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for SizedChunk<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            let mut probe = [0u8; 1];
            return match self.inner.read(&mut probe)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk decompressed to more than its uncompressed size",
                )),
            };
        }
        let max = cmp::min(buf.len() as u64, self.remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk decompressed {} bytes short of its uncompressed size",
                    self.remaining
                ),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Returns a reader producing the decompressed contents of a chunk.
pub fn chunk_reader(
    source: Arc<dyn ReadAt>,
    chunk: &ChunkEntry,
) -> io::Result<Box<dyn Read + Send>> {
    let stored = SectionReader::for_chunk(source, chunk)?;
    let remaining = chunk.uncompressed_size;
    if chunk.is_compressed() {
        Ok(Box::new(SizedChunk {
            inner: DeflateDecoder::new(stored),
            remaining,
        }))
    } else {
        Ok(Box::new(SizedChunk {
            inner: stored,
            remaining,
        }))
    }
}

/// Decompresses a whole chunk into memory.
pub fn decode_chunk(source: Arc<dyn ReadAt>, chunk: &ChunkEntry) -> io::Result<Vec<u8>> {
    let capacity = usize(chunk.uncompressed_size).map_err(|e| e.into_io())?;
    let mut decoded = Vec::with_capacity(capacity);
    chunk_reader(source, chunk)?.read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Reads a file's chunks one after another.
///
/// Errors name the file and the chunk they came from.
pub struct ChunksReader {
    source: Arc<dyn ReadAt>,
    path: Utf8PathBuf,
    chunks: Vec<ChunkEntry>,
    next: usize,
    current: Option<Box<dyn Read + Send>>,
}

impl ChunksReader {
    pub fn new(source: Arc<dyn ReadAt>, path: Utf8PathBuf, chunks: Vec<ChunkEntry>) -> Self {
        Self {
            source,
            path,
            chunks,
            next: 0,
            current: None,
        }
    }

    /// Adds the path and chunk (the last one started) to an error.
    fn context(&self, e: io::Error) -> io::Error {
        let chunk = self.next.saturating_sub(1);
        io::Error::new(
            e.kind(),
            format!("couldn't read chunk {} of {}: {}", chunk, self.path, e),
        )
    }
}

impl Read for ChunksReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(current) = &mut self.current {
                match current.read(buf) {
                    Ok(0) => self.current = None,
                    Ok(n) => return Ok(n),
                    Err(e) => return Err(self.context(e)),
                }
            } else {
                let chunk = match self.chunks.get(self.next) {
                    Some(chunk) => chunk,
                    None => return Ok(0),
                };
                trace!("Reading chunk {} ({:?})", self.next, chunk);
                let reader = chunk_reader(self.source.clone(), chunk);
                self.next += 1;
                self.current = Some(reader.map_err(|e| self.context(e))?);
            }
        }
    }
}
