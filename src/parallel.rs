//! Decompressing a file's chunks on several threads at once.
//!
//! Workers claim chunks in order, decode them, and drop them off in a
//! reorder buffer. The reader hands them out strictly in chunk order.
//! Workers never get more than `n` chunks ahead of the reader,
//! so memory use is bounded no matter how many chunks a file has.

use std::cmp;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camino::Utf8PathBuf;
use crc32fast::Hasher;
use log::*;
use parking_lot::{Condvar, Mutex};

use crate::block::ReadAt;
use crate::chunk::decode_chunk;
use crate::format::{ChunkEntry, FileEntry};
use crate::result::*;

/// A decoded chunk and the CRC-32 of its contents
type Decoded = io::Result<(Vec<u8>, Hasher)>;

struct State {
    /// Chunks handed to workers so far
    claimed: usize,
    /// Chunks the reader has read all the way through
    consumed: usize,
    /// Decoded chunks waiting for the reader
    decoded: BTreeMap<usize, Decoded>,
    /// Workers that haven't exited
    live_workers: usize,
    /// Set when the reader goes away
    abandoned: bool,
}

struct Shared {
    source: Arc<dyn ReadAt>,
    chunks: Vec<ChunkEntry>,
    readahead: usize,
    state: Mutex<State>,
    /// Signalled whenever any field of `state` changes
    changed: Condvar,
}

/// Reads a file whose chunks are decompressed by a pool of worker threads.
///
/// The CRC-32 is verified once the last chunk has been read.
/// Dropping the reader early stops the workers.
pub struct ParallelReader {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    path: Utf8PathBuf,
    provided_checksum: u32,
    hasher: Hasher,
    /// The next chunk to take from the workers
    next: usize,
    current: Vec<u8>,
    position: usize,
    failed: bool,
}

impl ParallelReader {
    pub fn new(source: Arc<dyn ReadAt>, entry: &FileEntry, workers: usize) -> VpkResult<Self> {
        let workers = cmp::max(workers, 1);
        debug!(
            "Reading {} ({} chunks) with {} workers",
            entry.path,
            entry.chunks.len(),
            workers
        );
        let shared = Arc::new(Shared {
            source,
            chunks: entry.chunks.clone(),
            readahead: workers,
            state: Mutex::new(State {
                claimed: 0,
                consumed: 0,
                decoded: BTreeMap::new(),
                live_workers: 0,
                abandoned: false,
            }),
            changed: Condvar::new(),
        });

        let mut reader = Self {
            shared,
            workers: Vec::with_capacity(workers),
            path: entry.path.clone(),
            provided_checksum: entry.crc32,
            hasher: Hasher::new(),
            next: 0,
            current: Vec::new(),
            position: 0,
            failed: false,
        };

        // If spawning fails partway, dropping `reader` stops the workers we did start.
        for i in 0..workers {
            let shared = reader.shared.clone();
            shared.state.lock().live_workers += 1;
            let spawned = thread::Builder::new()
                .name(format!("vpk-decode-{i}"))
                .spawn(move || work(shared));
            match spawned {
                Ok(handle) => reader.workers.push(handle),
                Err(e) => {
                    reader.shared.state.lock().live_workers -= 1;
                    return Err(e.into());
                }
            }
        }
        Ok(reader)
    }

    /// Waits for the next chunk in order and makes it current.
    ///
    /// Only called once the current chunk is drained,
    /// which frees a worker to claim another chunk.
    fn take_next(&mut self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.consumed != self.next {
            state.consumed = self.next;
            self.shared.changed.notify_all();
        }
        let decoded = loop {
            if let Some(decoded) = state.decoded.remove(&self.next) {
                break decoded;
            }
            if state.live_workers == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("decode workers exited before chunk {}", self.next),
                ));
            }
            self.shared.changed.wait(&mut state);
        };
        drop(state);

        let (bytes, hasher) = decoded.map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("couldn't decode chunk {} of {}: {}", self.next, self.path, e),
            )
        })?;
        trace!("Took chunk {} ({} bytes)", self.next, bytes.len());
        self.hasher.combine(&hasher);
        self.current = bytes;
        self.position = 0;
        self.next += 1;
        Ok(())
    }
}

/// Claims, decodes, and files away chunks until there are none left
/// or the reader is dropped.
fn work(shared: Arc<Shared>) {
    struct Exit<'a>(&'a Shared);

    // Runs even if decoding panics, so the reader never waits on a dead worker.
    impl Drop for Exit<'_> {
        fn drop(&mut self) {
            self.0.state.lock().live_workers -= 1;
            self.0.changed.notify_all();
        }
    }

    let _exit = Exit(&shared);
    loop {
        let index = {
            let mut state = shared.state.lock();
            loop {
                if state.abandoned || state.claimed >= shared.chunks.len() {
                    return;
                }
                if state.claimed < state.consumed + shared.readahead {
                    break;
                }
                shared.changed.wait(&mut state);
            }
            state.claimed += 1;
            state.claimed - 1
        };

        let decoded = decode_chunk(shared.source.clone(), &shared.chunks[index]).map(|bytes| {
            let mut hasher = Hasher::new();
            hasher.update(&bytes);
            (bytes, hasher)
        });

        let mut state = shared.state.lock();
        if state.abandoned {
            return;
        }
        state.decoded.insert(index, decoded);
        drop(state);
        shared.changed.notify_all();
    }
}

impl Read for ParallelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("an earlier chunk of {} failed to decode", self.path),
            ));
        }
        while self.position == self.current.len() {
            if self.next == self.shared.chunks.len() {
                let actual = self.hasher.clone().finalize();
                if actual != self.provided_checksum {
                    return Err(VpkError::Verification {
                        path: self.path.clone(),
                        expected: self.provided_checksum,
                        actual,
                    }
                    .into_io());
                }
                return Ok(0);
            }
            if let Err(e) = self.take_next() {
                self.failed = true;
                return Err(e);
            }
        }
        let n = cmp::min(buf.len(), self.current.len() - self.position);
        buf[..n].copy_from_slice(&self.current[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl Drop for ParallelReader {
    fn drop(&mut self) {
        self.shared.state.lock().abandoned = true;
        self.shared.changed.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("A decode worker for {} panicked", self.path);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::{BlockIndex, Memory};
    use crate::fixture::*;
    use crate::format::Directory;
    use crate::read::VpkArchive;
    use std::time::{Duration, Instant};

    fn many_chunks() -> (BuiltArchive, Vec<u8>) {
        let chunks: Vec<Vec<u8>> = (0..37)
            .map(|i| format!("chunk {i}; ").repeat(i % 9 + 1).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let archive = ArchiveBuilder::new().file("big.bin", &refs).build();
        (archive, chunks.concat())
    }

    fn entry(archive: &BuiltArchive) -> (Arc<dyn ReadAt>, FileEntry) {
        let source: Arc<dyn ReadAt> = Arc::new(Memory(archive.dir.clone()));
        let root = Directory::parse(&*source).unwrap();
        let offset = root.chunk_offset(archive.dir.len() as u64).unwrap();
        let window: Arc<dyn ReadAt> = Arc::new(crate::block::Window::new(source, offset));
        (window, root.files[0].clone())
    }

    #[test]
    fn in_order_for_any_worker_count() {
        let (archive, expected) = many_chunks();
        let (source, entry) = entry(&archive);
        for workers in 0..=8 {
            let mut reader = ParallelReader::new(source.clone(), &entry, workers).unwrap();
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(out, expected, "{workers} workers");
        }
    }

    #[test]
    fn small_reads() {
        let (archive, expected) = many_chunks();
        let (source, entry) = entry(&archive);
        let mut reader = ParallelReader::new(source, &entry, 3).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match reader.read(&mut buf).unwrap() {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(out, expected);
    }

    /// Waits until workers have claimed `claimed` chunks, then gives them
    /// time to (wrongly) claim more.
    fn settle(reader: &ParallelReader, claimed: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while reader.shared.state.lock().claimed < claimed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn readahead_is_bounded() {
        let (archive, _) = many_chunks();
        let (source, entry) = entry(&archive);
        let mut reader = ParallelReader::new(source, &entry, 4).unwrap();

        // Partway through the first chunk, nothing has been consumed.
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        settle(&reader, 4);
        {
            let state = reader.shared.state.lock();
            assert_eq!(state.consumed, 0);
            assert_eq!(state.claimed, 4);
            assert!(state.decoded.len() <= 3);
        }

        // Finishing it (and starting the next) frees up one more.
        let mut rest = vec![0u8; entry.chunks[0].uncompressed_size as usize];
        reader.read_exact(&mut rest).unwrap();
        settle(&reader, 5);
        let state = reader.shared.state.lock();
        assert_eq!(state.consumed, 1);
        assert_eq!(state.claimed, 5);
        assert!(state.decoded.len() <= 3);
    }

    #[test]
    fn bad_checksum_only_at_end() {
        let (archive, expected) = many_chunks();
        let (source, mut entry) = entry(&archive);
        entry.crc32 ^= 1;

        let mut reader = ParallelReader::new(source.clone(), &entry, 4).unwrap();
        let mut prefix = vec![0u8; expected.len() / 2];
        reader.read_exact(&mut prefix).unwrap();
        drop(reader);

        let mut reader = ParallelReader::new(source, &entry, 4).unwrap();
        let mut all = Vec::new();
        let err = reader.read_to_end(&mut all).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(all, expected);
    }

    #[test]
    fn abandon_early() {
        let (archive, _) = many_chunks();
        let (source, entry) = entry(&archive);
        for workers in [1, 2, 16] {
            let reader = ParallelReader::new(source.clone(), &entry, workers).unwrap();
            // Joins every worker; hanging here would be the bug.
            drop(reader);
        }
    }

    #[test]
    fn bad_chunk_surfaces_in_order() {
        let (archive, expected) = many_chunks();
        let (source, mut entry) = entry(&archive);
        // Point a late chunk past the end of the block.
        entry.chunks[30].offset = u64::MAX / 2;
        let good: usize = entry.chunks[..30]
            .iter()
            .map(|c| c.uncompressed_size as usize)
            .sum();

        let mut reader = ParallelReader::new(source, &entry, 5).unwrap();
        let mut prefix = vec![0u8; good];
        reader.read_exact(&mut prefix).unwrap();
        assert_eq!(prefix, &expected[..good]);

        let mut rest = [0u8; 16];
        let message = reader.read(&mut rest).unwrap_err().to_string();
        assert!(message.contains("chunk 30 of big.bin"), "{message}");
        assert!(reader.read(&mut rest).is_err());
    }

    #[test]
    fn through_the_archive() {
        let (archive, expected) = many_chunks();
        let vpk = VpkArchive::new(archive.resolver()).unwrap();
        let entry = &vpk.entries()[0];
        assert_eq!(entry.block, BlockIndex::DIR);
        let mut out = Vec::new();
        vpk.open_file_parallel(entry, 6)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, expected);
    }
}
