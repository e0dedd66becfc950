//! Helper module to compute a CRC32 checksum

use std::io;
use std::io::prelude::*;

use camino::Utf8PathBuf;
use crc32fast::Hasher;

use crate::result::VpkError;

/// Reader that validates the CRC32 when it reaches the EOF.
///
/// Stopping short of the EOF never checks anything.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    provided_checksum: u32,
    path: Utf8PathBuf,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, provided_checksum: u32, path: Utf8PathBuf) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            provided_checksum,
            path,
        }
    }

    fn mismatch(&self) -> Option<VpkError> {
        let actual = self.hasher.clone().finalize();
        if actual == self.provided_checksum {
            None
        } else {
            Some(VpkError::Verification {
                path: self.path.clone(),
                expected: self.provided_checksum,
                actual,
            })
        }
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count == 0 && !buf.is_empty() {
            if let Some(e) = self.mismatch() {
                return Err(e.into_io());
            }
        }
        self.hasher.update(&buf[0..count]);
        Ok(count)
    }
}
