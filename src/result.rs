//! Error types and the related `Result<T>`

use std::fmt;
use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::block::BlockIndex;

pub type VpkResult<T> = Result<T, VpkError>;

#[derive(Debug, Error)]
pub enum VpkError {
    /// An error from underlying I/O
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// The resolver couldn't provide the directory block.
    #[error("Couldn't open data source for the directory block")]
    DirOpen(#[source] io::Error),

    /// The resolver couldn't provide a data block referenced by the directory.
    #[error("Couldn't open data source for block {index}")]
    BlockOpen {
        index: BlockIndex,
        #[source]
        source: io::Error,
    },

    /// The directory contained invalid data.
    #[error("Invalid VPK archive: {0}")]
    InvalidArchive(String),

    /// The archive uses a feature this reader doesn't handle.
    #[error("Unsupported VPK archive: {0}")]
    Unsupported(String),

    /// A file's decompressed contents didn't match its stored CRC-32.
    #[error("Checksum mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    Verification {
        path: Utf8PathBuf,
        expected: u32,
        actual: u32,
    },

    /// A user-provided path (not one from the archive) was invalid.
    #[error("Invalid path {0}")]
    InvalidPath(String),

    /// Nothing in the archive lives at the provided path.
    #[error("No file or directory in the archive with the path {0}")]
    NotExist(Utf8PathBuf),

    /// The block was never opened by the archive.
    #[error("No block {0} in the archive")]
    NoSuchBlock(BlockIndex),

    /// One or more blocks failed to release.
    #[error("Couldn't close data sources: {0}")]
    Close(CloseErrors),

    /// A size from the archive didn't fit in a usize,
    /// probably on a 32-bit system.
    #[error("VPK archive too large for address space")]
    InsufficientAddressSpace,
}

/// Every failure from closing an archive's blocks.
#[derive(Debug, Default)]
pub struct CloseErrors(pub Vec<(BlockIndex, io::Error)>);

impl CloseErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(BlockIndex, io::Error)> {
        self.0.iter()
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (index, err)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "block {index}: {err}")?;
        }
        Ok(())
    }
}

impl VpkError {
    /// Wraps the error for use in an `io::Read` implementation.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            VpkError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn close_errors_lists_everything() {
        let errs = CloseErrors(vec![
            (BlockIndex(0), io::Error::new(io::ErrorKind::Other, "first")),
            (BlockIndex(7), io::Error::new(io::ErrorKind::Other, "second")),
        ]);
        let message = VpkError::Close(errs).to_string();
        assert!(message.contains("block 000: first"), "{message}");
        assert!(message.contains("block 007: second"), "{message}");
    }

    #[test]
    fn verification_survives_io_wrapping() {
        let err = VpkError::Verification {
            path: "a/b.txt".into(),
            expected: 1,
            actual: 2,
        }
        .into_io();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let inner = err.into_inner().unwrap().downcast::<VpkError>().unwrap();
        assert!(matches!(*inner, VpkError::Verification { expected: 1, actual: 2, .. }));
    }
}
