use crate::result::*;

/// A checked cast from u64 to usize
///
/// Chunk sizes come straight from the archive,
/// so this is the only way we turn them into buffer lengths.
pub fn usize<I: Into<u64>>(i: I) -> VpkResult<usize> {
    let i: u64 = i.into();
    usize::try_from(i).map_err(|_| VpkError::InsufficientAddressSpace)
}
