//! How the blocks of an archive are named on disk.
//!
//! An archive called `client_mp_common.bsp.pak000` with the prefix `englishclient`
//! is stored as
//!
//! ```text
//! englishclient_mp_common.bsp.pak000_dir.vpk   <- directory block
//! client_mp_common.bsp.pak000_000.vpk          <- data block 0
//! client_mp_common.bsp.pak000_001.vpk          <- data block 1
//! ...
//! ```
//!
//! Only the directory block carries the (usually language) prefix.

use std::path::{Path, PathBuf};

use crate::block::BlockIndex;
use crate::result::*;

const EXTENSION: &str = ".vpk";

/// Returns the file name of the given block.
pub fn block_file_name(prefix: &str, name: &str, index: BlockIndex) -> String {
    if index.is_dir() {
        format!("{prefix}{name}_dir{EXTENSION}")
    } else {
        format!("{name}_{:03}{EXTENSION}", index.0)
    }
}

/// Splits the path to any block of an archive into
/// the directory holding the archive and the archive's name.
///
/// If `path` names the directory block, its file name must start with `prefix`.
pub fn parse_volume_path<P: AsRef<Path>>(path: P, prefix: &str) -> VpkResult<(PathBuf, String)> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| VpkError::InvalidPath(format!("{} has no UTF-8 file name", path.display())))?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let name = file_name.strip_suffix(EXTENSION).ok_or_else(|| {
        VpkError::InvalidPath(format!("{file_name} doesn't have a {EXTENSION} extension"))
    })?;

    let bytes = name.as_bytes();
    if bytes.len() < 4 || bytes[bytes.len() - 4] != b'_' {
        return Err(VpkError::InvalidPath(format!(
            "{file_name} doesn't end with _XXX{EXTENSION}, where XXX is a block number or 'dir'"
        )));
    }
    let (name, selector) = name.split_at(name.len() - 4);
    let selector = &selector[1..];

    if selector == "dir" {
        let name = name.strip_prefix(prefix).ok_or_else(|| {
            VpkError::InvalidPath(format!("{file_name} doesn't begin with prefix {prefix:?}"))
        })?;
        Ok((dir, name.to_owned()))
    } else if selector.bytes().all(|b| b.is_ascii_digit()) {
        Ok((dir, name.to_owned()))
    } else {
        Err(VpkError::InvalidPath(format!(
            "{file_name} has block selector {selector:?}, expected a block number or 'dir'"
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(
            block_file_name("englishclient", "_mp_common.bsp.pak000", BlockIndex::DIR),
            "englishclient_mp_common.bsp.pak000_dir.vpk"
        );
        assert_eq!(
            block_file_name("englishclient", "client_mp_common.bsp.pak000", BlockIndex(12)),
            "client_mp_common.bsp.pak000_012.vpk"
        );
    }

    #[test]
    fn parse_dir_volume() {
        let (dir, name) = parse_volume_path(
            "vpk/englishclient_frontend.bsp.pak000_dir.vpk",
            "english",
        )
        .unwrap();
        assert_eq!(dir, Path::new("vpk"));
        assert_eq!(name, "client_frontend.bsp.pak000");
        assert_eq!(
            block_file_name("english", &name, BlockIndex::DIR),
            "englishclient_frontend.bsp.pak000_dir.vpk"
        );
    }

    #[test]
    fn parse_data_volume() {
        let (dir, name) = parse_volume_path("client_frontend.bsp.pak000_003.vpk", "english").unwrap();
        assert_eq!(dir, Path::new(""));
        assert_eq!(name, "client_frontend.bsp.pak000");
    }

    #[test]
    fn parse_rejects() {
        for bad in [
            "foo_dir.zip",
            "dir.vpk",
            "foo.vpk",
            "foo_abc.vpk",
            "spanishfoo_dir.vpk",
        ] {
            match parse_volume_path(bad, "english") {
                Err(VpkError::InvalidPath(_)) => {}
                other => panic!("{bad} gave {other:?}"),
            }
        }
    }
}
