//! A read-only file tree over the archive.
//!
//! The directory only lists file paths, so directories are made up on the fly:
//! every lookup scans the entries for ones under the requested path.

use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt;
use std::io;

use chrono::NaiveDateTime;
use log::*;

use crate::format::FileEntry;
use crate::read::VpkArchive;
use crate::result::*;

/// Returns true if `path` is a clean, slash-separated relative path,
/// or `.` for the root.
///
/// No empty, `.`, or `..` components, no leading or trailing slash,
/// and no backslashes.
pub fn valid_path(path: &str) -> bool {
    if path == "." {
        return true;
    }
    !path.is_empty()
        && path
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != ".." && !c.contains('\\'))
}

/// Whether an [`EntryInfo`] is a file or a (synthesized) directory
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// Metadata for a file or directory in the tree
#[derive(Clone, PartialEq, Eq)]
pub struct EntryInfo<'a> {
    name: String,
    file: Option<&'a FileEntry>,
}

impl<'a> EntryInfo<'a> {
    fn file(name: &str, entry: &'a FileEntry) -> Self {
        Self {
            name: name.to_owned(),
            file: Some(entry),
        }
    }

    fn dir(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            file: None,
        }
    }

    /// The last component of the path
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_type(&self) -> FileType {
        match self.file {
            Some(_) => FileType::File,
            None => FileType::Dir,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file.is_none()
    }

    /// Uncompressed size of a file, or zero for directories
    pub fn size(&self) -> u64 {
        self.file.map_or(0, FileEntry::size)
    }

    /// Unix-style permission bits
    pub fn mode(&self) -> u32 {
        if self.is_dir() {
            0o777
        } else {
            0o666
        }
    }

    /// Archives don't store modification times, so this is always the epoch.
    pub fn modified(&self) -> NaiveDateTime {
        NaiveDateTime::default()
    }

    /// The file's directory entry, so callers can skip looking it up again
    pub fn entry(&self) -> Option<&'a FileEntry> {
        self.file
    }
}

impl fmt::Debug for EntryInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryInfo")
            .field("name", &self.name)
            .field("type", &self.file_type())
            .field("size", &self.size())
            .finish()
    }
}

/// An open file in the tree
pub struct FileHandle<'a> {
    info: EntryInfo<'a>,
    reader: Box<dyn io::Read + Send>,
}

impl<'a> FileHandle<'a> {
    pub fn stat(&self) -> &EntryInfo<'a> {
        &self.info
    }
}

impl io::Read for FileHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// An open directory in the tree, listing its children in name order
pub struct DirHandle<'a> {
    info: EntryInfo<'a>,
    children: Vec<EntryInfo<'a>>,
    offset: usize,
}

impl<'a> DirHandle<'a> {
    pub fn stat(&self) -> &EntryInfo<'a> {
        &self.info
    }

    /// Returns up to `count` children not yet returned,
    /// or every remaining child if `count` is zero.
    ///
    /// Returns `None` once everything has been listed
    /// (unless `count` is zero, which always succeeds, if with nothing).
    pub fn read_dir(&mut self, count: usize) -> Option<Vec<EntryInfo<'a>>> {
        let remaining = self.children.len() - self.offset;
        if remaining == 0 && count > 0 {
            return None;
        }
        let n = if count > 0 {
            remaining.min(count)
        } else {
            remaining
        };
        let listed = self.children[self.offset..self.offset + n].to_vec();
        self.offset += n;
        Some(listed)
    }
}

impl<'a> Iterator for DirHandle<'a> {
    type Item = EntryInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.children.get(self.offset).cloned();
        if next.is_some() {
            self.offset += 1;
        }
        next
    }
}

/// A file or directory opened from the tree
pub enum Node<'a> {
    File(FileHandle<'a>),
    Dir(DirHandle<'a>),
}

impl<'a> Node<'a> {
    pub fn stat(&self) -> &EntryInfo<'a> {
        match self {
            Node::File(f) => f.stat(),
            Node::Dir(d) => d.stat(),
        }
    }

    pub fn into_file(self) -> Option<FileHandle<'a>> {
        match self {
            Node::File(f) => Some(f),
            Node::Dir(_) => None,
        }
    }

    pub fn into_dir(self) -> Option<DirHandle<'a>> {
        match self {
            Node::Dir(d) => Some(d),
            Node::File(_) => None,
        }
    }
}

impl VpkArchive {
    /// Opens the file or directory at `path` (`.` for the root).
    ///
    /// Paths are slash-separated and relative to the archive root.
    /// A path naming a file opens it for reading (see [`open_file()`]);
    /// any other path that some file lives under opens as a directory.
    ///
    /// [`open_file()`]: ../read/struct.VpkArchive.html#method.open_file
    pub fn open(&self, path: &str) -> VpkResult<Node<'_>> {
        if !valid_path(path) {
            return Err(VpkError::InvalidPath(path.to_owned()));
        }

        if let Some(entry) = self.entries().iter().find(|f| f.path.as_str() == path) {
            let name = entry.path.file_name().unwrap_or(path);
            return Ok(Node::File(FileHandle {
                info: EntryInfo::file(name, entry),
                reader: self.open_file(entry)?,
            }));
        }

        let prefix = if path == "." {
            String::new()
        } else {
            format!("{path}/")
        };
        let mut children: BTreeMap<&str, Option<&FileEntry>> = BTreeMap::new();
        for entry in self.entries() {
            let rest = match entry.path.as_str().strip_prefix(&prefix) {
                Some(rest) => rest,
                None => continue,
            };
            match rest.find('/') {
                Some(slash) => {
                    children.entry(&rest[..slash]).or_insert(None);
                }
                // A file beats a directory of the same name,
                // and the first of several identical paths wins.
                None => match children.entry(rest) {
                    Entry::Vacant(v) => {
                        v.insert(Some(entry));
                    }
                    Entry::Occupied(mut o) => {
                        if o.get().is_none() {
                            o.insert(Some(entry));
                        }
                    }
                },
            }
        }

        if children.is_empty() && path != "." {
            return Err(VpkError::NotExist(path.into()));
        }
        trace!("{} has {} children", path, children.len());

        let name = path.rsplit('/').next().unwrap_or(path);
        let children = children
            .into_iter()
            .map(|(name, file)| match file {
                Some(entry) => EntryInfo::file(name, entry),
                None => EntryInfo::dir(name),
            })
            .collect();
        Ok(Node::Dir(DirHandle {
            info: EntryInfo::dir(name),
            children,
            offset: 0,
        }))
    }
}
