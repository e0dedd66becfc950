//! rvpk reads multi-volume VPK game archives,
//! decompressing any number of files concurrently through a simple API:
//!
//! ```no_run
//! # use std::fs::File;
//! # use std::io;
//! # use rvpk::*;
//! // Point it at any block of the archive.
//! // (Only the directory block carries the language prefix.)
//! let archive = VpkArchive::open_path("vpk/englishclient_mp_common.bsp.pak000_dir.vpk", "english")?;
//!
//! // The directory is a flat list of files...
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.path, entry.size());
//! }
//!
//! // ...but we can browse it like a tree.
//! let mut root = archive.open(".")?.into_dir().unwrap();
//! while let Some(children) = root.read_dir(16) {
//!     for child in children {
//!         println!("{} {}", if child.is_dir() { "d" } else { "-" }, child.name());
//!     }
//! }
//!
//! // Read a file out, checking its CRC-32 at the end:
//! let mut script = archive.open("scripts/vscripts/sh_consts.gnut")?.into_file().unwrap();
//! io::copy(&mut script, &mut io::sink())?;
//!
//! // Big files with lots of chunks can be decompressed on several threads.
//! let entry = archive.find("materials/models/big.vtf")?;
//! let mut reader = archive.open_file_parallel(entry, 4)?;
//! io::copy(&mut reader, &mut File::create("big.vtf")?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! A VPK archive is split over several files ("blocks"):
//! a directory block with the metadata for every file,
//! followed by numbered data blocks holding file contents.
//! Each file is divided into chunks, each compressed independently,
//! so a file's chunks can be decompressed in parallel and handed back in order.
//!
//! Blocks don't have to live on disk. Anything implementing [`BlockResolver`]
//! (including closures) can supply them, from memory, memory maps, or elsewhere.
//!
//! [`BlockResolver`]: block/trait.BlockResolver.html

pub mod block;
pub mod format;
pub mod fs;
pub mod naming;
pub mod read;
pub mod result;

pub use block::BlockIndex;
pub use format::{ChunkEntry, FileEntry};
pub use read::VpkArchive;
pub use result::{VpkError, VpkResult};

mod arch;
mod chunk;
mod crc_reader;
mod parallel;

#[doc(hidden)]
pub mod fixture;
