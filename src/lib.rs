//! sectorfs: a single-volume, sector-addressed filesystem.
//!
//! The volume is an array of 512-byte sectors behind the [`BlockDevice`]
//! trait. Every persistent access flows through one choke point, a 64-slot
//! write-back buffer cache, to inodes that map file bytes through a
//! doubly-indirect sector table (files up to 8 MiB, grown and trimmed on
//! demand), to directories with `.`/`..` links, and finally to `/`-separated
//! path resolution relative to a per-task working directory.
//!
//! ```
//! use std::sync::Arc;
//! use sectorfs::{Cwd, FileSystem, Handle, RamDisk};
//!
//! let fs = FileSystem::init(Arc::new(RamDisk::new(1024)), true).unwrap();
//! let cwd = Cwd::new();
//! fs.mkdir(&cwd, "/tmp").unwrap();
//! fs.create(&cwd, "/tmp/greeting", 0, false).unwrap();
//! if let Handle::File(mut f) = fs.open(&cwd, "/tmp/greeting").unwrap() {
//!     f.write(b"hello");
//! }
//! fs.shutdown();
//! ```
//!
//! Reads and writes are coordinated per inode: readers share, writers are
//! exclusive and preferred, and a write that grows a file is serialized
//! against everything else touching that file. Removal is deferred: an open
//! file removed from its directory stays usable until its last handle drops.

pub mod bio;
pub mod disk;
pub mod error;
pub mod file;
pub mod fs;
pub mod param;

pub use crate::disk::{BlockDevice, FileDisk, RamDisk};
pub use crate::error::{FsError, Result};
pub use crate::file::File;
pub use crate::fs::dir::Dir;
pub use crate::fs::path::FileName;
pub use crate::fs::{Cwd, FileSystem, Handle};
