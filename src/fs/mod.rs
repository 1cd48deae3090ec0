//! Filesystem implementation. Five layers:
//!   + Devices: raw 512-byte sector transfers ([`crate::disk`]).
//!   + Cache: a bounded write-back cache, the only path to the device
//!     ([`crate::bio`]).
//!   + Inodes: a doubly-indirect sector map per file, growing and shrinking
//!     on demand ([`inode`]).
//!   + Directories: inodes whose content is a sequence of named entries
//!     ([`dir`]).
//!   + Names: `/`-separated paths resolved from the root or from a task's
//!     working directory ([`path`]).
//!
//! This module holds the facade over those layers: mounting and unmounting a
//! volume, and the create/open/remove/chdir calls a system-call layer needs.
//! All of them resolve paths relative to a caller-owned [`Cwd`].

use std::sync::{Arc, Mutex};

use log::info;

use crate::bio::Bcache;
use crate::disk::BlockDevice;
use crate::error::{FsError, Result};
use crate::file::File;
use crate::param::{DIR_DEFAULT_ENTRIES, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub mod dir;
pub mod freemap;
pub mod inode;
pub mod path;

use self::dir::Dir;
use self::freemap::FreeMap;
use self::inode::{InodeKind, InodeRef, Itable};
use self::path::{filename_of, Path};

struct FsCore {
    cache: Bcache,
    itable: Itable,
    freemap: Mutex<FreeMap>,
    /// Serializes compound namespace updates (create, remove): their
    /// check-then-mutate sequences on a directory must not interleave.
    /// Reads, writes and lookups through handles stay parallel.
    ns_lock: Mutex<()>,
    sectors: u32,
}

/// A mounted volume.
///
/// Cloning is cheap and shares the volume; every open handle keeps its own
/// clone, so the volume outlives them. [`FileSystem::shutdown`] must run
/// before the last clone goes away or write-back data still in the cache is
/// lost.
#[derive(Clone)]
pub struct FileSystem {
    core: Arc<FsCore>,
}

/// What [`FileSystem::open`] found at a path.
pub enum Handle {
    File(File),
    Dir(Dir),
}

impl Handle {
    pub fn is_dir(&self) -> bool {
        matches!(self, Handle::Dir(_))
    }

    /// Inode sector of the opened object.
    pub fn inumber(&self) -> u32 {
        match self {
            Handle::File(f) => f.inumber(),
            Handle::Dir(d) => d.inumber(),
        }
    }
}

/// A task's current working directory: the origin for relative paths.
///
/// A fresh task starts with no directory, which resolves as the root. Only
/// [`FileSystem::chdir`] replaces the held directory.
#[derive(Default)]
pub struct Cwd {
    dir: Option<Dir>,
}

impl Cwd {
    pub fn new() -> Cwd {
        Cwd { dir: None }
    }

    fn sector(&self) -> Option<u32> {
        self.dir.as_ref().map(|d| d.inumber())
    }
}

impl FileSystem {
    /// Mounts the volume on `dev`, formatting it first when `format` is set.
    ///
    /// Mounting an unformatted volume without `format` panics on the invalid
    /// free-map inode; a garbled volume is not a recoverable condition here.
    pub fn init(dev: Arc<dyn BlockDevice>, format: bool) -> Result<FileSystem> {
        let sectors = dev.sector_count();
        let fs = FileSystem {
            core: Arc::new(FsCore {
                cache: Bcache::new(dev),
                itable: Itable::new(),
                freemap: Mutex::new(FreeMap::new(sectors)),
                ns_lock: Mutex::new(()),
                sectors,
            }),
        };
        if format {
            fs.format()?;
        }
        fs.open_free_map();
        info!(
            "mounted volume: {} sectors, {} free",
            sectors,
            fs.free_sector_count()
        );
        Ok(fs)
    }

    /// Flushes every dirty cache entry and persists the free map. The volume
    /// is consistent on disk once this returns.
    pub fn shutdown(&self) {
        self.close_free_map();
        self.core.cache.flush_all();
        info!("unmounted volume");
    }

    pub(crate) fn cache(&self) -> &Bcache {
        &self.core.cache
    }

    pub(crate) fn itable(&self) -> &Itable {
        &self.core.itable
    }

    pub(crate) fn freemap(&self) -> &Mutex<FreeMap> {
        &self.core.freemap
    }

    /// Number of free sectors on the volume.
    pub fn free_sector_count(&self) -> u32 {
        self.core.freemap.lock().unwrap().free_count()
    }

    fn format(&self) -> Result<()> {
        info!("formatting volume: {} sectors", self.core.sectors);
        {
            let mut fm = self.core.freemap.lock().unwrap();
            *fm = FreeMap::new(self.core.sectors);
            fm.mark(FREE_MAP_SECTOR);
            fm.mark(ROOT_DIR_SECTOR);
        }
        // The free-map file records every allocation made below, its own
        // data sectors included; it is persisted once the tree exists.
        inode::create(
            self,
            FREE_MAP_SECTOR,
            FreeMap::byte_len(self.core.sectors) as u32,
            InodeKind::File,
        )?;
        Dir::create(self, ROOT_DIR_SECTOR, DIR_DEFAULT_ENTRIES, ROOT_DIR_SECTOR)?;
        self.close_free_map();
        Ok(())
    }

    /// Loads the free map from its file at the well-known sector.
    fn open_free_map(&self) {
        let ino = InodeRef::open(self, FREE_MAP_SECTOR);
        let mut bytes = vec![0u8; FreeMap::byte_len(self.core.sectors)];
        let n = ino.read_at(&mut bytes, 0);
        assert_eq!(n, bytes.len(), "free-map file is truncated");
        *self.core.freemap.lock().unwrap() = FreeMap::from_bytes(self.core.sectors, &bytes);
    }

    /// Writes the free map back into its file. Works from a snapshot so the
    /// free-map mutex is never held across cache operations.
    fn close_free_map(&self) {
        let bytes = self.core.freemap.lock().unwrap().to_bytes();
        let ino = InodeRef::open(self, FREE_MAP_SECTOR);
        let n = ino.write_at(&bytes, 0);
        assert_eq!(n, bytes.len(), "free-map file write fell short");
    }

    /// Opens the root directory.
    pub fn open_root(&self) -> Dir {
        Dir::open_root(self)
    }

    /// Opens the walk origin for `path`: the root for an absolute path or
    /// when the task has no working directory, the working directory
    /// otherwise. The origin is a fresh handle either way; the task's own is
    /// never consumed.
    fn walk_origin(&self, cwd: &Cwd, path: &Path<'_>) -> Dir {
        match &cwd.dir {
            Some(dir) if !path.is_absolute() => dir.reopen(),
            _ => self.open_root(),
        }
    }

    /// Resolves the directory that contains the final component of `path`,
    /// whether or not that leaf exists. Fails if an intermediate component is
    /// missing or is not a directory.
    fn last_dir(&self, cwd: &Cwd, path_str: &str) -> Result<Dir> {
        if path_str.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let mut path = Path::new(path_str);
        let mut dir = self.walk_origin(cwd, &path);
        loop {
            let name = match path.next_part()? {
                Some(name) => name,
                None => return Ok(dir),
            };
            if path.is_exhausted() {
                // `name` is the leaf; `dir` is its parent.
                return Ok(dir);
            }
            dir = Dir::open(dir.lookup(&name)?)?;
        }
    }

    /// Resolves `path` fully: the leaf's parent directory and its inode.
    /// A path of only separators resolves to the root, parented by itself.
    fn resolve(&self, cwd: &Cwd, path_str: &str) -> Result<(Dir, InodeRef)> {
        if path_str.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let mut path = Path::new(path_str);
        let mut dir = self.walk_origin(cwd, &path);
        let mut name = match path.next_part()? {
            Some(name) => name,
            None => {
                let ino = dir.inode().reopen();
                return Ok((dir, ino));
            }
        };
        loop {
            let ino = dir.lookup(&name)?;
            name = match path.next_part()? {
                None => return Ok((dir, ino)),
                Some(next) => {
                    dir = Dir::open(ino)?;
                    next
                }
            };
        }
    }

    /// Creates a file (`initial_size` bytes, zero-filled) or a directory
    /// (`initial_size` entries of capacity) at `path`.
    pub fn create(&self, cwd: &Cwd, path: &str, initial_size: u32, is_dir: bool) -> Result<()> {
        let _ns = self.core.ns_lock.lock().unwrap();
        let dir = self.last_dir(cwd, path)?;
        let name = filename_of(path)?;
        if name.is_self() || name.is_parent() {
            return Err(FsError::InvalidPath);
        }
        // Checked again by `add`, but catching the common collision before
        // any sector is allocated keeps the failure path trivial.
        match dir.lookup(&name) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let sector = self
            .core
            .freemap
            .lock()
            .unwrap()
            .allocate(1)
            .ok_or(FsError::NoSpace)?;
        // The new inode sector goes back unless every later step lands.
        let sector = scopeguard::guard(sector, |s| {
            self.core.freemap.lock().unwrap().release(s, 1);
        });

        if is_dir {
            Dir::create(self, *sector, initial_size, dir.inumber())?;
        } else {
            inode::create(self, *sector, initial_size, InodeKind::File)?;
        }
        dir.add(&name, *sector)?;

        scopeguard::ScopeGuard::into_inner(sector);
        Ok(())
    }

    /// Creates a directory at `path` with the default entry capacity.
    pub fn mkdir(&self, cwd: &Cwd, path: &str) -> Result<()> {
        self.create(cwd, path, DIR_DEFAULT_ENTRIES, true)
    }

    /// Opens the file or directory at `path`. `"/"` opens the root.
    pub fn open(&self, cwd: &Cwd, path: &str) -> Result<Handle> {
        let (_, ino) = self.resolve(cwd, path)?;
        if ino.is_dir() {
            Ok(Handle::Dir(Dir::open(ino)?))
        } else {
            Ok(Handle::File(File::open(ino)))
        }
    }

    /// Removes the file or directory named by `path`. Directory removal is
    /// refused while the target is non-empty, open elsewhere, or the calling
    /// task's working directory. Removing an open file is allowed; its
    /// sectors are released at the last close.
    pub fn remove(&self, cwd: &Cwd, path: &str) -> Result<()> {
        let _ns = self.core.ns_lock.lock().unwrap();
        let dir = self.last_dir(cwd, path)?;
        let name = filename_of(path)?;
        if name.is_self() || name.is_parent() {
            return Err(FsError::InvalidPath);
        }
        dir.remove(cwd.sector(), &name)
    }

    /// Replaces the task's working directory with the directory at `path`.
    pub fn chdir(&self, cwd: &mut Cwd, path: &str) -> Result<()> {
        let (_, ino) = self.resolve(cwd, path)?;
        cwd.dir = Some(Dir::open(ino)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::disk::RamDisk;

    fn fresh_fs() -> FileSystem {
        FileSystem::init(Arc::new(RamDisk::new(4096)), true).unwrap()
    }

    #[test]
    fn open_root_by_slash() {
        let fs = fresh_fs();
        let handle = fs.open(&Cwd::new(), "/").unwrap();
        assert!(handle.is_dir());
        assert_eq!(handle.inumber(), crate::param::ROOT_DIR_SECTOR);
    }

    #[test]
    fn empty_path_is_invalid() {
        let fs = fresh_fs();
        let cwd = Cwd::new();
        assert!(matches!(fs.open(&cwd, ""), Err(FsError::InvalidPath)));
        assert!(matches!(
            fs.create(&cwd, "", 0, false),
            Err(FsError::InvalidPath)
        ));
        assert!(matches!(fs.remove(&cwd, "/"), Err(FsError::InvalidPath)));
    }

    #[test]
    fn create_open_remove_cycle() {
        let fs = fresh_fs();
        let cwd = Cwd::new();
        fs.create(&cwd, "/f", 100, false).unwrap();
        assert!(matches!(
            fs.create(&cwd, "/f", 0, false),
            Err(FsError::AlreadyExists)
        ));
        match fs.open(&cwd, "/f").unwrap() {
            Handle::File(f) => assert_eq!(f.len(), 100),
            Handle::Dir(_) => panic!("/f is a file"),
        }
        fs.remove(&cwd, "/f").unwrap();
        assert!(matches!(fs.open(&cwd, "/f"), Err(FsError::NotFound)));
    }

    #[test]
    fn failed_create_releases_the_inode_sector() {
        let fs = fresh_fs();
        let cwd = Cwd::new();
        fs.create(&cwd, "/f", 0, false).unwrap();
        let free = fs.free_sector_count();
        // Collides with the existing name before anything is written.
        assert!(fs.create(&cwd, "/f", 0, false).is_err());
        // Parent of the leaf is missing entirely.
        assert!(matches!(
            fs.create(&cwd, "/no/such/leaf", 0, false),
            Err(FsError::NotFound)
        ));
        assert_eq!(fs.free_sector_count(), free);
    }

    #[test]
    fn relative_paths_follow_the_working_directory() {
        let fs = fresh_fs();
        let mut cwd = Cwd::new();
        fs.mkdir(&cwd, "/a").unwrap();
        fs.chdir(&mut cwd, "/a").unwrap();
        fs.create(&cwd, "f", 0, false).unwrap();

        // Visible absolutely, and relatively through `.`/`..`.
        assert!(fs.open(&cwd, "/a/f").is_ok());
        assert!(fs.open(&cwd, "./f").is_ok());
        assert!(fs.open(&cwd, "../a/f").is_ok());

        // An absolute path ignores the working directory.
        assert!(matches!(fs.open(&cwd, "/f"), Err(FsError::NotFound)));
    }

    #[test]
    fn mid_path_file_is_not_a_directory() {
        let fs = fresh_fs();
        let cwd = Cwd::new();
        fs.create(&cwd, "/f", 0, false).unwrap();
        assert!(matches!(
            fs.open(&cwd, "/f/x"),
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(
            fs.create(&cwd, "/f/x", 0, false),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn chdir_rejects_files() {
        let fs = fresh_fs();
        let mut cwd = Cwd::new();
        fs.create(&cwd, "/f", 0, false).unwrap();
        assert!(matches!(
            fs.chdir(&mut cwd, "/f"),
            Err(FsError::NotADirectory)
        ));
        assert!(cwd.sector().is_none());
    }

    #[test]
    fn dot_names_cannot_be_created_or_removed() {
        let fs = fresh_fs();
        let cwd = Cwd::new();
        fs.mkdir(&cwd, "/d").unwrap();
        assert!(matches!(
            fs.create(&cwd, "/d/.", 0, false),
            Err(FsError::InvalidPath)
        ));
        assert!(matches!(
            fs.remove(&cwd, "/d/.."),
            Err(FsError::InvalidPath)
        ));
    }
}
