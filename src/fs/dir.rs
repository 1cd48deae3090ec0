//! Directories.
//!
//! A directory is an inode whose content is a sequence of fixed-size entries.
//! Every directory begins with a `..` entry naming its parent and a `.`
//! entry naming itself; the root is its own parent. Entry names are unique
//! within a directory, compared byte for byte.
//!
//! Removal is restrained three ways: a directory that is some task's working
//! directory, one that still holds entries beyond `.` and `..`, or one that
//! is open elsewhere cannot be removed. What `remove` actually does is clear
//! the naming entry and latch the inode for deletion; the sectors come back
//! when the last opener closes it.

use core::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, Result};
use crate::fs::inode::{self, InodeKind, InodeRef};
use crate::fs::path::FileName;
use crate::fs::FileSystem;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// A single on-disk directory entry.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone)]
struct Dirent {
    /// Sector of the named inode.
    inode_sector: u32,
    /// NUL-terminated name.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

pub(crate) const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert_eq!(DIRENT_SIZE, 20);

impl Dirent {
    fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name = [0; NAME_MAX + 1];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    /// The stored name, up to the first NUL.
    fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&ch| ch == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }

    fn in_use(&self) -> bool {
        self.in_use != 0
    }
}

/// An open directory with a cursor for [`Dir::readdir`].
pub struct Dir {
    ino: InodeRef,
    pos: u32,
}

impl Dir {
    /// Creates a directory inode at `sector` with room for `entry_capacity`
    /// entries besides the `..`/`.` prelude, then writes the prelude.
    /// `parent_sector` becomes the target of `..`; the root passes itself.
    pub(crate) fn create(
        fs: &FileSystem,
        sector: u32,
        entry_capacity: u32,
        parent_sector: u32,
    ) -> Result<()> {
        let length = (entry_capacity + 2) * DIRENT_SIZE as u32;
        inode::create(fs, sector, length, InodeKind::Dir)?;
        let dir = Dir::open(InodeRef::open(fs, sector))?;
        dir.add(&FileName::new(b"..").unwrap(), parent_sector)?;
        dir.add(&FileName::new(b".").unwrap(), sector)?;
        Ok(())
    }

    /// Wraps an open inode as a directory.
    pub(crate) fn open(ino: InodeRef) -> Result<Dir> {
        if !ino.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Dir { ino, pos: 0 })
    }

    /// Opens the root directory.
    pub(crate) fn open_root(fs: &FileSystem) -> Dir {
        Dir::open(InodeRef::open(fs, ROOT_DIR_SECTOR)).expect("root is not a directory")
    }

    /// Opens another handle onto the same directory, with a fresh cursor.
    pub fn reopen(&self) -> Dir {
        Dir {
            ino: self.ino.reopen(),
            pos: 0,
        }
    }

    pub(crate) fn inode(&self) -> &InodeRef {
        &self.ino
    }

    /// The directory's inode sector: its identity.
    pub fn inumber(&self) -> u32 {
        self.ino.sector()
    }

    fn read_entry(&self, off: u32) -> Option<Dirent> {
        let mut e = Dirent::new_zeroed();
        if self.ino.read_at(e.as_bytes_mut(), off) == DIRENT_SIZE {
            Some(e)
        } else {
            None
        }
    }

    /// Finds the in-use entry named `name` and its byte offset.
    fn find(&self, name: &FileName) -> Option<(Dirent, u32)> {
        let mut off = 0;
        while let Some(e) = self.read_entry(off) {
            if e.in_use() && e.name() == name.as_bytes() {
                return Some((e, off));
            }
            off += DIRENT_SIZE as u32;
        }
        None
    }

    /// Looks `name` up and opens the inode it refers to.
    pub fn lookup(&self, name: &FileName) -> Result<InodeRef> {
        let (e, _) = self.find(name).ok_or(FsError::NotFound)?;
        Ok(InodeRef::open(self.ino.fs(), e.inode_sector))
    }

    /// Adds an entry naming `inode_sector`. Fails if `name` is already taken.
    ///
    /// The entry lands in the first free slot; a full directory grows by one
    /// entry at end of file.
    pub fn add(&self, name: &FileName, inode_sector: u32) -> Result<()> {
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mut off = 0;
        while let Some(e) = self.read_entry(off) {
            if !e.in_use() {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let mut e = Dirent::new_zeroed();
        e.inode_sector = inode_sector;
        e.set_name(name);
        e.in_use = 1;
        if self.ino.write_at(e.as_bytes(), off) != DIRENT_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Removes the entry named `name`, latching the inode for deletion.
    ///
    /// A directory is refused while it is the calling task's working
    /// directory (`cwd_sector`), while it holds entries besides `.` and `..`,
    /// or while anyone else has it open. Files may be removed while open;
    /// their sectors come back at the last close.
    pub fn remove(&self, cwd_sector: Option<u32>, name: &FileName) -> Result<()> {
        let (mut e, off) = self.find(name).ok_or(FsError::NotFound)?;
        let target = InodeRef::open(self.ino.fs(), e.inode_sector);

        if Some(target.sector()) == cwd_sector {
            return Err(FsError::InUse);
        }
        if target.is_dir() {
            let dir = Dir::open(target.reopen())?;
            if dir.number_entries() > 2 {
                return Err(FsError::DirectoryNotEmpty);
            }
            drop(dir);
            // Ours is the only reference allowed at this point.
            if target.open_count() > 1 {
                return Err(FsError::InUse);
            }
        }

        e.in_use = 0;
        if self.ino.write_at(e.as_bytes(), off) != DIRENT_SIZE {
            return Err(FsError::NoSpace);
        }
        target.mark_removed();
        Ok(())
    }

    /// Yields the next entry name, skipping the `.` and `..` links. Returns
    /// `None` once the directory is exhausted.
    pub fn readdir(&mut self) -> Option<FileName> {
        while let Some(e) = self.read_entry(self.pos) {
            self.pos += DIRENT_SIZE as u32;
            if !e.in_use() {
                continue;
            }
            let name = FileName::new(e.name()).expect("corrupt directory entry name");
            if name.is_self() || name.is_parent() {
                continue;
            }
            return Some(name);
        }
        None
    }

    /// Counts in-use entries, `.` and `..` included.
    pub fn number_entries(&self) -> u32 {
        let mut count = 0;
        let mut off = 0;
        while let Some(e) = self.read_entry(off) {
            if e.in_use() {
                count += 1;
            }
            off += DIRENT_SIZE as u32;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::disk::RamDisk;
    use crate::fs::FileSystem;

    fn fresh_fs() -> FileSystem {
        FileSystem::init(Arc::new(RamDisk::new(4096)), true).unwrap()
    }

    fn name(s: &str) -> FileName {
        FileName::new(s.as_bytes()).unwrap()
    }

    fn make_dir(fs: &FileSystem, parent: &Dir, n: &str) -> Dir {
        let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
        Dir::create(fs, sector, 4, parent.inumber()).unwrap();
        parent.add(&name(n), sector).unwrap();
        Dir::open(parent.lookup(&name(n)).unwrap()).unwrap()
    }

    #[test]
    fn fresh_directory_has_self_and_parent() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let sub = make_dir(&fs, &root, "sub");

        assert_eq!(sub.number_entries(), 2);
        let dot = sub.lookup(&name(".")).unwrap();
        assert_eq!(dot.sector(), sub.inumber());
        let dotdot = sub.lookup(&name("..")).unwrap();
        assert_eq!(dotdot.sector(), root.inumber());

        // The root is its own parent.
        let up = root.lookup(&name("..")).unwrap();
        assert_eq!(up.sector(), root.inumber());
    }

    #[test]
    fn add_rejects_duplicates() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
        inode::create(&fs, sector, 0, InodeKind::File).unwrap();
        root.add(&name("twice"), sector).unwrap();
        assert_eq!(root.add(&name("twice"), sector), Err(FsError::AlreadyExists));
    }

    #[test]
    fn removed_slots_are_reused() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        for n in ["a", "b", "c"].iter() {
            let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
            inode::create(&fs, sector, 0, InodeKind::File).unwrap();
            root.add(&name(n), sector).unwrap();
        }
        let len_before = root.inode().length();
        root.remove(None, &name("b")).unwrap();

        let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
        inode::create(&fs, sector, 0, InodeKind::File).unwrap();
        root.add(&name("d"), sector).unwrap();
        // "d" slid into "b"'s slot instead of growing the file.
        assert_eq!(root.inode().length(), len_before);
    }

    #[test]
    fn directory_grows_past_its_initial_capacity() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let sub = make_dir(&fs, &root, "sub");
        let len_before = sub.inode().length();
        // Capacity 4 plus the prelude: the fifth file forces growth.
        for n in ["e1", "e2", "e3", "e4", "e5"].iter() {
            let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
            inode::create(&fs, sector, 0, InodeKind::File).unwrap();
            sub.add(&name(n), sector).unwrap();
        }
        assert_eq!(sub.number_entries(), 7);
        assert!(sub.inode().length() > len_before);
        assert!(sub.lookup(&name("e5")).is_ok());
    }

    #[test]
    fn readdir_skips_self_and_parent() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let mut sub = make_dir(&fs, &root, "sub");
        assert_eq!(sub.readdir(), None);

        let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
        inode::create(&fs, sector, 0, InodeKind::File).unwrap();
        sub.add(&name("only"), sector).unwrap();

        let mut sub = sub.reopen();
        let names: Vec<_> = std::iter::from_fn(|| sub.readdir()).collect();
        assert_eq!(names, [name("only")]);
    }

    #[test]
    fn remove_refuses_nonempty_directory() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let sub = make_dir(&fs, &root, "sub");
        let sector = fs.freemap().lock().unwrap().allocate(1).unwrap();
        inode::create(&fs, sector, 0, InodeKind::File).unwrap();
        sub.add(&name("pin"), sector).unwrap();

        assert_eq!(
            root.remove(None, &name("sub")),
            Err(FsError::DirectoryNotEmpty)
        );

        sub.remove(None, &name("pin")).unwrap();
        drop(sub);
        root.remove(None, &name("sub")).unwrap();
        assert_eq!(
            root.lookup(&name("sub")).map(|i| i.sector()),
            Err(FsError::NotFound)
        );
    }

    #[test]
    fn remove_refuses_open_directory() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let sub = make_dir(&fs, &root, "sub");
        // `sub` is still open here.
        assert_eq!(root.remove(None, &name("sub")), Err(FsError::InUse));
        drop(sub);
        root.remove(None, &name("sub")).unwrap();
    }

    #[test]
    fn remove_refuses_the_working_directory() {
        let fs = fresh_fs();
        let root = Dir::open_root(&fs);
        let sub = make_dir(&fs, &root, "sub");
        let cwd_sector = sub.inumber();
        drop(sub);
        assert_eq!(
            root.remove(Some(cwd_sector), &name("sub")),
            Err(FsError::InUse)
        );
        root.remove(None, &name("sub")).unwrap();
    }
}
