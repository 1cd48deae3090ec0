//! File handles.
//!
//! A [`File`] is one opener's view of a plain file: the shared inode plus a
//! private position advanced by [`File::read`] and [`File::write`], and a
//! deny-write latch asserted while the file backs a running executable. The
//! handle releases its latch and its inode reference when dropped, so a file
//! removed while open stays readable until the last handle goes away.

use crate::fs::inode::InodeRef;

/// An open file with a position.
pub struct File {
    ino: InodeRef,
    pos: u32,
    deny_write: bool,
}

impl File {
    pub(crate) fn open(ino: InodeRef) -> File {
        File {
            ino,
            pos: 0,
            deny_write: false,
        }
    }

    /// The file's inode sector.
    pub fn inumber(&self) -> u32 {
        self.ino.sector()
    }

    /// Current length in bytes.
    pub fn len(&self) -> u32 {
        self.ino.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads at the current position, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.ino.read_at(buf, self.pos);
        self.pos += n as u32;
        n
    }

    /// Reads at an explicit offset without moving the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        self.ino.read_at(buf, offset)
    }

    /// Writes at the current position, advancing it by the bytes written.
    /// Returns 0 while writes are denied.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.ino.write_at(buf, self.pos);
        self.pos += n as u32;
        n
    }

    /// Writes at an explicit offset without moving the position.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        self.ino.write_at(buf, offset)
    }

    /// Moves the position. Seeking past end of file is allowed; a later write
    /// there grows the file and the gap reads as zeros.
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    /// Current position.
    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Disables writes through every handle of this inode. May be called at
    /// most once per handle; undone by [`File::allow_write`] or by dropping
    /// the handle.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.ino.deny_write();
        }
    }

    /// Re-enables writes denied through this handle.
    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.ino.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::disk::RamDisk;
    use crate::fs::{Cwd, FileSystem, Handle};

    fn open_file(fs: &FileSystem, path: &str) -> crate::file::File {
        match fs.open(&Cwd::new(), path).unwrap() {
            Handle::File(f) => f,
            Handle::Dir(_) => panic!("{} is a directory", path),
        }
    }

    #[test]
    fn position_advances_with_reads_and_writes() {
        let fs = FileSystem::init(Arc::new(RamDisk::new(4096)), true).unwrap();
        fs.create(&Cwd::new(), "/f", 0, false).unwrap();
        let mut f = open_file(&fs, "/f");

        assert_eq!(f.write(b"hello "), 6);
        assert_eq!(f.write(b"world"), 5);
        assert_eq!(f.tell(), 11);
        assert_eq!(f.len(), 11);

        f.seek(0);
        let mut buf = [0u8; 11];
        assert_eq!(f.read(&mut buf), 11);
        assert_eq!(&buf, b"hello world");
        // At end of file reads come back empty.
        assert_eq!(f.read(&mut buf), 0);
    }

    #[test]
    fn seek_past_eof_then_write_leaves_a_zero_gap() {
        let fs = FileSystem::init(Arc::new(RamDisk::new(4096)), true).unwrap();
        fs.create(&Cwd::new(), "/gap", 0, false).unwrap();
        let mut f = open_file(&fs, "/gap");
        f.seek(1000);
        assert_eq!(f.write(b"tail"), 4);
        assert_eq!(f.len(), 1004);

        let mut buf = vec![0xffu8; 1000];
        assert_eq!(f.read_at(&mut buf, 0), 1000);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn deny_write_is_per_inode_and_undone_on_drop() {
        let fs = FileSystem::init(Arc::new(RamDisk::new(4096)), true).unwrap();
        fs.create(&Cwd::new(), "/x", 0, false).unwrap();
        let mut a = open_file(&fs, "/x");
        let b = open_file(&fs, "/x");

        a.deny_write();
        // The latch lives on the inode, so the other handle is denied too.
        assert_eq!(b.write_at(b"no", 0), 0);
        drop(a);
        assert_eq!(b.write_at(b"yes", 0), 3);
    }
}
