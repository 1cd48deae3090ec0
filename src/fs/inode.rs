//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk inode
//! occupies exactly one sector and that sector number is the inode's
//! identity. It holds the file length and the root of a two-level sector
//! map: a doubly-indirect table of 128 pointers, each naming an indirect
//! table of 128 data-sector pointers. Files grow and shrink by rewriting the
//! map through [`resize`]; grown regions are zero-filled so reads of
//! unwritten bytes observe zeros.
//!
//! The filesystem keeps a table of open inodes in memory so that opening the
//! same sector twice yields the same bookkeeping entry. The entry counts its
//! openers and carries the removal latch: [`Itable::close`] of the last
//! reference to a removed inode frees the file contents and the inode sector
//! itself. Deallocation is deferred, never immediate, so handles opened
//! before a removal keep working.
//!
//! Every open inode also coordinates its readers and writers. Readers of one
//! inode run concurrently; a writer is exclusive and preferred, so a stream
//! of readers cannot starve a pending grow. The discipline is a pair of
//! RAII guards:
//!
//!   let _r = inode.begin_read();   // blocks while a writer is active/waiting
//!   ... read the file ...
//!                                  // dropping the guard wakes a writer
//!
//! On-disk inode fields never bypass the buffer cache: the length a reader
//! observes is the length most recently committed through the cache, so a
//! concurrent grow is seen either entirely or not at all.

use core::mem;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::param::{MAX_FILE_SIZE, NPTR, SECTOR_SIZE};

/// Identifies a valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// What an inode stores.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeKind {
    File,
    Dir,
}

const KIND_FILE: u32 = 0;
const KIND_DIR: u32 = 1;

/// On-disk inode. Exactly one sector, little-endian.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct Dinode {
    /// Sector of the doubly-indirect pointer table; 0 until first allocated.
    indirect: u32,
    /// File size in bytes.
    length: u32,
    magic: u32,
    /// `KIND_FILE` or `KIND_DIR`.
    kind: u32,
    reserved: [u8; SECTOR_SIZE - 16],
}

const_assert_eq!(mem::size_of::<Dinode>(), SECTOR_SIZE);

/// One level of the sector map: 128 sector pointers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct PtrBlock {
    ptrs: [u32; NPTR],
}

const_assert_eq!(mem::size_of::<PtrBlock>(), SECTOR_SIZE);

impl PtrBlock {
    fn read(fs: &FileSystem, sector: u32) -> PtrBlock {
        let mut table = PtrBlock::new_zeroed();
        fs.cache().read_at(sector, table.as_bytes_mut(), 0);
        table
    }

    fn write(&self, fs: &FileSystem, sector: u32) {
        fs.cache().write_at(sector, self.as_bytes(), 0);
    }
}

struct InodeState {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
    active_readers: u32,
    waiting_readers: u32,
    active_writers: u32,
    waiting_writers: u32,
}

/// In-memory bookkeeping for an open inode.
pub struct Inode {
    /// Sector of the on-disk inode; doubles as the inode's identity.
    sector: u32,
    state: Mutex<InodeState>,
    ok_to_read: Condvar,
    ok_to_write: Condvar,
}

impl Inode {
    fn new(sector: u32) -> Inode {
        Inode {
            sector,
            state: Mutex::new(InodeState {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                active_readers: 0,
                waiting_readers: 0,
                active_writers: 0,
                waiting_writers: 0,
            }),
            ok_to_read: Condvar::new(),
            ok_to_write: Condvar::new(),
        }
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Number of live references, including the caller's.
    pub fn open_count(&self) -> u32 {
        self.state.lock().unwrap().open_count
    }

    /// Waits until no writer is active or waiting, then joins the readers.
    pub fn begin_read(&self) -> ReadGuard<'_> {
        let mut st = self.state.lock().unwrap();
        st.waiting_readers += 1;
        while st.active_writers + st.waiting_writers > 0 {
            st = self.ok_to_read.wait(st).unwrap();
        }
        st.waiting_readers -= 1;
        st.active_readers += 1;
        ReadGuard { inode: self }
    }

    /// Waits until the inode is quiescent, then becomes the sole writer.
    pub fn begin_write(&self) -> WriteGuard<'_> {
        let mut st = self.state.lock().unwrap();
        st.waiting_writers += 1;
        while st.active_writers + st.active_readers > 0 {
            st = self.ok_to_write.wait(st).unwrap();
        }
        st.waiting_writers -= 1;
        st.active_writers += 1;
        debug_assert_eq!(st.active_writers, 1);
        WriteGuard { inode: self }
    }

    /// Latches the inode for deletion; deallocation happens at the last close.
    pub fn mark_removed(&self) {
        let _w = self.begin_write();
        self.state.lock().unwrap().removed = true;
    }

    /// Asserts the executable deny-write latch.
    pub fn deny_write(&self) {
        let _w = self.begin_write();
        let mut st = self.state.lock().unwrap();
        st.deny_write_count += 1;
        assert!(
            st.deny_write_count <= st.open_count,
            "inode {}: more deny-write latches than openers",
            self.sector
        );
    }

    /// Releases one deny-write latch.
    pub fn allow_write(&self) {
        let _w = self.begin_write();
        let mut st = self.state.lock().unwrap();
        assert!(st.deny_write_count > 0, "inode {}: not denied", self.sector);
        st.deny_write_count -= 1;
    }

    /// Reads this inode's on-disk copy through the cache.
    fn disk_inode(&self, fs: &FileSystem) -> Dinode {
        read_dinode(fs, self.sector)
    }

    pub fn kind(&self, fs: &FileSystem) -> InodeKind {
        match self.disk_inode(fs).kind {
            KIND_DIR => InodeKind::Dir,
            _ => InodeKind::File,
        }
    }

    /// Current file length in bytes.
    pub fn length(&self, fs: &FileSystem) -> u32 {
        self.disk_inode(fs).length
    }

    /// Maps a byte offset to the data sector holding it, or `None` past the
    /// end of the file.
    fn byte_to_sector(&self, fs: &FileSystem, off: u32) -> Option<u32> {
        let d = self.disk_inode(fs);
        if off >= d.length {
            return None;
        }
        let idx = off as usize / SECTOR_SIZE;
        let doubly = PtrBlock::read(fs, d.indirect);
        let indirect = PtrBlock::read(fs, doubly.ptrs[idx / NPTR]);
        Some(indirect.ptrs[idx % NPTR])
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read, short at end of file.
    pub fn read_at(&self, fs: &FileSystem, buf: &mut [u8], offset: u32) -> usize {
        let _r = self.begin_read();
        self.read_body(fs, buf, offset)
    }

    fn read_body(&self, fs: &FileSystem, buf: &mut [u8], offset: u32) -> usize {
        let mut read = 0;
        let mut off = offset;
        while read < buf.len() {
            let sector = match self.byte_to_sector(fs, off) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = off as usize % SECTOR_SIZE;
            let file_left = (self.length(fs) - off) as usize;
            let chunk = (buf.len() - read)
                .min(SECTOR_SIZE - sector_ofs)
                .min(file_left);
            if chunk == 0 {
                break;
            }
            fs.cache()
                .read_at(sector, &mut buf[read..read + chunk], sector_ofs);
            read += chunk;
            off += chunk as u32;
        }
        read
    }

    /// Writes `buf` starting at byte `offset`, growing the file if the range
    /// extends past the current length. Returns the number of bytes written:
    /// 0 when writes are denied or the grow cannot be satisfied.
    pub fn write_at(&self, fs: &FileSystem, buf: &[u8], offset: u32) -> usize {
        let end = match offset.checked_add(buf.len() as u32) {
            Some(end) => end,
            None => return 0,
        };

        // Writes inside the current length run under the reader discipline so
        // independent regions stream in parallel; only a grow excludes every
        // other reader and writer of this inode.
        {
            let _r = self.begin_read();
            if self.state.lock().unwrap().deny_write_count > 0 {
                return 0;
            }
            if end <= self.length(fs) {
                return self.write_body(fs, buf, offset);
            }
        }

        let _w = self.begin_write();
        // A competing writer may have grown the file past `end` while we
        // waited; resize must never shrink on this path.
        if end > self.length(fs) && resize(fs, self.sector, end).is_err() {
            return 0;
        }
        self.write_body(fs, buf, offset)
    }

    fn write_body(&self, fs: &FileSystem, buf: &[u8], offset: u32) -> usize {
        let mut written = 0;
        let mut off = offset;
        while written < buf.len() {
            let sector = match self.byte_to_sector(fs, off) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = off as usize % SECTOR_SIZE;
            let file_left = (self.length(fs) - off) as usize;
            let chunk = (buf.len() - written)
                .min(SECTOR_SIZE - sector_ofs)
                .min(file_left);
            if chunk == 0 {
                break;
            }
            fs.cache()
                .write_at(sector, &buf[written..written + chunk], sector_ofs);
            written += chunk;
            off += chunk as u32;
        }
        written
    }
}

fn read_dinode(fs: &FileSystem, sector: u32) -> Dinode {
    let mut d = Dinode::new_zeroed();
    fs.cache().read_at(sector, d.as_bytes_mut(), 0);
    assert_eq!(d.magic, INODE_MAGIC, "inode {}: bad magic", sector);
    d
}

fn write_dinode(fs: &FileSystem, sector: u32, d: &Dinode) {
    fs.cache().write_at(sector, d.as_bytes(), 0);
}

/// Allocates one sector and fills it with zeros through the cache.
fn allocate_zeroed(fs: &FileSystem) -> Result<u32> {
    let sector = fs
        .freemap()
        .lock()
        .unwrap()
        .allocate(1)
        .ok_or(FsError::NoSpace)?;
    fs.cache().zero(sector);
    Ok(sector)
}

fn release_sector(fs: &FileSystem, sector: u32) {
    fs.freemap().lock().unwrap().release(sector, 1);
}

/// Initializes a fresh on-disk inode at `sector` and grows it to `length`
/// bytes. On failure the partially grown contents have already been released;
/// the caller still owns (and must release) `sector` itself.
pub fn create(fs: &FileSystem, sector: u32, length: u32, kind: InodeKind) -> Result<()> {
    let mut d = Dinode::new_zeroed();
    d.magic = INODE_MAGIC;
    d.kind = match kind {
        InodeKind::File => KIND_FILE,
        InodeKind::Dir => KIND_DIR,
    };
    fs.cache().write_at(sector, d.as_bytes(), 0);
    if length > 0 {
        resize(fs, sector, length)?;
    }
    Ok(())
}

/// Grows or shrinks the file whose inode lives at `sector` to `new_length`
/// bytes, allocating zero-filled sectors and releasing trimmed ones so that
/// the sector map stays populated exactly up to `ceil(new_length / 512)`.
///
/// If allocation fails midway, everything acquired by this attempt is
/// released by shrinking back to the original length, and `NoSpace` is
/// returned.
pub(crate) fn resize(fs: &FileSystem, sector: u32, new_length: u32) -> Result<()> {
    if new_length > MAX_FILE_SIZE {
        return Err(FsError::NoSpace);
    }

    let mut d = read_dinode(fs, sector);
    let old_length = d.length;

    if d.indirect == 0 {
        if new_length == 0 {
            d.length = 0;
            write_dinode(fs, sector, &d);
            return Ok(());
        }
        d.indirect = allocate_zeroed(fs)?;
        // Committed now so a rollback pass sees the table.
        write_dinode(fs, sector, &d);
    }

    let mut doubly = PtrBlock::read(fs, d.indirect);
    for i in 0..NPTR {
        let base = (i * NPTR * SECTOR_SIZE) as u32;

        if new_length > base && doubly.ptrs[i] == 0 {
            match allocate_zeroed(fs) {
                Ok(s) => doubly.ptrs[i] = s,
                Err(e) => {
                    doubly.write(fs, d.indirect);
                    rollback(fs, sector, old_length);
                    return Err(e);
                }
            }
        }

        if doubly.ptrs[i] != 0 {
            let mut indirect = PtrBlock::read(fs, doubly.ptrs[i]);
            let mut touched = false;
            for j in 0..NPTR {
                let off = base + (j * SECTOR_SIZE) as u32;
                if new_length > off && indirect.ptrs[j] == 0 {
                    match allocate_zeroed(fs) {
                        Ok(s) => {
                            indirect.ptrs[j] = s;
                            touched = true;
                        }
                        Err(e) => {
                            indirect.write(fs, doubly.ptrs[i]);
                            doubly.write(fs, d.indirect);
                            rollback(fs, sector, old_length);
                            return Err(e);
                        }
                    }
                } else if new_length <= off && indirect.ptrs[j] != 0 {
                    release_sector(fs, indirect.ptrs[j]);
                    indirect.ptrs[j] = 0;
                    touched = true;
                }
            }
            if touched {
                indirect.write(fs, doubly.ptrs[i]);
            }
            if new_length <= base {
                release_sector(fs, doubly.ptrs[i]);
                doubly.ptrs[i] = 0;
            }
        }
    }
    doubly.write(fs, d.indirect);

    // A shrink trims whole sectors; the boundary sector survives with stale
    // bytes past the new length. Zero them now so a later regrow exposes
    // zeros, not resurrected data.
    if new_length < old_length && new_length % SECTOR_SIZE as u32 != 0 {
        let idx = new_length as usize / SECTOR_SIZE;
        let tail = new_length as usize % SECTOR_SIZE;
        let indirect = PtrBlock::read(fs, doubly.ptrs[idx / NPTR]);
        let zeros = [0u8; SECTOR_SIZE];
        fs.cache()
            .write_at(indirect.ptrs[idx % NPTR], &zeros[tail..], tail);
    }

    if new_length == 0 {
        release_sector(fs, d.indirect);
        d.indirect = 0;
    }
    d.length = new_length;
    write_dinode(fs, sector, &d);
    Ok(())
}

/// Releases every sector acquired by a failed grow attempt. A shrink never
/// allocates, so this cannot fail in turn.
fn rollback(fs: &FileSystem, sector: u32, old_length: u32) {
    debug!(
        "inode {}: grow failed, rolling back to {} bytes",
        sector, old_length
    );
    resize(fs, sector, old_length).expect("shrink never allocates");
}

/// The process-wide table of open inodes, keyed by inode sector.
pub struct Itable {
    list: Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub fn new() -> Itable {
        Itable {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Finds or creates the entry for `sector` and takes a reference to it.
    pub fn open(&self, sector: u32) -> Arc<Inode> {
        let mut list = self.list.lock().unwrap();
        if let Some(inode) = list.iter().find(|i| i.sector == sector) {
            let inode = Arc::clone(inode);
            inode.state.lock().unwrap().open_count += 1;
            return inode;
        }
        let inode = Arc::new(Inode::new(sector));
        list.push(Arc::clone(&inode));
        inode
    }

    /// Takes another reference to an already-open inode. Wrapped in the
    /// writer critical section because readers observe `open_count`.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _w = inode.begin_write();
        inode.state.lock().unwrap().open_count += 1;
        Arc::clone(inode)
    }

    /// Drops one reference. The last close removes the entry from the table;
    /// if the inode was marked removed its contents, its pointer tables and
    /// finally the inode sector itself are released.
    pub fn close(&self, fs: &FileSystem, inode: Arc<Inode>) {
        let deallocate = {
            let mut list = self.list.lock().unwrap();
            let mut st = inode.state.lock().unwrap();
            st.open_count -= 1;
            if st.open_count > 0 {
                false
            } else {
                let pos = list
                    .iter()
                    .position(|i| Arc::ptr_eq(i, &inode))
                    .expect("closing an inode that is not open");
                list.swap_remove(pos);
                st.removed
            }
        };
        // The entry has left the table, and the directory entry naming this
        // sector was cleared when the inode was marked removed, so nothing
        // can re-open it while we free its sectors.
        if deallocate {
            debug!("inode {}: freeing removed inode", inode.sector);
            resize(fs, inode.sector, 0).expect("shrink never allocates");
            release_sector(fs, inode.sector);
        }
    }

    #[cfg(test)]
    pub(crate) fn open_entries(&self) -> usize {
        self.list.lock().unwrap().len()
    }
}

/// Writer discipline check-out ticket.
pub struct WriteGuard<'a> {
    inode: &'a Inode,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let inode = self.inode;
        let mut st = inode.state.lock().unwrap();
        st.active_writers -= 1;
        // Hand off to the next writer first; the readers get a broadcast only
        // once no writer wants the inode.
        if st.waiting_writers > 0 {
            inode.ok_to_write.notify_one();
        } else if st.waiting_readers > 0 {
            inode.ok_to_read.notify_all();
        }
    }
}

/// Reader discipline check-out ticket.
pub struct ReadGuard<'a> {
    inode: &'a Inode,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let inode = self.inode;
        let mut st = inode.state.lock().unwrap();
        st.active_readers -= 1;
        if st.active_readers == 0 && st.waiting_writers > 0 {
            inode.ok_to_write.notify_one();
        }
    }
}

/// A counted reference to an open inode, bound to its filesystem. Dropping
/// the reference closes it; the last close of a removed inode deallocates it.
pub struct InodeRef {
    fs: FileSystem,
    inode: Option<Arc<Inode>>,
}

impl InodeRef {
    /// Opens the inode at `sector` through the open-inode table.
    pub(crate) fn open(fs: &FileSystem, sector: u32) -> InodeRef {
        let inode = fs.itable().open(sector);
        InodeRef {
            fs: fs.clone(),
            inode: Some(inode),
        }
    }

    pub(crate) fn fs(&self) -> &FileSystem {
        &self.fs
    }

    fn inode(&self) -> &Arc<Inode> {
        self.inode.as_ref().expect("inode reference already closed")
    }

    /// Takes an additional reference to the same inode.
    pub fn reopen(&self) -> InodeRef {
        let inode = self.fs.itable().reopen(self.inode());
        InodeRef {
            fs: self.fs.clone(),
            inode: Some(inode),
        }
    }

    pub fn sector(&self) -> u32 {
        self.inode().sector
    }

    pub fn open_count(&self) -> u32 {
        self.inode().open_count()
    }

    pub fn kind(&self) -> InodeKind {
        self.inode().kind(&self.fs)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == InodeKind::Dir
    }

    pub fn length(&self) -> u32 {
        self.inode().length(&self.fs)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        self.inode().read_at(&self.fs, buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        self.inode().write_at(&self.fs, buf, offset)
    }

    pub fn mark_removed(&self) {
        self.inode().mark_removed()
    }

    pub fn deny_write(&self) {
        self.inode().deny_write()
    }

    pub fn allow_write(&self) {
        self.inode().allow_write()
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        if let Some(inode) = self.inode.take() {
            self.fs.itable().close(&self.fs, inode);
        }
    }
}
