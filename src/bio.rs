//! Buffer cache.
//!
//! The buffer cache is an ordered list of slots holding cached copies of disk
//! sector contents. Caching sectors in memory reduces the number of device
//! transfers and also provides a synchronization point for sectors used by
//! multiple threads. The cache is write-back: a write dirties the slot and the
//! device is only touched again when the slot is evicted or the cache is
//! flushed.
//!
//! Interface:
//! * [`Bcache::read`] / [`Bcache::write`] move whole sectors; a full-sector
//!   write binds a slot without reading the device first.
//! * [`Bcache::read_at`] / [`Bcache::write_at`] move a byte range within one
//!   sector.
//! * [`Bcache::flush_all`] writes every dirty slot back to the device.
//!
//! Each slot carries its own mutex, held exactly for the duration of the copy
//! in or out of the slot; the cache mutex guards membership and recency order
//! only. Looking a sector up therefore takes two steps: find the slot under
//! the cache mutex, then lock the slot and confirm it is still bound to the
//! wanted sector. A slot can be rebound by an eviction between those two
//! steps, in which case the lookup simply retries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::disk::BlockDevice;
use crate::param::{NBUF, SECTOR_NONE, SECTOR_SIZE};

struct BufInner {
    dirty: bool,
    data: [u8; SECTOR_SIZE],
}

struct BufEntry {
    /// Sector this slot is bound to, or `SECTOR_NONE` while it is being
    /// rebound. Re-checked under `inner`'s mutex by every lookup.
    sector: AtomicU32,
    inner: Mutex<BufInner>,
}

impl BufEntry {
    fn new(sector: u32) -> BufEntry {
        BufEntry {
            sector: AtomicU32::new(sector),
            inner: Mutex::new(BufInner {
                dirty: false,
                data: [0; SECTOR_SIZE],
            }),
        }
    }
}

/// A bounded, associative cache of disk sectors with LRU replacement.
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    /// Recency-ordered slots, most recently used first. At most `NBUF` long,
    /// and never two slots bound to the same sector.
    shelf: Mutex<Vec<Arc<BufEntry>>>,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Bcache {
        Bcache {
            dev,
            shelf: Mutex::new(Vec::with_capacity(NBUF)),
        }
    }

    /// Runs `f` on the slot bound to `sector` while holding the slot's mutex.
    ///
    /// On a miss the slot is populated from the device first, unless
    /// `read_through` is false, in which case the caller promises that `f`
    /// overwrites all of `data`.
    fn with_slot<R>(&self, sector: u32, read_through: bool, f: impl FnOnce(&mut BufInner) -> R) -> R {
        loop {
            let mut shelf = self.shelf.lock().unwrap();

            if let Some(pos) = shelf
                .iter()
                .position(|e| e.sector.load(Ordering::Acquire) == sector)
            {
                let entry = shelf.remove(pos);
                shelf.insert(0, Arc::clone(&entry));
                drop(shelf);

                let mut inner = entry.inner.lock().unwrap();
                // The slot may have been rebound by an eviction between
                // releasing the cache mutex and locking the slot.
                if entry.sector.load(Ordering::Acquire) != sector {
                    continue;
                }
                return f(&mut inner);
            }

            if shelf.len() < NBUF {
                let entry = Arc::new(BufEntry::new(sector));
                let mut inner = entry.inner.lock().unwrap();
                shelf.insert(0, Arc::clone(&entry));
                drop(shelf);

                if read_through {
                    self.dev.read(sector, &mut inner.data);
                }
                return f(&mut inner);
            }

            // Evict the least recently used slot. Blocking here waits out
            // every holder of the slot's mutex. The write-back and the
            // rebinding happen before the cache mutex is released, so a miss
            // on the evicted sector can never read stale bytes from the
            // device.
            let entry = Arc::clone(shelf.last().unwrap());
            let mut inner = entry.inner.lock().unwrap();
            let old = entry.sector.swap(SECTOR_NONE, Ordering::AcqRel);
            if inner.dirty {
                self.dev.write(old, &inner.data);
                inner.dirty = false;
            }
            trace!("bcache: evict sector {} for {}", old, sector);
            let pos = shelf
                .iter()
                .position(|e| Arc::ptr_eq(e, &entry))
                .expect("evicted slot left the shelf");
            shelf.remove(pos);
            shelf.insert(0, Arc::clone(&entry));
            entry.sector.store(sector, Ordering::Release);
            drop(shelf);

            if read_through {
                self.dev.read(sector, &mut inner.data);
            }
            return f(&mut inner);
        }
    }

    /// Copies sector `sector` into `dst`.
    pub fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        self.read_at(sector, dst, 0);
    }

    /// Copies `dst.len()` bytes out of sector `sector`, starting `ofs` bytes
    /// into it.
    pub fn read_at(&self, sector: u32, dst: &mut [u8], ofs: usize) {
        assert!(ofs + dst.len() <= SECTOR_SIZE);
        self.with_slot(sector, true, |b| {
            dst.copy_from_slice(&b.data[ofs..ofs + dst.len()]);
        })
    }

    /// Replaces sector `sector` with `src`. The old contents are never read
    /// from the device.
    pub fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        self.with_slot(sector, false, |b| {
            b.data.copy_from_slice(src);
            b.dirty = true;
        })
    }

    /// Copies `src` into sector `sector` at byte offset `ofs`, reading the
    /// sector through first if it is not cached.
    pub fn write_at(&self, sector: u32, src: &[u8], ofs: usize) {
        assert!(ofs + src.len() <= SECTOR_SIZE);
        if ofs == 0 && src.len() == SECTOR_SIZE {
            self.with_slot(sector, false, |b| {
                b.data.copy_from_slice(src);
                b.dirty = true;
            })
        } else {
            self.with_slot(sector, true, |b| {
                b.data[ofs..ofs + src.len()].copy_from_slice(src);
                b.dirty = true;
            })
        }
    }

    /// Fills sector `sector` with zeros. The old contents are never read from
    /// the device.
    pub fn zero(&self, sector: u32) {
        self.with_slot(sector, false, |b| {
            b.data = [0; SECTOR_SIZE];
            b.dirty = true;
        })
    }

    /// Writes every dirty slot back to the device.
    pub fn flush_all(&self) {
        let shelf = self.shelf.lock().unwrap();
        for entry in shelf.iter() {
            let mut inner = entry.inner.lock().unwrap();
            if inner.dirty {
                self.dev.write(entry.sector.load(Ordering::Acquire), &inner.data);
                inner.dirty = false;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shelf.lock().unwrap().len()
    }

    #[cfg(test)]
    fn dirty_count(&self) -> usize {
        let shelf = self.shelf.lock().unwrap();
        shelf
            .iter()
            .filter(|e| e.inner.lock().unwrap().dirty)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::disk::RamDisk;

    /// A RamDisk that counts device transfers.
    struct CountingDisk {
        inner: RamDisk,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl CountingDisk {
        fn new(sector_count: u32) -> CountingDisk {
            CountingDisk {
                inner: RamDisk::new(sector_count),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl BlockDevice for CountingDisk {
        fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(sector, buf);
        }

        fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(sector, buf);
        }

        fn sector_count(&self) -> u32 {
            self.inner.sector_count()
        }
    }

    fn cache_over_counting_disk(sector_count: u32) -> (Bcache, Arc<CountingDisk>) {
        let disk = Arc::new(CountingDisk::new(sector_count));
        (Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>), disk)
    }

    #[test]
    fn hit_does_not_touch_device() {
        let (cache, disk) = cache_over_counting_disk(16);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(5, &mut buf);
        cache.read(5, &mut buf);
        cache.read(5, &mut buf);
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_sector_write_skips_preread() {
        let (cache, disk) = cache_over_counting_disk(16);
        cache.write(3, &[7u8; SECTOR_SIZE]);
        assert_eq!(disk.reads.load(Ordering::SeqCst), 0);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(3, &mut buf);
        assert!(buf.iter().all(|&b| b == 7));
        // Still served from the cache.
        assert_eq!(disk.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn partial_write_reads_through() {
        let (cache, disk) = cache_over_counting_disk(16);
        cache.write_at(3, &[9u8; 4], 100);
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let (cache, _disk) = cache_over_counting_disk(256);
        let mut buf = [0u8; SECTOR_SIZE];
        for sector in 0..200 {
            cache.read(sector, &mut buf);
        }
        assert_eq!(cache.len(), NBUF);
    }

    #[test]
    fn lru_eviction_writes_back_dirty_exactly_once() {
        let (cache, disk) = cache_over_counting_disk(256);
        cache.write(0, &[0xe1u8; SECTOR_SIZE]);
        // Touch NBUF other sectors; sector 0 becomes the LRU tail and must be
        // evicted and written back.
        let mut buf = [0u8; SECTOR_SIZE];
        for sector in 1..=NBUF as u32 {
            cache.read(sector, &mut buf);
        }
        assert_eq!(disk.writes.load(Ordering::SeqCst), 1);
        // The written-back contents are what a fresh read observes.
        cache.read(0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0xe1));
    }

    #[test]
    fn recently_used_survives_eviction() {
        let (cache, disk) = cache_over_counting_disk(256);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(0, &mut buf);
        // Keep sector 0 hot while streaming enough sectors to evict everything
        // else.
        for sector in 1..NBUF as u32 {
            cache.read(sector, &mut buf);
            cache.read(0, &mut buf);
        }
        cache.read(NBUF as u32, &mut buf);
        let before = disk.reads.load(Ordering::SeqCst);
        cache.read(0, &mut buf);
        assert_eq!(disk.reads.load(Ordering::SeqCst), before);
    }

    #[test]
    fn flush_all_clears_dirty() {
        let (cache, disk) = cache_over_counting_disk(16);
        for sector in 0..8 {
            cache.write(sector, &[sector as u8; SECTOR_SIZE]);
        }
        cache.flush_all();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(disk.writes.load(Ordering::SeqCst), 8);
        // A second flush has nothing left to do.
        cache.flush_all();
        assert_eq!(disk.writes.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn concurrent_writers_do_not_lose_sectors() {
        let disk = Arc::new(RamDisk::new(512));
        let cache = Arc::new(Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>));

        let mut handles = Vec::new();
        for t in 0..8u32 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                // Each thread owns a disjoint set of sectors, wide enough that
                // the threads together keep the cache evicting.
                for round in 0..20u32 {
                    for k in 0..16u32 {
                        let sector = t * 16 + k;
                        let fill = (t as u8) ^ (k as u8) ^ (round as u8);
                        cache.write(sector, &[fill; SECTOR_SIZE]);
                        let mut buf = [0u8; SECTOR_SIZE];
                        cache.read(sector, &mut buf);
                        assert!(buf.iter().all(|&b| b == fill));
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        cache.flush_all();
        // Final round leaves fill = t ^ k ^ 19 on the device.
        for t in 0..8u32 {
            for k in 0..16u32 {
                let mut buf = [0u8; SECTOR_SIZE];
                disk.read(t * 16 + k, &mut buf);
                assert!(buf.iter().all(|&b| b == (t as u8) ^ (k as u8) ^ 19));
            }
        }
    }
}
