use crate::bitmap::AllocMap;
use crate::error::{Error, Result};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::Path;

pub const PAGE_SIZE: usize = 64 * 1024;

pub type PageId = u64;

pub const INVALID_PAGE_ID: PageId = !0;

/// Backing storage addressed in fixed-size pages.
///
/// Chunks occupy contiguous page runs. Reads and writes always move
/// whole pages; callers own the page-sized buffers.
pub trait PageStore: Send + Sync {
    /// Allocate count consecutive pages, returns first page id.
    fn allocate_pages(&self, count: u64) -> Result<PageId>;

    /// Mark count consecutive pages as allocated.
    /// Used to rebuild the free map when loading persisted chunks.
    fn restore_pages(&self, start: PageId, count: u64) -> Result<()>;

    /// Return count consecutive pages to the free pool.
    fn free_pages(&self, start: PageId, count: u64);

    /// Copy one page into buf, which must be PAGE_SIZE long.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Overwrite one page with data, which must be PAGE_SIZE long.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Number of pages currently allocated.
    fn allocated_pages(&self) -> u64;

    /// Total pages the store can currently address.
    fn num_pages(&self) -> u64;

    /// Persist outstanding writes.
    fn flush(&self) -> Result<()>;
}

/// Page store backed by an in-memory arena. Used in tests and for
/// transient databases.
pub struct MemPageStore {
    data: RwLock<Vec<u8>>,
    alloc_map: AllocMap,
    max_pages: u64,
}

impl MemPageStore {
    #[inline]
    pub fn new(init_pages: u64, max_pages: u64) -> Self {
        debug_assert!(init_pages <= max_pages);
        MemPageStore {
            data: RwLock::new(vec![0u8; init_pages as usize * PAGE_SIZE]),
            alloc_map: AllocMap::new(init_pages as usize),
            max_pages,
        }
    }

    fn grow(&self, new_len: u64) {
        let mut g = self.data.write();
        if g.len() < new_len as usize * PAGE_SIZE {
            g.resize(new_len as usize * PAGE_SIZE, 0);
        }
        self.alloc_map.grow(new_len as usize);
    }
}

impl PageStore for MemPageStore {
    #[inline]
    fn allocate_pages(&self, count: u64) -> Result<PageId> {
        debug_assert!(count > 0);
        loop {
            if let Some(start) = self.alloc_map.try_allocate_run(count as usize) {
                return Ok(start as PageId);
            }
            let cur = self.alloc_map.len() as u64;
            if cur >= self.max_pages {
                return Err(Error::PageStoreExhausted);
            }
            let new_len = (cur + count).max(cur * 2).min(self.max_pages);
            self.grow(new_len);
        }
    }

    #[inline]
    fn restore_pages(&self, start: PageId, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let needed = start + count;
        if needed > self.max_pages {
            return Err(Error::PageStoreExhausted);
        }
        if needed > self.alloc_map.len() as u64 {
            self.grow(needed);
        }
        if self.alloc_map.allocate_run_at(start as usize, count as usize) {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    #[inline]
    fn free_pages(&self, start: PageId, count: u64) {
        self.alloc_map.deallocate_run(start as usize, count as usize);
    }

    #[inline]
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() == PAGE_SIZE);
        let g = self.data.read();
        let offset = page_id as usize * PAGE_SIZE;
        if offset + PAGE_SIZE > g.len() {
            return Err(Error::IndexOutOfBound);
        }
        buf.copy_from_slice(&g[offset..offset + PAGE_SIZE]);
        Ok(())
    }

    #[inline]
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() == PAGE_SIZE);
        let mut g = self.data.write();
        let offset = page_id as usize * PAGE_SIZE;
        if offset + PAGE_SIZE > g.len() {
            return Err(Error::IndexOutOfBound);
        }
        g[offset..offset + PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }

    #[inline]
    fn allocated_pages(&self) -> u64 {
        self.alloc_map.allocated() as u64
    }

    #[inline]
    fn num_pages(&self) -> u64 {
        self.alloc_map.len() as u64
    }

    #[inline]
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Page store backed by a single memory-mapped file.
///
/// The file grows by doubling up to max_pages and is remapped after
/// each growth. Durability requires an explicit flush.
pub struct FilePageStore {
    file: File,
    mmap: RwLock<MmapMut>,
    alloc_map: AllocMap,
    max_pages: u64,
}

impl FilePageStore {
    /// Create a new file, truncating any existing content.
    pub fn create<P: AsRef<Path>>(path: P, init_pages: u64, max_pages: u64) -> Result<Self> {
        debug_assert!(init_pages > 0 && init_pages <= max_pages);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(init_pages * PAGE_SIZE as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(FilePageStore {
            file,
            mmap: RwLock::new(mmap),
            alloc_map: AllocMap::new(init_pages as usize),
            max_pages,
        })
    }

    /// Open an existing file. The caller rebuilds the allocation map
    /// by restoring the page ranges of loaded chunks.
    pub fn open<P: AsRef<Path>>(path: P, max_pages: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len == 0 || len % PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidFormat);
        }
        let cur_pages = len / PAGE_SIZE as u64;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(FilePageStore {
            file,
            mmap: RwLock::new(mmap),
            alloc_map: AllocMap::new(cur_pages as usize),
            max_pages: max_pages.max(cur_pages),
        })
    }

    fn grow(&self, new_len: u64) -> Result<()> {
        let mut g = self.mmap.write();
        let mapped_pages = (g.len() / PAGE_SIZE) as u64;
        if mapped_pages < new_len {
            self.file.set_len(new_len * PAGE_SIZE as u64)?;
            *g = unsafe { MmapMut::map_mut(&self.file)? };
            log::debug!("page store file grows to {} pages", new_len);
        }
        self.alloc_map.grow(new_len as usize);
        Ok(())
    }
}

impl PageStore for FilePageStore {
    #[inline]
    fn allocate_pages(&self, count: u64) -> Result<PageId> {
        debug_assert!(count > 0);
        loop {
            if let Some(start) = self.alloc_map.try_allocate_run(count as usize) {
                return Ok(start as PageId);
            }
            let cur = self.alloc_map.len() as u64;
            if cur >= self.max_pages {
                return Err(Error::PageStoreExhausted);
            }
            let new_len = (cur + count).max(cur * 2).min(self.max_pages);
            self.grow(new_len)?;
        }
    }

    #[inline]
    fn restore_pages(&self, start: PageId, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let needed = start + count;
        if needed > self.max_pages {
            return Err(Error::PageStoreExhausted);
        }
        if needed > self.alloc_map.len() as u64 {
            self.grow(needed)?;
        }
        if self.alloc_map.allocate_run_at(start as usize, count as usize) {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    #[inline]
    fn free_pages(&self, start: PageId, count: u64) {
        self.alloc_map.deallocate_run(start as usize, count as usize);
    }

    #[inline]
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() == PAGE_SIZE);
        let g = self.mmap.read();
        let offset = page_id as usize * PAGE_SIZE;
        if offset + PAGE_SIZE > g.len() {
            return Err(Error::IndexOutOfBound);
        }
        buf.copy_from_slice(&g[offset..offset + PAGE_SIZE]);
        Ok(())
    }

    #[inline]
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() == PAGE_SIZE);
        let mut g = self.mmap.write();
        let offset = page_id as usize * PAGE_SIZE;
        if offset + PAGE_SIZE > g.len() {
            return Err(Error::IndexOutOfBound);
        }
        g[offset..offset + PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }

    #[inline]
    fn allocated_pages(&self) -> u64 {
        self.alloc_map.allocated() as u64
    }

    #[inline]
    fn num_pages(&self) -> u64 {
        self.alloc_map.len() as u64
    }

    #[inline]
    fn flush(&self) -> Result<()> {
        self.mmap.read().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_filled(b: u8) -> Vec<u8> {
        vec![b; PAGE_SIZE]
    }

    #[test]
    fn test_mem_page_store_rw() {
        let store = MemPageStore::new(4, 16);
        let id = store.allocate_pages(2).unwrap();
        store.write_page(id, &page_filled(0xAB)).unwrap();
        store.write_page(id + 1, &page_filled(0xCD)).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(id, &mut buf).unwrap();
        assert_eq!(buf[100], 0xAB);
        store.read_page(id + 1, &mut buf).unwrap();
        assert_eq!(buf[100], 0xCD);
        assert_eq!(store.allocated_pages(), 2);
        store.free_pages(id, 2);
        assert_eq!(store.allocated_pages(), 0);
    }

    #[test]
    fn test_mem_page_store_grow() {
        let store = MemPageStore::new(2, 64);
        let a = store.allocate_pages(2).unwrap();
        // exceeds initial capacity, store doubles.
        let b = store.allocate_pages(8).unwrap();
        assert_ne!(a, b);
        assert!(store.num_pages() >= 10);
        store.write_page(b + 7, &page_filled(1)).unwrap();
    }

    #[test]
    fn test_mem_page_store_exhausted() {
        let store = MemPageStore::new(2, 4);
        assert!(store.allocate_pages(4).is_ok());
        assert!(matches!(
            store.allocate_pages(1),
            Err(Error::PageStoreExhausted)
        ));
    }

    #[test]
    fn test_mem_page_store_restore() {
        let store = MemPageStore::new(8, 16);
        store.restore_pages(4, 3).unwrap();
        assert_eq!(store.allocated_pages(), 3);
        // overlap with restored range is rejected.
        assert!(store.restore_pages(5, 2).is_err());
        // fresh allocation avoids the restored range.
        let id = store.allocate_pages(4).unwrap();
        assert!(id + 4 <= 4 || id >= 7);
    }

    #[test]
    fn test_file_page_store_rw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.kdb");
        let store = FilePageStore::create(&path, 2, 32).unwrap();
        let id = store.allocate_pages(3).unwrap();
        store.write_page(id, &page_filled(0x11)).unwrap();
        store.write_page(id + 2, &page_filled(0x22)).unwrap();
        store.flush().unwrap();
        drop(store);

        let store = FilePageStore::open(&path, 32).unwrap();
        store.restore_pages(id, 3).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(id, &mut buf).unwrap();
        assert_eq!(buf[0], 0x11);
        store.read_page(id + 2, &mut buf).unwrap();
        assert_eq!(buf[0], 0x22);
        assert_eq!(store.allocated_pages(), 3);
    }

    #[test]
    fn test_file_page_store_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.kdb");
        let store = FilePageStore::create(&path, 1, 64).unwrap();
        let id = store.allocate_pages(10).unwrap();
        store.write_page(id + 9, &page_filled(9)).unwrap();
        assert!(store.num_pages() >= 11);
        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(id + 9, &mut buf).unwrap();
        assert_eq!(buf[0], 9);
    }
}
