//! The page cache proper.
//!
//! Built on [`RefCache`]: the loader does a positional read of one page
//! from `<base>.db`, the finalizer flushes the page back if it is dirty.
//! `new_page` deliberately returns a page *number* rather than a handle —
//! the freshly written page exists on disk either way, and a cache-full
//! condition at that moment would otherwise strand it.

use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use basalt_cache::{RefCache, Source};
use basalt_error::Result;
use basalt_types::{PageNo, PAGE_SIZE};
use parking_lot::Mutex;
use tracing::debug;

/// File suffix of the page file.
pub const DB_SUFFIX: &str = ".db";

/// Fewest pages a cache is allowed to hold.
const MIN_CACHE_PAGES: u64 = 10;

use crate::page::Page;

fn db_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(DB_SUFFIX);
    PathBuf::from(path)
}

/// Shared file state: the page file and the page count.
struct PageStore {
    file: Mutex<File>,
    pages: AtomicU32,
}

impl PageStore {
    fn read_page(&self, no: PageNo) -> Vec<u8> {
        let mut buf = vec![0_u8; PAGE_SIZE];
        let file = self.file.lock();
        file.read_exact_at(&mut buf, no.file_offset())
            .unwrap_or_else(|err| panic!("page {no} read failed: {err}"));
        buf
    }

    fn write_page(&self, no: PageNo, data: &[u8]) {
        let file = self.file.lock();
        file.write_all_at(data, no.file_offset())
            .unwrap_or_else(|err| panic!("page {no} write failed: {err}"));
        file.sync_all()
            .unwrap_or_else(|err| panic!("page file sync failed: {err}"));
    }
}

struct PageSource {
    store: Arc<PageStore>,
}

impl Source for PageSource {
    type Key = PageNo;
    type Handle = Arc<Page>;

    fn load(&self, no: PageNo) -> Result<Arc<Page>> {
        Ok(Arc::new(Page::new(no, self.store.read_page(no))))
    }

    fn reclaim(&self, no: PageNo, page: Arc<Page>) {
        if page.is_dirty() {
            self.store.write_page(no, &page.snapshot());
            page.clear_dirty();
        }
    }
}

/// A checked-out page; returns itself to the cache on drop.
pub struct PageHandle {
    page: Arc<Page>,
    cache: Arc<RefCache<PageSource>>,
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.cache.release(self.page.no());
    }
}

/// Reference-counted cache of fixed-size pages over `<base>.db`.
pub struct PageCache {
    store: Arc<PageStore>,
    cache: Arc<RefCache<PageSource>>,
}

impl PageCache {
    /// Create a fresh page file. `mem` is the cache budget in bytes.
    pub fn create(base: &Path, mem: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(db_path(base))?;
        Ok(Self::build(file, mem, 0))
    }

    /// Open an existing page file; the page count is derived from its size.
    pub fn open(base: &Path, mem: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(db_path(base))?;
        let len = file.metadata()?.len();
        let pages = (len / PAGE_SIZE as u64) as u32;
        Ok(Self::build(file, mem, pages))
    }

    fn build(file: File, mem: u64, pages: u32) -> Self {
        let cap = mem / PAGE_SIZE as u64;
        assert!(
            cap >= MIN_CACHE_PAGES,
            "page cache memory budget below {MIN_CACHE_PAGES} pages"
        );
        let store = Arc::new(PageStore {
            file: Mutex::new(file),
            pages: AtomicU32::new(pages),
        });
        let cache = Arc::new(RefCache::new(
            PageSource {
                store: Arc::clone(&store),
            },
            cap as u32,
        ));
        Self { store, cache }
    }

    /// Allocate a new page with `init` as its contents. The page is written
    /// and synced immediately so the slot exists on disk; it is *not*
    /// brought into the cache.
    pub fn new_page(&self, init: &[u8]) -> PageNo {
        debug_assert_eq!(init.len(), PAGE_SIZE);
        let no = PageNo::new(self.store.pages.fetch_add(1, Ordering::SeqCst) + 1);
        self.store.write_page(no, init);
        no
    }

    /// Check a page out of the cache.
    pub fn get_page(&self, no: PageNo) -> Result<PageHandle> {
        let page = self.cache.get(no)?;
        Ok(PageHandle {
            page,
            cache: Arc::clone(&self.cache),
        })
    }

    /// Write a page to disk now, regardless of reference counts.
    pub fn flush_page(&self, page: &Page) {
        self.store.write_page(page.no(), &page.snapshot());
        page.clear_dirty();
    }

    /// Shrink the file to `max_page_no` pages. Recovery only; assumes no
    /// concurrent access.
    pub fn truncate(&self, max_page_no: PageNo) {
        let len = u64::from(max_page_no.get()) * PAGE_SIZE as u64;
        let file = self.store.file.lock();
        file.set_len(len)
            .unwrap_or_else(|err| panic!("page file truncate failed: {err}"));
        drop(file);
        self.store.pages.store(max_page_no.get(), Ordering::SeqCst);
        debug!(pages = max_page_no.get(), "page file truncated");
    }

    /// Number of pages in the file.
    pub fn page_count(&self) -> u32 {
        self.store.pages.load(Ordering::SeqCst)
    }

    /// Flush every resident page and drop the cache contents. The caller
    /// must have released all page handles.
    pub fn close(&self) {
        self.cache.close();
    }
}
