//! The data manager: inserts, reads, and lifecycle over one `<base>`.
//!
//! Owns the page cache, the log, the free-space index, and a refcount
//! cache of materialized data items. Open runs crash recovery when the
//! validity page says the previous close never finished.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use basalt_cache::{RefCache, Source};
use basalt_error::{BasaltError, Result};
use basalt_pager::{page_one, page_x, PageCache, PageHandle};
use basalt_txn::XidStore;
use basalt_types::{PageNo, TxnId, Uuid};
use basalt_wal::Wal;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::data_item::{wrap, DataItem, MAX_PAYLOAD};
use crate::free_space::FreeSpaceIndex;
use crate::records::RedoRecord;
use crate::recovery;

/// How many times an insert retries target selection before giving up.
const INSERT_ATTEMPTS: usize = 5;

struct ItemSource {
    pc: Arc<PageCache>,
    wal: Arc<Wal>,
}

impl Source for ItemSource {
    type Key = Uuid;
    type Handle = Arc<DataItem>;

    fn load(&self, uuid: Uuid) -> Result<Arc<DataItem>> {
        let page = self.pc.get_page(uuid.page_no())?;
        Ok(Arc::new(DataItem::load(page, uuid, Arc::clone(&self.wal))))
    }

    fn reclaim(&self, _uuid: Uuid, _item: Arc<DataItem>) {
        // Dropping the item releases its page, which flushes if dirty.
    }
}

/// A checked-out data item; returns itself to the item cache on drop.
pub struct ItemHandle {
    item: Arc<DataItem>,
    cache: Arc<RefCache<ItemSource>>,
}

impl Deref for ItemHandle {
    type Target = DataItem;

    fn deref(&self) -> &DataItem {
        &self.item
    }
}

impl Drop for ItemHandle {
    fn drop(&mut self) {
        self.cache.release(self.item.uuid());
    }
}

/// Data-item storage over the `<base>.db` / `<base>.log` pair.
pub struct DataManager {
    pc: Arc<PageCache>,
    wal: Arc<Wal>,
    free: FreeSpaceIndex,
    items: Arc<RefCache<ItemSource>>,
    page_one: Mutex<Option<PageHandle>>,
}

impl DataManager {
    /// Create a fresh database. `mem` is the page-cache budget in bytes.
    pub fn create(base: &Path, mem: u64) -> Result<Self> {
        let pc = Arc::new(PageCache::create(base, mem)?);
        let wal = Arc::new(Wal::create(base)?);
        let one = pc.new_page(&page_one::init_raw());
        debug_assert_eq!(one, PageNo::ONE);
        let dm = Self::build(pc, wal);
        dm.pin_page_one()?;
        Ok(dm)
    }

    /// Open an existing database, replaying the log first if the previous
    /// run crashed.
    pub fn open(base: &Path, mem: u64, xids: &XidStore) -> Result<Self> {
        let pc = Arc::new(PageCache::open(base, mem)?);
        let wal = Arc::new(Wal::open(base)?);
        {
            let one = pc.get_page(PageNo::ONE)?;
            if !page_one::check(&one) {
                info!("validity check failed, running recovery");
                recovery::recover(&pc, &wal, xids);
            }
        }
        let dm = Self::build(pc, wal);
        dm.rebuild_free_index()?;
        dm.pin_page_one()?;
        Ok(dm)
    }

    fn build(pc: Arc<PageCache>, wal: Arc<Wal>) -> Self {
        let items = Arc::new(RefCache::new(
            ItemSource {
                pc: Arc::clone(&pc),
                wal: Arc::clone(&wal),
            },
            0,
        ));
        Self {
            pc,
            wal,
            free: FreeSpaceIndex::new(),
            items,
            page_one: Mutex::new(None),
        }
    }

    /// Check page 1 out for the lifetime of the manager and stamp the
    /// open-state counter, so a crash from here on is detectable.
    fn pin_page_one(&self) -> Result<()> {
        let one = self.pc.get_page(PageNo::ONE)?;
        page_one::set_open(&one);
        self.pc.flush_page(&one);
        *self.page_one.lock() = Some(one);
        Ok(())
    }

    fn rebuild_free_index(&self) -> Result<()> {
        for no in 2..=self.pc.page_count() {
            let page = self.pc.get_page(PageNo::new(no))?;
            self.free.add(page.no(), page_x::free_space(&page));
        }
        debug!(pages = self.pc.page_count(), "free-space index rebuilt");
        Ok(())
    }

    /// Fetch the item `uuid` addresses. `None` when the item was
    /// invalidated by recovery.
    pub fn read(&self, uuid: Uuid) -> Result<Option<ItemHandle>> {
        let item = self.items.get(uuid)?;
        let handle = ItemHandle {
            item,
            cache: Arc::clone(&self.items),
        };
        if handle.is_valid() {
            Ok(Some(handle))
        } else {
            Ok(None)
        }
    }

    /// Insert `data` as a new item on behalf of `xid`; the redo record is
    /// durable in the log before the page is touched.
    pub fn insert(&self, xid: TxnId, data: &[u8]) -> Result<Uuid> {
        if data.len() > MAX_PAYLOAD {
            return Err(BasaltError::DataTooLarge { len: data.len() });
        }
        let raw = wrap(data);

        for _ in 0..INSERT_ATTEMPTS {
            let Some((no, free)) = self.free.select(raw.len()) else {
                // Nothing fits: grow the file and try again. Another
                // inserter may claim the fresh page first; the retry
                // budget absorbs it.
                let no = self.pc.new_page(&page_x::init_raw());
                self.free.add(no, page_x::max_free_space());
                continue;
            };
            let page = match self.pc.get_page(no) {
                Ok(page) => page,
                Err(err) => {
                    // Give the slot back before surfacing the failure.
                    self.free.add(no, free);
                    return Err(err);
                }
            };
            // The overflow class can under-deliver for near-page-size
            // items; verify before writing.
            if page_x::free_space(&page) < raw.len() {
                self.free.add(no, page_x::free_space(&page));
                continue;
            }
            let offset = page_x::fso(&page);
            let record = RedoRecord::Insert {
                xid,
                page_no: no,
                offset,
                raw: raw.clone(),
            };
            self.wal.append(&record.encode());
            let placed = page_x::insert(&page, &raw);
            debug_assert_eq!(placed, offset);
            self.free.add(no, page_x::free_space(&page));
            return Ok(Uuid::from_parts(no, placed));
        }
        Err(BasaltError::Busy)
    }

    /// Flush everything and mark the close clean. All item and page
    /// handles must have been dropped first.
    pub fn close(&self) {
        self.items.close();
        if let Some(one) = self.page_one.lock().take() {
            page_one::set_close(&one);
            self.pc.flush_page(&one);
        }
        self.pc.close();
        info!("data manager closed");
    }
}
