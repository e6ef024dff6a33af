//! basalt: a small transactional page-store engine.
//!
//! [`Database`] wires the layers over one `<base>` path family — the page
//! file (`.db`), the write-ahead log (`.log`), and the transaction state
//! store (`.xid`) — and exposes the transactional API: begin, insert,
//! read, delete, commit, abort. B+tree indexes are built directly on the
//! data manager via [`BPlusTree`].
//!
//! A [`Database::close`] flushes everything and marks the shutdown clean;
//! dropping without closing behaves like a crash, and the next open
//! replays the log.

use std::path::Path;
use std::sync::Arc;

use basalt_data::DataManager;
use basalt_mvcc::VersionManager;
use basalt_txn::XidStore;
use tracing::info;

pub use basalt_btree::BPlusTree;
pub use basalt_error::{BasaltError, Result};
pub use basalt_mvcc::IsolationLevel;
pub use basalt_types::{PageNo, TxnId, Uuid, PAGE_SIZE};

/// One open engine instance. A given `<base>` must be held by at most one
/// process at a time; concurrent openers are undefined behavior.
pub struct Database {
    dm: Arc<DataManager>,
    vm: VersionManager,
}

impl Database {
    /// Create a fresh database at `base`. `cache_bytes` is the page-cache
    /// budget.
    pub fn create(base: &Path, cache_bytes: u64) -> Result<Self> {
        let xids = Arc::new(XidStore::create(base)?);
        let dm = Arc::new(DataManager::create(base, cache_bytes)?);
        let vm = VersionManager::new(xids, Arc::clone(&dm));
        info!(base = %base.display(), "database created");
        Ok(Self { dm, vm })
    }

    /// Open an existing database, running crash recovery if needed.
    pub fn open(base: &Path, cache_bytes: u64) -> Result<Self> {
        let xids = Arc::new(XidStore::open(base)?);
        let dm = Arc::new(DataManager::open(base, cache_bytes, &xids)?);
        let vm = VersionManager::new(xids, Arc::clone(&dm));
        info!(base = %base.display(), "database opened");
        Ok(Self { dm, vm })
    }

    /// Start a transaction.
    pub fn begin(&self, level: IsolationLevel) -> TxnId {
        self.vm.begin(level)
    }

    /// Insert a record owned by `xid`; returns its handle.
    pub fn insert(&self, xid: TxnId, data: &[u8]) -> Result<Uuid> {
        self.vm.insert(xid, data)
    }

    /// Read the record at `uuid` as `xid` sees it.
    pub fn read(&self, xid: TxnId, uuid: Uuid) -> Result<Option<Vec<u8>>> {
        self.vm.read(xid, uuid)
    }

    /// Delete the record at `uuid`; serializable via the lock table.
    pub fn delete(&self, xid: TxnId, uuid: Uuid) -> Result<bool> {
        self.vm.delete(xid, uuid)
    }

    pub fn commit(&self, xid: TxnId) -> Result<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: TxnId) {
        self.vm.abort(xid);
    }

    /// The underlying data manager, for building indexes.
    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.dm
    }

    /// Flush all state and mark the close clean. Every handle taken from
    /// this database must be dropped first.
    pub fn close(self) {
        self.vm.close();
        self.dm.close();
        info!("database closed");
    }
}
