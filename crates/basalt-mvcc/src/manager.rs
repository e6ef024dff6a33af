//! The version manager: the transactional API over the data layer.
//!
//! Ties together the xid store, the data manager, an entry cache, the
//! runtime transaction table, and the lock table. Serialization failures
//! (deadlock, version skip) auto-abort the offending transaction but keep
//! its runtime entry so every later call reports the same sticky error;
//! the client's eventual `abort` clears it without touching the xid store
//! a second time.

use std::ops::Deref;
use std::sync::Arc;

use basalt_cache::{RefCache, Source};
use basalt_data::DataManager;
use basalt_error::{BasaltError, Result};
use basalt_txn::XidStore;
use basalt_types::{TxnId, Uuid};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{wrap_entry, Entry};
use crate::lock_table::{LockAttempt, LockTable};
use crate::transaction::{IsolationLevel, Transaction};
use crate::visibility;

struct EntrySource {
    dm: Arc<DataManager>,
}

impl Source for EntrySource {
    type Key = Uuid;
    type Handle = Arc<Entry>;

    fn load(&self, uuid: Uuid) -> Result<Arc<Entry>> {
        match self.dm.read(uuid)? {
            Some(item) => Ok(Arc::new(Entry::new(uuid, item))),
            // The item was invalidated by recovery; there is no entry.
            None => Err(BasaltError::NilEntry),
        }
    }

    fn reclaim(&self, _uuid: Uuid, _entry: Arc<Entry>) {
        // Dropping the entry releases its data item.
    }
}

struct EntryHandle {
    entry: Arc<Entry>,
    cache: Arc<RefCache<EntrySource>>,
}

impl Deref for EntryHandle {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        self.cache.release(self.entry.uuid());
    }
}

type TxnHandle = Arc<Mutex<Transaction>>;

/// Transactional reads, inserts, and serializable deletes.
pub struct VersionManager {
    xids: Arc<XidStore>,
    dm: Arc<DataManager>,
    entries: Arc<RefCache<EntrySource>>,
    active: Mutex<HashMap<TxnId, TxnHandle>>,
    locks: LockTable,
}

impl VersionManager {
    pub fn new(xids: Arc<XidStore>, dm: Arc<DataManager>) -> Self {
        let entries = Arc::new(RefCache::new(EntrySource { dm: Arc::clone(&dm) }, 0));
        let mut active = HashMap::new();
        // The super transaction is always runnable: structural reads and
        // writes need no begin.
        active.insert(
            TxnId::SUPER,
            Arc::new(Mutex::new(Transaction::new(
                TxnId::SUPER,
                IsolationLevel::ReadCommitted,
                std::iter::empty(),
            ))),
        );
        Self {
            xids,
            dm,
            entries,
            active: Mutex::new(active),
            locks: LockTable::new(),
        }
    }

    /// Start a transaction at the given isolation level.
    pub fn begin(&self, level: IsolationLevel) -> TxnId {
        // Snapshot and registration happen under one lock so the snapshot
        // is exactly the set of transactions active at begin time.
        let mut active = self.active.lock();
        let xid = self.xids.begin();
        let txn = Transaction::new(xid, level, active.keys().filter(|id| !id.is_super()));
        active.insert(xid, Arc::new(Mutex::new(txn)));
        debug!(%xid, ?level, "transaction started");
        xid
    }

    /// Insert `data` as a new entry owned by `xid`.
    pub fn insert(&self, xid: TxnId, data: &[u8]) -> Result<Uuid> {
        let txn = self.txn(xid);
        txn.lock().check()?;
        let raw = wrap_entry(xid, data);
        self.dm.insert(xid, &raw)
    }

    /// Read the entry at `uuid` as seen by `xid`. `Ok(None)` when the
    /// entry does not exist for this transaction.
    pub fn read(&self, xid: TxnId, uuid: Uuid) -> Result<Option<Vec<u8>>> {
        let txn = self.txn(xid);
        txn.lock().check()?;
        let Some(entry) = self.fetch_entry(uuid)? else {
            return Ok(None);
        };
        let visible = {
            let txn = txn.lock();
            visibility::is_visible(&self.xids, &txn, &entry)
        };
        if visible {
            Ok(Some(entry.user_data()))
        } else {
            Ok(None)
        }
    }

    /// Delete the entry at `uuid`. `Ok(false)` when there is nothing
    /// visible to delete; `Err(CannotSerialize)` on deadlock or version
    /// skip, after auto-aborting `xid`.
    pub fn delete(&self, xid: TxnId, uuid: Uuid) -> Result<bool> {
        let txn = self.txn(xid);
        txn.lock().check()?;
        let Some(entry) = self.fetch_entry(uuid)? else {
            return Ok(false);
        };
        {
            let txn = txn.lock();
            if !visibility::is_visible(&self.xids, &txn, &entry) {
                return Ok(false);
            }
        }

        match self.locks.acquire(xid, uuid) {
            LockAttempt::Granted => {}
            LockAttempt::Wait(wakeup) => {
                // Park until the holder releases. A closed channel means
                // we were cancelled; the rechecks below stay correct.
                let _ = wakeup.recv();
            }
            LockAttempt::Deadlock => {
                warn!(%xid, %uuid, "deadlock, auto-aborting");
                self.auto_abort(xid, &txn);
                return Err(BasaltError::CannotSerialize);
            }
        }

        // Someone may have finished the same delete while we waited.
        if entry.xmax() == xid {
            return Ok(false);
        }
        let skipped = {
            let txn = txn.lock();
            visibility::is_version_skip(&self.xids, &txn, &entry)
        };
        if skipped {
            warn!(%xid, %uuid, "version skip, auto-aborting");
            self.auto_abort(xid, &txn);
            return Err(BasaltError::CannotSerialize);
        }

        entry.set_xmax(xid);
        Ok(true)
    }

    /// Commit `xid`. Fails while the sticky serialization error is set.
    pub fn commit(&self, xid: TxnId) -> Result<()> {
        let txn = self.txn(xid);
        txn.lock().check()?;
        self.active.lock().remove(&xid);
        self.locks.release_all(xid);
        self.xids.commit(xid);
        Ok(())
    }

    /// Abort `xid`. After an auto-abort this only clears the runtime.
    pub fn abort(&self, xid: TxnId) {
        let Some(txn) = self.active.lock().remove(&xid) else {
            return; // already gone
        };
        self.locks.release_all(xid);
        if txn.lock().is_auto_aborted() {
            // The xid store was already updated when the failure hit.
            info!(%xid, "abort acknowledged after auto-abort");
        } else {
            self.xids.abort(xid);
        }
    }

    /// Drop cached entries. The data manager is closed by its owner.
    pub fn close(&self) {
        self.entries.close();
    }

    fn txn(&self, xid: TxnId) -> TxnHandle {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .unwrap_or_else(|| panic!("operation on unknown transaction {xid}"))
    }

    fn fetch_entry(&self, uuid: Uuid) -> Result<Option<EntryHandle>> {
        match self.entries.get(uuid) {
            Ok(entry) => Ok(Some(EntryHandle {
                entry,
                cache: Arc::clone(&self.entries),
            })),
            Err(BasaltError::NilEntry) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Mark the sticky failure, free the locks, and record the abort.
    fn auto_abort(&self, xid: TxnId, txn: &TxnHandle) {
        txn.lock().fail();
        self.locks.release_all(xid);
        self.xids.abort(xid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::PAGE_SIZE;
    use std::path::PathBuf;

    const MEM: u64 = 64 * PAGE_SIZE as u64;

    fn base(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("t")
    }

    fn manager(dir: &tempfile::TempDir) -> VersionManager {
        let base = base(dir);
        let xids = Arc::new(XidStore::create(&base).unwrap());
        let dm = Arc::new(DataManager::create(&base, MEM).unwrap());
        VersionManager::new(xids, dm)
    }

    #[test]
    fn test_own_insert_is_visible_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let xid = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(xid, b"mine").unwrap();
        assert_eq!(vm.read(xid, uuid).unwrap(), Some(b"mine".to_vec()));
        vm.commit(xid).unwrap();
    }

    #[test]
    fn test_uncommitted_write_is_invisible_to_others() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let reader = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"pending").unwrap();
        assert_eq!(vm.read(reader, uuid).unwrap(), None);
        vm.commit(writer).unwrap();
        assert_eq!(vm.read(reader, uuid).unwrap(), Some(b"pending".to_vec()));
    }

    #[test]
    fn test_repeatable_read_ignores_later_commits() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let early = vm.begin(IsolationLevel::RepeatableRead);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"late").unwrap();
        vm.commit(writer).unwrap();
        // Began before the write existed: never sees it.
        assert_eq!(vm.read(early, uuid).unwrap(), None);
        // A transaction begun after the commit does.
        let fresh = vm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(vm.read(fresh, uuid).unwrap(), Some(b"late".to_vec()));
    }

    #[test]
    fn test_repeatable_read_keeps_seeing_deleted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"doomed").unwrap();
        vm.commit(writer).unwrap();

        let reader = vm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(vm.read(reader, uuid).unwrap(), Some(b"doomed".to_vec()));

        let deleter = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(deleter, uuid).unwrap());
        vm.commit(deleter).unwrap();

        // The snapshot still contains the entry; a fresh reader does not.
        assert_eq!(vm.read(reader, uuid).unwrap(), Some(b"doomed".to_vec()));
        let fresh = vm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(vm.read(fresh, uuid).unwrap(), None);
    }

    #[test]
    fn test_delete_returns_false_without_a_visible_entry() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"hidden").unwrap();
        // Unknown-to-us entry: not visible to a stranger.
        let stranger = vm.begin(IsolationLevel::ReadCommitted);
        assert!(!vm.delete(stranger, uuid).unwrap());
        vm.commit(writer).unwrap();
    }

    #[test]
    fn test_double_delete_by_same_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"once").unwrap();
        vm.commit(writer).unwrap();
        let deleter = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(deleter, uuid).unwrap());
        assert!(!vm.delete(deleter, uuid).unwrap());
        vm.commit(deleter).unwrap();
    }

    #[test]
    fn test_own_delete_hides_the_entry_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"short lived").unwrap();
        vm.commit(writer).unwrap();
        let deleter = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(deleter, uuid).unwrap());
        // Uncommitted to everyone else, but gone for the deleter itself.
        assert_eq!(vm.read(deleter, uuid).unwrap(), None);
        let other = vm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(vm.read(other, uuid).unwrap(), Some(b"short lived".to_vec()));
        vm.commit(deleter).unwrap();
        assert_eq!(vm.read(other, uuid).unwrap(), None);
    }

    #[test]
    fn test_version_skip_auto_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"target").unwrap();
        vm.commit(writer).unwrap();

        let victim = vm.begin(IsolationLevel::RepeatableRead);
        // Somebody else deletes and commits after the snapshot.
        let racer = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(racer, uuid).unwrap());
        vm.commit(racer).unwrap();

        assert!(matches!(
            vm.delete(victim, uuid),
            Err(BasaltError::CannotSerialize)
        ));
        // The failure is sticky for every later operation.
        assert!(matches!(
            vm.read(victim, uuid),
            Err(BasaltError::CannotSerialize)
        ));
        assert!(matches!(
            vm.commit(victim),
            Err(BasaltError::CannotSerialize)
        ));
        // Manual abort acknowledges and clears the runtime.
        vm.abort(victim);
    }

    #[test]
    fn test_super_transaction_reads_without_begin() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"keep").unwrap();
        vm.commit(writer).unwrap();
        assert_eq!(vm.read(TxnId::SUPER, uuid).unwrap(), Some(b"keep".to_vec()));
    }

    #[test]
    fn test_aborted_write_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let vm = manager(&dir);
        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uuid = vm.insert(writer, b"undone").unwrap();
        vm.abort(writer);
        let reader = vm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(vm.read(reader, uuid).unwrap(), None);
    }

    #[test]
    fn test_deadlock_between_two_deleters() {
        let dir = tempfile::tempdir().unwrap();
        let vm = Arc::new(manager(&dir));
        let setup = vm.begin(IsolationLevel::ReadCommitted);
        let a = vm.insert(setup, b"a").unwrap();
        let b = vm.insert(setup, b"b").unwrap();
        vm.commit(setup).unwrap();

        let t1 = vm.begin(IsolationLevel::ReadCommitted);
        let t2 = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(t1, a).unwrap());
        assert!(vm.delete(t2, b).unwrap());

        // t1 goes after b on another thread; it blocks on t2's lock.
        let cross = {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || vm.delete(t1, b))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        // t2 going after a closes the cycle: exactly this call fails.
        let result = vm.delete(t2, a);
        assert!(matches!(result, Err(BasaltError::CannotSerialize)));
        // t2's auto-abort released b, so t1's blocked delete completes.
        assert_eq!(cross.join().unwrap().unwrap(), true);
        vm.commit(t1).unwrap();
        vm.abort(t2);
    }
}
