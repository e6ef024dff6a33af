//! Crash recovery.
//!
//! Runs when the validity page says the last close never finished. The
//! log is consumed in file order; committed transactions' records are
//! redone, and each uncommitted transaction's records — still active at
//! the crash or already aborted — are undone in reverse. Undoing an
//! insert does not reclaim the slot: it rewrites the item with its valid
//! byte set, which makes every future read of that uuid answer "not
//! found".
//!
//! Recovery is single-threaded and runs before the free-space index is
//! rebuilt, so it may use the pager's unsynchronized truncate.

use std::collections::HashMap;

use basalt_pager::{page_x, PageCache, PageHandle};
use basalt_txn::XidStore;
use basalt_types::PageNo;
use basalt_wal::Wal;
use tracing::info;

use crate::data_item::set_raw_invalid;
use crate::records::RedoRecord;

pub(crate) fn recover(pc: &PageCache, wal: &Wal, xids: &XidStore) {
    wal.rewind();
    let mut records = Vec::new();
    let mut max_page = PageNo::ONE;
    while let Some(data) = wal.next() {
        let record = RedoRecord::parse(&data);
        if record.page_no() > max_page {
            max_page = record.page_no();
        }
        records.push(record);
    }

    // Pages past the last one any record references were created but never
    // populated; drop them.
    if pc.page_count() > max_page.get() {
        pc.truncate(max_page);
    }

    let mut redone = 0_usize;
    for record in &records {
        if xids.is_committed(record.xid()) {
            redo(pc, record);
            redone += 1;
        }
    }

    // Everything not committed is undone: transactions still active at
    // the crash and transactions that had already aborted.
    let mut undo_queues: HashMap<u64, Vec<&RedoRecord>> = HashMap::new();
    for record in &records {
        if !xids.is_committed(record.xid()) {
            undo_queues
                .entry(record.xid().get())
                .or_default()
                .push(record);
        }
    }
    let mut undone = 0_usize;
    for queue in undo_queues.values() {
        for record in queue.iter().rev() {
            undo(pc, record);
            undone += 1;
        }
    }

    info!(
        records = records.len(),
        redone, undone, "recovery complete"
    );
}

fn load(pc: &PageCache, no: PageNo) -> PageHandle {
    pc.get_page(no)
        .unwrap_or_else(|err| panic!("recovery failed to load page {no}: {err}"))
}

fn redo(pc: &PageCache, record: &RedoRecord) {
    match record {
        RedoRecord::Insert {
            page_no,
            offset,
            raw,
            ..
        } => {
            let page = load(pc, *page_no);
            page_x::recover_insert(&page, *offset, raw);
        }
        RedoRecord::Update { uuid, new, .. } => {
            let page = load(pc, uuid.page_no());
            page_x::recover_update(&page, uuid.offset(), new);
        }
    }
}

fn undo(pc: &PageCache, record: &RedoRecord) {
    match record {
        RedoRecord::Insert {
            page_no,
            offset,
            raw,
            ..
        } => {
            // Keep the slot occupied but unreadable.
            let mut dead = raw.clone();
            set_raw_invalid(&mut dead);
            let page = load(pc, *page_no);
            page_x::recover_insert(&page, *offset, &dead);
        }
        RedoRecord::Update { uuid, old, .. } => {
            let page = load(pc, uuid.page_no());
            page_x::recover_update(&page, uuid.offset(), old);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::manager::DataManager;
    use basalt_txn::XidStore;
    use basalt_types::PAGE_SIZE;
    use std::path::PathBuf;

    const MEM: u64 = 64 * PAGE_SIZE as u64;

    fn base(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("t")
    }

    /// Dropping the manager without `close` leaves the validity counters
    /// mismatched, exactly like a killed process.
    #[test]
    fn test_committed_insert_is_redone() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let uuid = {
            let xids = XidStore::create(&path).unwrap();
            let dm = DataManager::create(&path, MEM).unwrap();
            let xid = xids.begin();
            let uuid = dm.insert(xid, b"hello").unwrap();
            xids.commit(xid);
            uuid // no close: crash
        };
        let xids = XidStore::open(&path).unwrap();
        let dm = DataManager::open(&path, MEM, &xids).unwrap();
        let item = dm.read(uuid).unwrap().expect("committed insert survives");
        assert_eq!(item.payload(), b"hello");
    }

    #[test]
    fn test_uncommitted_insert_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let uuid = {
            let xids = XidStore::create(&path).unwrap();
            let dm = DataManager::create(&path, MEM).unwrap();
            let xid = xids.begin();
            dm.insert(xid, b"ghost").unwrap() // crash with xid active
        };
        let xids = XidStore::open(&path).unwrap();
        let dm = DataManager::open(&path, MEM, &xids).unwrap();
        assert!(dm.read(uuid).unwrap().is_none());
    }

    #[test]
    fn test_aborted_insert_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let uuid = {
            let xids = XidStore::create(&path).unwrap();
            let dm = DataManager::create(&path, MEM).unwrap();
            let xid = xids.begin();
            let uuid = dm.insert(xid, b"ghost").unwrap();
            xids.abort(xid);
            uuid // crash with xid aborted, not active
        };
        let xids = XidStore::open(&path).unwrap();
        let dm = DataManager::open(&path, MEM, &xids).unwrap();
        assert!(dm.read(uuid).unwrap().is_none());
    }

    #[test]
    fn test_uncommitted_update_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let uuid = {
            let xids = XidStore::create(&path).unwrap();
            let dm = DataManager::create(&path, MEM).unwrap();
            let committer = xids.begin();
            let uuid = dm.insert(committer, b"base").unwrap();
            xids.commit(committer);

            let crasher = xids.begin();
            let item = dm.read(uuid).unwrap().unwrap();
            item.before();
            item.data_mut(|data| data.copy_from_slice(b"oops"));
            item.after(crasher);
            drop(item);
            uuid // crash with the update unfinished
        };
        let xids = XidStore::open(&path).unwrap();
        let dm = DataManager::open(&path, MEM, &xids).unwrap();
        let item = dm.read(uuid).unwrap().expect("base record survives");
        assert_eq!(item.payload(), b"base");
    }

    #[test]
    fn test_mixed_outcomes_replay_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let (kept, ghost) = {
            let xids = XidStore::create(&path).unwrap();
            let dm = DataManager::create(&path, MEM).unwrap();
            let good = xids.begin();
            let bad = xids.begin();
            let kept = dm.insert(good, b"kept").unwrap();
            let ghost = dm.insert(bad, b"ghost").unwrap();
            xids.commit(good);
            (kept, ghost)
        };
        let xids = XidStore::open(&path).unwrap();
        let dm = DataManager::open(&path, MEM, &xids).unwrap();
        assert_eq!(dm.read(kept).unwrap().unwrap().payload(), b"kept");
        assert!(dm.read(ghost).unwrap().is_none());
        // The store keeps working after recovery.
        let xid = xids.begin();
        let fresh = dm.insert(xid, b"fresh").unwrap();
        xids.commit(xid);
        assert_eq!(dm.read(fresh).unwrap().unwrap().payload(), b"fresh");
    }

    #[test]
    fn test_double_crash_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let uuid = {
            let xids = XidStore::create(&path).unwrap();
            let dm = DataManager::create(&path, MEM).unwrap();
            let xid = xids.begin();
            let uuid = dm.insert(xid, b"twice").unwrap();
            xids.commit(xid);
            uuid
        };
        // First recovery, then crash again without close.
        {
            let xids = XidStore::open(&path).unwrap();
            let dm = DataManager::open(&path, MEM, &xids).unwrap();
            assert_eq!(dm.read(uuid).unwrap().unwrap().payload(), b"twice");
        }
        let xids = XidStore::open(&path).unwrap();
        let dm = DataManager::open(&path, MEM, &xids).unwrap();
        assert_eq!(dm.read(uuid).unwrap().unwrap().payload(), b"twice");
    }
}
