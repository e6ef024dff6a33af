//! Transaction state store.
//!
//! Every transaction id ever issued has a one-byte state cell in
//! `<base>.xid`:
//!
//! ```text
//! [highest issued id: 8 bytes LE] [state cell: 1 byte] * id count
//! ```
//!
//! The cell for id `x` lives at byte `8 + (x - 1)`. States are `0` active,
//! `1` committed, `2` aborted. Every state-changing write is followed by a
//! sync so the cells are trustworthy at recovery time. The super
//! transaction (id 0) has no cell: it reports committed without touching
//! the file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use basalt_error::{BasaltError, Result};
use basalt_types::codec;
use basalt_types::TxnId;
use parking_lot::Mutex;
use tracing::{debug, info};

/// File suffix of the transaction state store.
pub const XID_SUFFIX: &str = ".xid";

const HEADER_LEN: u64 = 8;

const STATE_ACTIVE: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ABORTED: u8 = 2;

fn xid_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(XID_SUFFIX);
    PathBuf::from(path)
}

fn cell_position(xid: TxnId) -> u64 {
    HEADER_LEN + (xid.get() - 1)
}

/// Persistent per-transaction state, with monotonically issued ids.
pub struct XidStore {
    file: File,
    counter: Mutex<u64>,
}

impl XidStore {
    /// Create a fresh store at `<base>.xid`, truncating any existing file.
    pub fn create(base: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(xid_path(base))?;
        let mut header = [0_u8; HEADER_LEN as usize];
        codec::put_u64(&mut header, 0);
        file.write_all_at(&header, 0)?;
        file.sync_all()?;
        Ok(Self {
            file,
            counter: Mutex::new(0),
        })
    }

    /// Open an existing store, verifying the header against the file size.
    pub fn open(base: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(xid_path(base))?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(BasaltError::BadXidFile);
        }
        let mut header = [0_u8; HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)?;
        let counter = codec::read_u64(&header);
        // The header uniquely determines the cell count.
        if len != HEADER_LEN + counter {
            return Err(BasaltError::BadXidFile);
        }
        debug!(issued = counter, "xid store opened");
        Ok(Self {
            file,
            counter: Mutex::new(counter),
        })
    }

    /// Mint the next transaction id, recording it as active.
    pub fn begin(&self) -> TxnId {
        let mut counter = self.counter.lock();
        let xid = TxnId::new(*counter + 1);
        self.write_state(xid, STATE_ACTIVE);
        *counter += 1;
        let mut header = [0_u8; HEADER_LEN as usize];
        codec::put_u64(&mut header, *counter);
        self.file
            .write_all_at(&header, 0)
            .unwrap_or_else(|err| panic!("xid header write failed: {err}"));
        self.file
            .sync_all()
            .unwrap_or_else(|err| panic!("xid file sync failed: {err}"));
        xid
    }

    pub fn commit(&self, xid: TxnId) {
        debug_assert!(!xid.is_super(), "the super transaction has no cell");
        info!(%xid, "commit");
        self.write_state(xid, STATE_COMMITTED);
    }

    pub fn abort(&self, xid: TxnId) {
        debug_assert!(!xid.is_super(), "the super transaction has no cell");
        info!(%xid, "abort");
        self.write_state(xid, STATE_ABORTED);
    }

    pub fn is_active(&self, xid: TxnId) -> bool {
        !xid.is_super() && self.read_state(xid) == STATE_ACTIVE
    }

    pub fn is_committed(&self, xid: TxnId) -> bool {
        // The super transaction is committed by definition.
        xid.is_super() || self.read_state(xid) == STATE_COMMITTED
    }

    pub fn is_aborted(&self, xid: TxnId) -> bool {
        !xid.is_super() && self.read_state(xid) == STATE_ABORTED
    }

    fn write_state(&self, xid: TxnId, state: u8) {
        self.file
            .write_all_at(&[state], cell_position(xid))
            .unwrap_or_else(|err| panic!("xid state write failed for {xid}: {err}"));
        self.file
            .sync_all()
            .unwrap_or_else(|err| panic!("xid file sync failed: {err}"));
    }

    fn read_state(&self, xid: TxnId) -> u8 {
        let mut cell = [0_u8; 1];
        self.file
            .read_exact_at(&mut cell, cell_position(xid))
            .unwrap_or_else(|err| panic!("xid state read failed for {xid}: {err}"));
        cell[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("t")
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = XidStore::create(&base(&dir)).unwrap();
        assert_eq!(store.begin(), TxnId::new(1));
        assert_eq!(store.begin(), TxnId::new(2));
        assert_eq!(store.begin(), TxnId::new(3));
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = XidStore::create(&base(&dir)).unwrap();
        let a = store.begin();
        let b = store.begin();
        assert!(store.is_active(a));
        store.commit(a);
        assert!(store.is_committed(a));
        assert!(!store.is_active(a));
        store.abort(b);
        assert!(store.is_aborted(b));
        assert!(!store.is_committed(b));
    }

    #[test]
    fn test_super_is_always_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = XidStore::create(&base(&dir)).unwrap();
        assert!(store.is_committed(TxnId::SUPER));
        assert!(!store.is_active(TxnId::SUPER));
        assert!(!store.is_aborted(TxnId::SUPER));
    }

    #[test]
    fn test_states_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let (a, b) = {
            let store = XidStore::create(&path).unwrap();
            let a = store.begin();
            let b = store.begin();
            store.commit(a);
            (a, b)
        };
        let store = XidStore::open(&path).unwrap();
        assert!(store.is_committed(a));
        assert!(store.is_active(b));
        assert_eq!(store.begin(), TxnId::new(3));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        {
            let store = XidStore::create(&path).unwrap();
            store.begin();
            store.begin();
        }
        // Chop off the last state cell; the header now disagrees.
        let file = OpenOptions::new()
            .write(true)
            .open(xid_path(&path))
            .unwrap();
        file.set_len(HEADER_LEN + 1).unwrap();
        drop(file);
        assert!(matches!(
            XidStore::open(&path),
            Err(BasaltError::BadXidFile)
        ));
    }

    #[test]
    fn test_short_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = base(&dir);
        let mut file = File::create(xid_path(&path)).unwrap();
        file.write_all(&[0_u8; 3]).unwrap();
        drop(file);
        assert!(matches!(
            XidStore::open(&path),
            Err(BasaltError::BadXidFile)
        ));
    }
}
