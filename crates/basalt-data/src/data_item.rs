//! Data items and the update protocol.
//!
//! An item occupies `[valid: 1][size: 2][payload: size]` inside a page.
//! The valid byte is `0` for live items; recovery sets it to `1` when the
//! owning transaction never committed, which makes the item read as
//! absent forever after.
//!
//! Mutation protocol, in order, on one thread:
//!
//! 1. [`DataItem::before`] — take the item's exclusive lock, mark the
//!    hosting page dirty, snapshot the current frame.
//! 2. mutate in place through [`DataItem::data_mut`].
//! 3. exactly one of [`DataItem::after`] (log the update, release the
//!    lock) or [`DataItem::un_before`] (restore the snapshot, release the
//!    lock, log nothing).
//!
//! The log record is appended while the exclusive lock is still held, so
//! no reader can observe the new bytes before they are durable in the log.

use basalt_pager::{page_x, PageHandle};
use basalt_types::{codec, Offset, TxnId, Uuid, PAGE_SIZE};
use basalt_wal::Wal;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::records::RedoRecord;

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
const OF_PAYLOAD: usize = 3;

/// Largest payload that fits a framed item in an otherwise empty page.
pub const MAX_PAYLOAD: usize = PAGE_SIZE - page_x::OF_DATA as usize - OF_PAYLOAD;

/// Frame a payload as a live item.
#[must_use]
pub fn wrap(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_PAYLOAD);
    let mut raw = vec![0_u8; OF_PAYLOAD + data.len()];
    codec::put_u16(&mut raw[OF_SIZE..], data.len() as u16);
    raw[OF_PAYLOAD..].copy_from_slice(data);
    raw
}

/// Payload view of a framed item.
#[must_use]
pub fn raw_payload(raw: &[u8]) -> &[u8] {
    let size = codec::read_u16(&raw[OF_SIZE..]) as usize;
    &raw[OF_PAYLOAD..OF_PAYLOAD + size]
}

/// Mark a frame invalid. Recovery only.
pub(crate) fn set_raw_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = 1;
}

// ---------------------------------------------------------------------------
// Item lock
// ---------------------------------------------------------------------------

/// Reader/writer lock that can be held across calls (the before→after
/// window is not a lexical scope, so guard types don't fit).
struct ItemLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

impl ItemLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock_shared(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    fn unlock_shared(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = true;
    }

    fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.cond.notify_all();
    }

    fn writer_held(&self) -> bool {
        self.state.lock().writer
    }
}

// ---------------------------------------------------------------------------
// DataItem
// ---------------------------------------------------------------------------

/// One record inside a page, addressed by its composed [`Uuid`].
pub struct DataItem {
    uuid: Uuid,
    page: PageHandle,
    offset: Offset,
    /// Framed length: header plus payload.
    len: usize,
    /// Snapshot taken by `before`, restored by `un_before`.
    old_raw: Mutex<Vec<u8>>,
    lock: ItemLock,
    wal: Arc<Wal>,
}

impl DataItem {
    /// Materialize the item `uuid` addresses from its (already checked
    /// out) page.
    pub(crate) fn load(page: PageHandle, uuid: Uuid, wal: Arc<Wal>) -> Self {
        let offset = uuid.offset();
        let size = page.with_data(|buf| codec::read_u16(&buf[offset as usize + OF_SIZE..]));
        let len = OF_PAYLOAD + size as usize;
        Self {
            uuid,
            page,
            offset,
            len,
            old_raw: Mutex::new(vec![0_u8; len]),
            lock: ItemLock::new(),
            wal,
        }
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether the item is live (never invalidated by recovery).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.frame(|raw| raw[OF_VALID] == 0)
    }

    /// Read the payload under the shared lock.
    pub fn data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.lock.lock_shared();
        let result = self.frame(|raw| f(raw_payload(raw)));
        self.lock.unlock_shared();
        result
    }

    /// Copy of the payload.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        self.data(<[u8]>::to_vec)
    }

    /// Open the update window: exclusive lock, dirty page, snapshot.
    pub fn before(&self) {
        self.lock.lock_exclusive();
        self.page.mark_dirty();
        let snapshot = self.frame(<[u8]>::to_vec);
        *self.old_raw.lock() = snapshot;
    }

    /// Abandon the update: restore the snapshot, release the lock. No log
    /// record is written.
    pub fn un_before(&self) {
        debug_assert!(self.lock.writer_held());
        let old = self.old_raw.lock().clone();
        self.frame_mut(|raw| raw.copy_from_slice(&old));
        self.lock.unlock_exclusive();
    }

    /// Commit the update window: log the old/new frames as a redo record,
    /// then release the lock. The append syncs, so the record is durable
    /// before any reader can see the new bytes.
    pub fn after(&self, xid: TxnId) {
        debug_assert!(self.lock.writer_held());
        let new = self.frame(<[u8]>::to_vec);
        let old = self.old_raw.lock().clone();
        let record = RedoRecord::Update {
            xid,
            uuid: self.uuid,
            old,
            new,
        };
        self.wal.append(&record.encode());
        self.lock.unlock_exclusive();
    }

    /// Mutate the payload in place. Only legal inside a `before`/`after`
    /// window.
    pub fn data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(self.lock.writer_held(), "data_mut outside before/after");
        self.frame_mut(|raw| f(&mut raw[OF_PAYLOAD..]))
    }

    fn frame<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let start = self.offset as usize;
        self.page.with_data(|buf| f(&buf[start..start + self.len]))
    }

    fn frame_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let start = self.offset as usize;
        self.page
            .with_data_mut(|buf| f(&mut buf[start..start + self.len]))
    }
}
