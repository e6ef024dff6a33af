//! The in-memory page.
//!
//! A page is its 8 KiB byte buffer, a dirty flag, and a lock. The buffer
//! lock serializes raw byte access; higher-level write ordering (who may
//! mutate a given data item when) is the data-item protocol's job, not the
//! page's.

use std::sync::atomic::{AtomicBool, Ordering};

use basalt_types::{PageNo, PAGE_SIZE};
use parking_lot::Mutex;

pub struct Page {
    no: PageNo,
    buf: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

impl Page {
    pub(crate) fn new(no: PageNo, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            no,
            buf: Mutex::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn no(&self) -> PageNo {
        self.no
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Mark the page dirty. Mutators must do this *before* the first byte
    /// change so a partially applied update is never silently dropped by
    /// eviction.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Read the page bytes under the buffer lock.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let buf = self.buf.lock();
        f(&buf)
    }

    /// Mutate the page bytes under the buffer lock. Marks the page dirty
    /// before handing out the buffer.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.mark_dirty();
        let mut buf = self.buf.lock();
        f(&mut buf)
    }

    /// Copy of the full page contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}
