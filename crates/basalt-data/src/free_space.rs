//! Free-space bucketing for insert target selection.
//!
//! Pages are classed into 40 buckets of `PAGE_SIZE / 40` bytes of free
//! space each, plus an overflow slot for a completely empty page. `select`
//! removes the chosen page from the index — the inserter owns its free
//! space until it re-adds the page — so the recorded free space is a
//! guarantee, not a hint. The index is in-memory only and rebuilt from the
//! page file on every open.

use std::collections::VecDeque;

use basalt_types::{PageNo, PAGE_SIZE};
use parking_lot::Mutex;

const INTERVALS: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<VecDeque<(PageNo, usize)>>>,
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![VecDeque::new(); INTERVALS + 1]),
        }
    }

    /// Record that `page_no` has `free_space` bytes available.
    pub fn add(&self, page_no: PageNo, free_space: usize) {
        let bucket = (free_space / THRESHOLD).min(INTERVALS);
        self.buckets.lock()[bucket].push_back((page_no, free_space));
    }

    /// Pick a page whose class covers `required` bytes, removing it from
    /// the index. `None` means the caller should create a new page. The
    /// scan starts at the class whose floor is at least `required`; only
    /// the capped overflow class can under-deliver, and the inserter
    /// re-checks the page before writing.
    pub fn select(&self, required: usize) -> Option<(PageNo, usize)> {
        let mut bucket = required.div_ceil(THRESHOLD).min(INTERVALS);
        let mut buckets = self.buckets.lock();
        while bucket <= INTERVALS {
            if let Some(pair) = buckets[bucket].pop_front() {
                return Some(pair);
            }
            bucket += 1;
        }
        None
    }
}
