//! Slotted layout of ordinary pages.
//!
//! ```text
//! [free-space offset: 2 bytes LE] [payload ...]
//! ```
//!
//! The FSO points at the first unused byte; new records are appended there.
//! The two `recover_*` entry points bypass the normal append path and are
//! only called by crash recovery, which replays log records at their
//! original offsets.

use basalt_types::{codec, Offset, PAGE_SIZE};

use crate::page::Page;

const OF_FSO: usize = 0;
/// First payload byte; also the FSO of an empty page.
pub const OF_DATA: Offset = 2;

/// Initial contents of an ordinary page.
#[must_use]
pub fn init_raw() -> Vec<u8> {
    let mut raw = vec![0_u8; PAGE_SIZE];
    set_raw_fso(&mut raw, OF_DATA);
    raw
}

/// Largest payload an empty page can hold.
#[must_use]
pub const fn max_free_space() -> usize {
    PAGE_SIZE - OF_DATA as usize
}

#[must_use]
pub fn raw_fso(raw: &[u8]) -> Offset {
    codec::read_u16(&raw[OF_FSO..])
}

pub fn set_raw_fso(raw: &mut [u8], fso: Offset) {
    codec::put_u16(&mut raw[OF_FSO..], fso);
}

/// Current free-space offset of a page.
#[must_use]
pub fn fso(page: &Page) -> Offset {
    page.with_data(raw_fso)
}

/// Remaining free bytes of a page.
#[must_use]
pub fn free_space(page: &Page) -> usize {
    PAGE_SIZE - fso(page) as usize
}

/// Append `raw` at the page's FSO and advance it. Returns the offset the
/// record landed at. The caller has verified the record fits.
pub fn insert(page: &Page, raw: &[u8]) -> Offset {
    page.with_data_mut(|buf| {
        let offset = raw_fso(buf);
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        set_raw_fso(buf, offset + raw.len() as Offset);
        offset
    })
}

/// Recovery: write `raw` at `offset` without touching the FSO.
pub fn recover_update(page: &Page, offset: Offset, raw: &[u8]) {
    page.with_data_mut(|buf| {
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
    });
}

/// Recovery: write `raw` at `offset` and raise the FSO to cover it. The
/// max keeps replay correct whatever order inserts are redone in.
pub fn recover_insert(page: &Page, offset: Offset, raw: &[u8]) {
    page.with_data_mut(|buf| {
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as Offset;
        if end > raw_fso(buf) {
            set_raw_fso(buf, end);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::PageNo;

    fn page() -> Page {
        Page::new(PageNo::new(2), init_raw())
    }

    #[test]
    fn test_empty_page_free_space() {
        let pg = page();
        assert_eq!(fso(&pg), OF_DATA);
        assert_eq!(free_space(&pg), max_free_space());
    }

    #[test]
    fn test_insert_advances_fso() {
        let pg = page();
        let first = insert(&pg, b"abcd");
        let second = insert(&pg, b"efgh");
        assert_eq!(first, OF_DATA);
        assert_eq!(second, OF_DATA + 4);
        assert_eq!(fso(&pg), OF_DATA + 8);
        pg.with_data(|buf| {
            assert_eq!(&buf[first as usize..first as usize + 4], b"abcd");
            assert_eq!(&buf[second as usize..second as usize + 4], b"efgh");
        });
    }

    #[test]
    fn test_recover_insert_raises_fso_monotonically() {
        let pg = page();
        recover_insert(&pg, 100, b"xyz");
        assert_eq!(fso(&pg), 103);
        // Replaying an earlier insert must not lower the FSO.
        recover_insert(&pg, 10, b"ab");
        assert_eq!(fso(&pg), 103);
    }

    #[test]
    fn test_recover_update_leaves_fso() {
        let pg = page();
        insert(&pg, b"abcd");
        let before = fso(&pg);
        recover_update(&pg, OF_DATA, b"ZZZZ");
        assert_eq!(fso(&pg), before);
        pg.with_data(|buf| assert_eq!(&buf[OF_DATA as usize..OF_DATA as usize + 4], b"ZZZZ"));
    }
}
