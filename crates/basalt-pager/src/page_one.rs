//! The validity-check page.
//!
//! Page 1 carries two 8-byte counter slots. Opening the database writes a
//! fresh random counter into the first slot and flushes; a clean close
//! mirrors it into the second. If the slots disagree at open time the
//! previous run never closed cleanly and recovery must run. The rest of
//! the page is unused.

use basalt_types::PAGE_SIZE;
use rand::RngCore;

use crate::page::Page;

const OF_COUNTER_A: usize = 0;
const OF_COUNTER_B: usize = 8;
const COUNTER_LEN: usize = 8;

/// Initial contents of page 1: a fresh counter in slot A, slot B zeroed,
/// so a crash before the first clean close is detected.
#[must_use]
pub fn init_raw() -> Vec<u8> {
    let mut raw = vec![0_u8; PAGE_SIZE];
    fill_counter(&mut raw[OF_COUNTER_A..OF_COUNTER_A + COUNTER_LEN]);
    raw
}

/// Stamp a fresh counter into slot A. Called on every open.
pub fn set_open(page: &Page) {
    page.with_data_mut(|buf| {
        fill_counter(&mut buf[OF_COUNTER_A..OF_COUNTER_A + COUNTER_LEN]);
    });
}

/// Mirror slot A into slot B. Called on clean close only.
pub fn set_close(page: &Page) {
    page.with_data_mut(|buf| {
        let (head, tail) = buf.split_at_mut(OF_COUNTER_B);
        tail[..COUNTER_LEN].copy_from_slice(&head[OF_COUNTER_A..OF_COUNTER_A + COUNTER_LEN]);
    });
}

/// Whether the previous close completed. `false` demands recovery.
#[must_use]
pub fn check(page: &Page) -> bool {
    page.with_data(|buf| {
        buf[OF_COUNTER_A..OF_COUNTER_A + COUNTER_LEN]
            == buf[OF_COUNTER_B..OF_COUNTER_B + COUNTER_LEN]
    })
}

fn fill_counter(slot: &mut [u8]) {
    rand::thread_rng().fill_bytes(slot);
}
