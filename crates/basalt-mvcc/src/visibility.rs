//! Visibility predicates.
//!
//! An entry `e` is judged against a transaction `t` using the xid store's
//! committed verdicts. Read-committed sees any committed creation that has
//! no committed deletion; repeatable-read additionally requires the
//! creator to be strictly older than `t` and outside its snapshot, and
//! forgives deletions only when they come from the future or from inside
//! the snapshot.

use basalt_txn::XidStore;

use crate::entry::Entry;
use crate::transaction::{IsolationLevel, Transaction};

/// Whether `entry` is visible to `txn`.
#[must_use]
pub fn is_visible(xids: &XidStore, txn: &Transaction, entry: &Entry) -> bool {
    match txn.level() {
        IsolationLevel::ReadCommitted => read_committed(xids, txn, entry),
        IsolationLevel::RepeatableRead => repeatable_read(xids, txn, entry),
    }
}

/// Version-skip test, evaluated before a delete is authorized: true when
/// a committed deletion exists that `txn` cannot see, so deleting on top
/// of it would serialize `txn` after a write it never observed.
#[must_use]
pub fn is_version_skip(xids: &XidStore, txn: &Transaction, entry: &Entry) -> bool {
    if txn.level() == IsolationLevel::ReadCommitted {
        return false;
    }
    let xmax = entry.xmax();
    xids.is_committed(xmax) && (xmax > txn.id() || txn.in_snapshot(xmax))
}

fn read_committed(xids: &XidStore, txn: &Transaction, entry: &Entry) -> bool {
    let xid = txn.id();
    let xmin = entry.xmin();
    let xmax = entry.xmax();

    // Own undeleted write.
    if xmin == xid && xmax.get() == 0 {
        return true;
    }
    if xids.is_committed(xmin) {
        if xmax.get() == 0 {
            return true;
        }
        // Deleted, but by someone else whose delete has not committed.
        if xmax != xid && !xids.is_committed(xmax) {
            return true;
        }
    }
    false
}

fn repeatable_read(xids: &XidStore, txn: &Transaction, entry: &Entry) -> bool {
    let xid = txn.id();
    let xmin = entry.xmin();
    let xmax = entry.xmax();

    if xmin == xid && xmax.get() == 0 {
        return true;
    }
    // The creator must have committed before we began.
    if xids.is_committed(xmin) && xmin < xid && !txn.in_snapshot(xmin) {
        if xmax.get() == 0 {
            return true;
        }
        if xmax != xid {
            // A deletion we cannot see does not hide the entry: either it
            // never committed, or it comes from our future, or from a
            // transaction that was still active when we began.
            if !xids.is_committed(xmax) || xmax > xid || txn.in_snapshot(xmax) {
                return true;
            }
        }
    }
    false
}
