//! Wait-for-graph lock table with deadlock detection.
//!
//! Deletes must hold an exclusive per-uuid lock. The table records who
//! holds what, who waits for what, and detects cycles with a stamped DFS
//! every time a new wait edge appears. Cancellation is lazy: an aborted
//! waiter keeps its queue slot and is skipped at grant time, which keeps
//! acquire and release O(1) amortized.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use basalt_types::{TxnId, Uuid};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

/// Outcome of an acquire attempt.
pub enum LockAttempt {
    /// The uuid is held by `xid` now (or already was).
    Granted,
    /// The uuid is contended; block on the channel until granted.
    Wait(Receiver<()>),
    /// Waiting would close a cycle. The wait edge has been rolled back.
    Deadlock,
}

#[derive(Default)]
struct Graph {
    /// uuids exclusively held, per transaction.
    held: HashMap<TxnId, Vec<Uuid>>,
    /// Current holder, per uuid.
    holder: HashMap<Uuid, TxnId>,
    /// FIFO waiters, per uuid.
    waiters: HashMap<Uuid, VecDeque<TxnId>>,
    /// Wakeup side of each parked waiter. A waiter with no entry here has
    /// been cancelled and is skipped at grant time.
    wake: HashMap<TxnId, Sender<()>>,
    /// The single uuid each parked transaction is blocked on.
    waiting_for: HashMap<TxnId, Uuid>,
}

impl Graph {
    /// Follow `start`'s wait chain; `true` when it returns to a node
    /// stamped in this walk.
    fn walk_finds_cycle(
        &self,
        start: TxnId,
        stamp: u32,
        stamps: &mut HashMap<TxnId, u32>,
    ) -> bool {
        let mut current = start;
        loop {
            match stamps.get(&current) {
                Some(seen) if *seen == stamp => return true,
                Some(_) => return false, // explored in an earlier walk
                None => {}
            }
            stamps.insert(current, stamp);
            let Some(uuid) = self.waiting_for.get(&current) else {
                return false;
            };
            let Some(next) = self.holder.get(uuid) else {
                panic!("waited-on uuid {uuid} has no holder");
            };
            current = *next;
        }
    }

    fn has_deadlock(&self) -> bool {
        let mut stamps: HashMap<TxnId, u32> = HashMap::new();
        let mut stamp = 0_u32;
        for &xid in self.held.keys() {
            if stamps.contains_key(&xid) {
                continue;
            }
            stamp += 1;
            if self.walk_finds_cycle(xid, stamp, &mut stamps) {
                return true;
            }
        }
        false
    }

    /// Hand `uuid` to the first waiter that is still alive.
    fn grant_next(&mut self, uuid: Uuid) {
        self.holder.remove(&uuid);
        let Some(queue) = self.waiters.get_mut(&uuid) else {
            return;
        };
        while let Some(next) = queue.pop_front() {
            // Cancelled waiters left their slot behind; skip them.
            let Some(tx) = self.wake.remove(&next) else {
                continue;
            };
            self.holder.insert(uuid, next);
            self.held.entry(next).or_default().push(uuid);
            self.waiting_for.remove(&next);
            // The waiter may have vanished between cancellation and here;
            // a dead receiver is fine.
            let _ = tx.send(());
            break;
        }
        if self.waiters.get(&uuid).is_some_and(VecDeque::is_empty) {
            self.waiters.remove(&uuid);
        }
    }
}

/// Exclusive per-uuid locks for serializable deletes.
#[derive(Default)]
pub struct LockTable {
    graph: Mutex<Graph>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `uuid` for `xid`.
    pub fn acquire(&self, xid: TxnId, uuid: Uuid) -> LockAttempt {
        let mut graph = self.graph.lock();

        // Re-acquiring something we hold is a no-op.
        if graph
            .held
            .get(&xid)
            .is_some_and(|uuids| uuids.contains(&uuid))
        {
            return LockAttempt::Granted;
        }
        if !graph.holder.contains_key(&uuid) {
            graph.holder.insert(uuid, xid);
            graph.held.entry(xid).or_default().push(uuid);
            return LockAttempt::Granted;
        }

        // Contended: append the wait edge, then check it didn't close a
        // cycle.
        graph.waiting_for.insert(xid, uuid);
        graph.waiters.entry(uuid).or_default().push_back(xid);
        if graph.has_deadlock() {
            debug!(%xid, %uuid, "deadlock detected, rolling back wait edge");
            graph.waiting_for.remove(&xid);
            if let Some(queue) = graph.waiters.get_mut(&uuid) {
                queue.retain(|waiter| *waiter != xid);
            }
            return LockAttempt::Deadlock;
        }
        let (tx, rx) = channel();
        graph.wake.insert(xid, tx);
        LockAttempt::Wait(rx)
    }

    /// Release everything `xid` holds and cancel any wait it has pending.
    /// Freed uuids are regranted to their next live waiter.
    pub fn release_all(&self, xid: TxnId) {
        let mut graph = self.graph.lock();
        if let Some(uuids) = graph.held.remove(&xid) {
            for uuid in uuids {
                graph.grant_next(uuid);
            }
        }
        graph.waiting_for.remove(&xid);
        graph.wake.remove(&xid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u64) -> Uuid {
        Uuid::new(n)
    }

    #[test]
    fn test_free_uuid_grants_immediately() {
        let table = LockTable::new();
        assert!(matches!(
            table.acquire(TxnId::new(1), uuid(10)),
            LockAttempt::Granted
        ));
        // Idempotent for the holder.
        assert!(matches!(
            table.acquire(TxnId::new(1), uuid(10)),
            LockAttempt::Granted
        ));
    }

    #[test]
    fn test_contended_uuid_waits_until_release() {
        let table = LockTable::new();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        assert!(matches!(table.acquire(t1, uuid(10)), LockAttempt::Granted));
        let LockAttempt::Wait(rx) = table.acquire(t2, uuid(10)) else {
            panic!("expected a wait");
        };
        assert!(rx.try_recv().is_err());
        table.release_all(t1);
        rx.recv().expect("grant fires on release");
        // t2 owns the uuid now.
        assert!(matches!(table.acquire(t2, uuid(10)), LockAttempt::Granted));
    }

    #[test]
    fn test_two_party_deadlock_is_detected() {
        let table = LockTable::new();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        assert!(matches!(table.acquire(t1, uuid(10)), LockAttempt::Granted));
        assert!(matches!(table.acquire(t2, uuid(20)), LockAttempt::Granted));
        let LockAttempt::Wait(_rx) = table.acquire(t1, uuid(20)) else {
            panic!("t1 should wait for t2");
        };
        // t2 wanting t1's uuid closes the cycle.
        assert!(matches!(
            table.acquire(t2, uuid(10)),
            LockAttempt::Deadlock
        ));
        // The failed edge was rolled back: after t2 releases, t1 gets 20.
        table.release_all(t2);
        _rx.recv().expect("t1 granted after t2 released");
    }

    #[test]
    fn test_three_party_cycle() {
        let table = LockTable::new();
        let (t1, t2, t3) = (TxnId::new(1), TxnId::new(2), TxnId::new(3));
        assert!(matches!(table.acquire(t1, uuid(10)), LockAttempt::Granted));
        assert!(matches!(table.acquire(t2, uuid(20)), LockAttempt::Granted));
        assert!(matches!(table.acquire(t3, uuid(30)), LockAttempt::Granted));
        assert!(matches!(table.acquire(t1, uuid(20)), LockAttempt::Wait(_)));
        assert!(matches!(table.acquire(t2, uuid(30)), LockAttempt::Wait(_)));
        assert!(matches!(
            table.acquire(t3, uuid(10)),
            LockAttempt::Deadlock
        ));
    }

    #[test]
    fn test_cancelled_waiter_is_skipped_at_grant() {
        let table = LockTable::new();
        let (t1, t2, t3) = (TxnId::new(1), TxnId::new(2), TxnId::new(3));
        assert!(matches!(table.acquire(t1, uuid(10)), LockAttempt::Granted));
        let LockAttempt::Wait(_rx2) = table.acquire(t2, uuid(10)) else {
            panic!("t2 waits");
        };
        let LockAttempt::Wait(rx3) = table.acquire(t3, uuid(10)) else {
            panic!("t3 waits");
        };
        // t2 aborts while parked; its queue slot stays behind.
        table.release_all(t2);
        table.release_all(t1);
        // The grant skips the dead t2 and lands on t3.
        rx3.recv().expect("t3 granted");
        assert!(matches!(table.acquire(t3, uuid(10)), LockAttempt::Granted));
    }

    #[test]
    fn test_release_regrants_every_held_uuid() {
        let table = LockTable::new();
        let t1 = TxnId::new(1);
        assert!(matches!(table.acquire(t1, uuid(10)), LockAttempt::Granted));
        assert!(matches!(table.acquire(t1, uuid(11)), LockAttempt::Granted));
        let LockAttempt::Wait(rx_a) = table.acquire(TxnId::new(2), uuid(10)) else {
            panic!("waits");
        };
        let LockAttempt::Wait(rx_b) = table.acquire(TxnId::new(3), uuid(11)) else {
            panic!("waits");
        };
        table.release_all(t1);
        rx_a.recv().expect("uuid 10 regranted");
        rx_b.recv().expect("uuid 11 regranted");
    }
}
