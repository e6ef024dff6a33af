//! Runtime state of one open transaction.

use basalt_error::{BasaltError, Result};
use basalt_types::TxnId;
use hashbrown::HashSet;

/// Isolation level chosen at `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Sees every committed write, whenever it committed.
    ReadCommitted,
    /// Sees only writes committed before this transaction began.
    RepeatableRead,
}

/// Per-transaction runtime: isolation level, begin-time snapshot, and the
/// sticky serialization failure.
///
/// Once a transaction hits a deadlock or a version skip it is auto-aborted
/// and every later operation keeps answering `CannotSerialize` until the
/// client acknowledges with an explicit abort.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    level: IsolationLevel,
    /// Ids active at begin time. Recorded for repeatable-read only.
    snapshot: Option<HashSet<u64>>,
    serialization_failed: bool,
    auto_aborted: bool,
}

impl Transaction {
    /// Build the runtime, snapshotting `active` when the level wants it.
    pub(crate) fn new<'a>(
        id: TxnId,
        level: IsolationLevel,
        active: impl Iterator<Item = &'a TxnId>,
    ) -> Self {
        let snapshot = match level {
            IsolationLevel::ReadCommitted => None,
            IsolationLevel::RepeatableRead => Some(active.map(|xid| xid.get()).collect()),
        };
        Self {
            id,
            level,
            snapshot,
            serialization_failed: false,
            auto_aborted: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub const fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Whether `xid` was active when this transaction began. The super
    /// transaction belongs to no snapshot.
    #[must_use]
    pub fn in_snapshot(&self, xid: TxnId) -> bool {
        if xid.is_super() {
            return false;
        }
        self.snapshot
            .as_ref()
            .is_some_and(|snap| snap.contains(&xid.get()))
    }

    /// Fail the request if the sticky error is set.
    pub fn check(&self) -> Result<()> {
        if self.serialization_failed {
            Err(BasaltError::CannotSerialize)
        } else {
            Ok(())
        }
    }

    /// Record the serialization failure; the manager auto-aborts around
    /// this.
    pub(crate) fn fail(&mut self) {
        self.serialization_failed = true;
        self.auto_aborted = true;
    }

    #[must_use]
    pub const fn is_auto_aborted(&self) -> bool {
        self.auto_aborted
    }
}
