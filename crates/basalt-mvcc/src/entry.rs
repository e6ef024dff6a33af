//! MVCC entries.
//!
//! An entry is a data item whose payload is `[xmin: 8][xmax: 8][user]`.
//! `xmin` is stamped at creation and never changes; `xmax` is zero until
//! the deleting transaction rewrites it through the data-item protocol.

use basalt_data::ItemHandle;
use basalt_types::{codec, TxnId, Uuid};

const OF_XMIN: usize = 0;
const OF_XMAX: usize = 8;
const OF_USER: usize = 16;

/// Frame `data` as a fresh entry created by `xid`.
#[must_use]
pub fn wrap_entry(xid: TxnId, data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0_u8; OF_USER + data.len()];
    codec::put_txn_id(&mut raw[OF_XMIN..], xid);
    raw[OF_USER..].copy_from_slice(data);
    raw
}

/// One versioned record, backed by a live data item.
pub struct Entry {
    uuid: Uuid,
    item: ItemHandle,
}

impl Entry {
    pub(crate) fn new(uuid: Uuid, item: ItemHandle) -> Self {
        Self { uuid, item }
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Creating transaction.
    #[must_use]
    pub fn xmin(&self) -> TxnId {
        self.item.data(|data| codec::read_txn_id(&data[OF_XMIN..]))
    }

    /// Deleting transaction, or zero while undeleted.
    #[must_use]
    pub fn xmax(&self) -> TxnId {
        self.item.data(|data| codec::read_txn_id(&data[OF_XMAX..]))
    }

    /// Copy of the user bytes.
    #[must_use]
    pub fn user_data(&self) -> Vec<u8> {
        self.item.data(|data| data[OF_USER..].to_vec())
    }

    /// Stamp `xid` as the deleter, through the logged update protocol.
    pub fn set_xmax(&self, xid: TxnId) {
        self.item.before();
        self.item
            .data_mut(|data| codec::put_txn_id(&mut data[OF_XMAX..], xid));
        self.item.after(xid);
    }
}
