//! Redo record framing.
//!
//! Two tagged record kinds travel through the log:
//!
//! ```text
//! insert := [tag=1] [xid: 8] [page_no: 4] [offset: 2] [item frame]
//! update := [tag=2] [xid: 8] [uuid: 8] [old_len: 2] [old] [new_len: 2] [new]
//! ```
//!
//! `old` and `new` are complete item frames (valid byte, size, payload)
//! captured around an update, so recovery can restore either side blindly.

use basalt_types::{codec, Offset, PageNo, TxnId, Uuid};

const TAG_INSERT: u8 = 1;
const TAG_UPDATE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    Insert {
        xid: TxnId,
        page_no: PageNo,
        offset: Offset,
        raw: Vec<u8>,
    },
    Update {
        xid: TxnId,
        uuid: Uuid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl RedoRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Insert {
                xid,
                page_no,
                offset,
                raw,
            } => {
                let mut out = vec![0_u8; 1 + 8 + 4 + 2 + raw.len()];
                out[0] = TAG_INSERT;
                codec::put_txn_id(&mut out[1..], *xid);
                codec::put_u32(&mut out[9..], page_no.get());
                codec::put_u16(&mut out[13..], *offset);
                out[15..].copy_from_slice(raw);
                out
            }
            Self::Update { xid, uuid, old, new } => {
                let mut out = vec![0_u8; 1 + 8 + 8 + 2 + old.len() + 2 + new.len()];
                out[0] = TAG_UPDATE;
                codec::put_txn_id(&mut out[1..], *xid);
                codec::put_uuid(&mut out[9..], *uuid);
                codec::put_u16(&mut out[17..], old.len() as u16);
                out[19..19 + old.len()].copy_from_slice(old);
                let at = 19 + old.len();
                codec::put_u16(&mut out[at..], new.len() as u16);
                out[at + 2..].copy_from_slice(new);
                out
            }
        }
    }

    /// Decode a record from verified log data.
    ///
    /// # Panics
    /// On a malformed record. Frames reach this point checksummed, so a
    /// parse failure means the writer and reader disagree — a bug, not
    /// corruption.
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        match data[0] {
            TAG_INSERT => {
                let xid = codec::read_txn_id(&data[1..]);
                let page_no = PageNo::new(codec::read_u32(&data[9..]));
                let offset = codec::read_u16(&data[13..]);
                Self::Insert {
                    xid,
                    page_no,
                    offset,
                    raw: data[15..].to_vec(),
                }
            }
            TAG_UPDATE => {
                let xid = codec::read_txn_id(&data[1..]);
                let uuid = codec::read_uuid(&data[9..]);
                let old_len = codec::read_u16(&data[17..]) as usize;
                let old = data[19..19 + old_len].to_vec();
                let at = 19 + old_len;
                let new_len = codec::read_u16(&data[at..]) as usize;
                let new = data[at + 2..at + 2 + new_len].to_vec();
                Self::Update { xid, uuid, old, new }
            }
            tag => panic!("unknown redo record tag {tag}"),
        }
    }

    #[must_use]
    pub const fn xid(&self) -> TxnId {
        match self {
            Self::Insert { xid, .. } | Self::Update { xid, .. } => *xid,
        }
    }

    /// Page the record touches.
    #[must_use]
    pub const fn page_no(&self) -> PageNo {
        match self {
            Self::Insert { page_no, .. } => *page_no,
            Self::Update { uuid, .. } => uuid.page_no(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_round_trip() {
        let rec = RedoRecord::Insert {
            xid: TxnId::new(7),
            page_no: PageNo::new(3),
            offset: 514,
            raw: vec![0, 4, 0, b'd', b'a', b't', b'a'],
        };
        assert_eq!(RedoRecord::parse(&rec.encode()), rec);
    }

    #[test]
    fn test_update_round_trip() {
        let rec = RedoRecord::Update {
            xid: TxnId::SUPER,
            uuid: Uuid::from_parts(PageNo::new(9), 42),
            old: vec![0, 1, 0, 0xAA],
            new: vec![0, 1, 0, 0xBB],
        };
        assert_eq!(RedoRecord::parse(&rec.encode()), rec);
        assert_eq!(rec.page_no(), PageNo::new(9));
    }

    #[test]
    #[should_panic(expected = "unknown redo record tag")]
    fn test_unknown_tag_panics() {
        let _ = RedoRecord::parse(&[9, 0, 0]);
    }
}
