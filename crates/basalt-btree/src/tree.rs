//! The tree driver.
//!
//! All structural writes run under the super transaction: node edits and
//! root swaps are redo-logged like any data-item update but bypass MVCC
//! visibility, so a recovered index is exactly the set of committed
//! structure. The tree is addressed by a *boot* data item holding the
//! root uuid; swapping the root rewrites that item through the update
//! protocol under the boot mutex, which makes the swap atomic and
//! recoverable without touching page 1.

use std::sync::Arc;

use basalt_data::{DataManager, ItemHandle};
use basalt_error::Result;
use basalt_types::{codec, TxnId, Uuid};
use parking_lot::Mutex;
use tracing::debug;

use crate::node;

/// Outcome of pushing a pair into one node.
enum NodeInsert {
    /// Inserted; no split.
    Done,
    /// Inserted and split: the new right sibling and its smallest key.
    Split(Uuid, u64),
    /// The key belongs further right; retry on this sibling.
    Redirect(Uuid),
}

struct Node {
    item: ItemHandle,
}

impl Node {
    fn load(dm: &DataManager, uuid: Uuid) -> Result<Self> {
        let item = dm
            .read(uuid)?
            .unwrap_or_else(|| panic!("index node {uuid} is missing"));
        Ok(Self { item })
    }

    fn is_leaf(&self) -> bool {
        self.item.data(node::get_leaf)
    }

    /// Child covering `key`, or the right sibling to continue on.
    fn search_next(&self, key: u64) -> (Uuid, Uuid) {
        self.item.data(|raw| {
            let count = node::get_key_count(raw);
            for kth in 0..count {
                if key < node::get_kth_key(raw, kth) {
                    return (node::get_kth_child(raw, kth), Uuid::NIL);
                }
            }
            (Uuid::NIL, node::get_sibling(raw))
        })
    }

    /// Children with keys in `[left, right]`, plus the sibling to continue
    /// on when the range may extend past this node.
    fn leaf_search_range(&self, left: u64, right: u64) -> (Vec<Uuid>, Uuid) {
        self.item.data(|raw| {
            let count = node::get_key_count(raw);
            let mut kth = 0;
            while kth < count && node::get_kth_key(raw, kth) < left {
                kth += 1;
            }
            let mut uuids = Vec::new();
            while kth < count && node::get_kth_key(raw, kth) <= right {
                uuids.push(node::get_kth_child(raw, kth));
                kth += 1;
            }
            let sibling = if kth == count {
                node::get_sibling(raw)
            } else {
                Uuid::NIL
            };
            (uuids, sibling)
        })
    }

    /// Insert `(child, key)` under the update protocol, splitting when the
    /// node fills. The whole edit is one logged update, committed with
    /// `after` on success and rolled back with `un_before` on any miss.
    fn insert_and_split(&self, dm: &DataManager, child: Uuid, key: u64) -> Result<NodeInsert> {
        self.item.before();
        let inserted = self.item.data_mut(|raw| node::raw_insert(raw, child, key));
        if !inserted {
            let sibling = self.item.data_mut(|raw| node::get_sibling(raw));
            self.item.un_before();
            return Ok(NodeInsert::Redirect(sibling));
        }
        let full = self
            .item
            .data_mut(|raw| node::get_key_count(raw) == 2 * node::BALANCE);
        if !full {
            self.item.after(TxnId::SUPER);
            return Ok(NodeInsert::Done);
        }

        // Split: the upper half moves to a fresh node that takes over the
        // sibling link; the original shrinks and points at it.
        let right_raw = self.item.data_mut(|raw| {
            let mut right = vec![0_u8; node::NODE_SIZE];
            node::set_leaf(&mut right, node::get_leaf(raw));
            node::set_key_count(&mut right, node::BALANCE);
            node::set_sibling(&mut right, node::get_sibling(raw));
            node::copy_pairs_from(raw, &mut right, node::BALANCE);
            right
        });
        let right_uuid = match dm.insert(TxnId::SUPER, &right_raw) {
            Ok(uuid) => uuid,
            Err(err) => {
                self.item.un_before();
                return Err(err);
            }
        };
        let split_key = node::get_kth_key(&right_raw, 0);
        self.item.data_mut(|raw| {
            node::set_key_count(raw, node::BALANCE);
            node::set_sibling(raw, right_uuid);
        });
        self.item.after(TxnId::SUPER);
        debug!(%right_uuid, split_key, "node split");
        Ok(NodeInsert::Split(right_uuid, split_key))
    }
}

/// Concurrent right-linked B+tree.
pub struct BPlusTree {
    boot_item: ItemHandle,
    boot_lock: Mutex<()>,
    dm: Arc<DataManager>,
}

impl BPlusTree {
    /// Create an empty tree; returns the boot uuid that addresses it.
    pub fn create(dm: &DataManager) -> Result<Uuid> {
        let root = dm.insert(TxnId::SUPER, &node::empty_root_raw())?;
        let mut boot_raw = vec![0_u8; Uuid::LEN];
        codec::put_uuid(&mut boot_raw, root);
        dm.insert(TxnId::SUPER, &boot_raw)
    }

    /// Reopen the tree behind `boot_uuid`.
    pub fn load(dm: Arc<DataManager>, boot_uuid: Uuid) -> Result<Self> {
        let boot_item = dm
            .read(boot_uuid)?
            .unwrap_or_else(|| panic!("tree boot item {boot_uuid} is missing"));
        Ok(Self {
            boot_item,
            boot_lock: Mutex::new(()),
            dm,
        })
    }

    fn root_uuid(&self) -> Uuid {
        let _guard = self.boot_lock.lock();
        self.boot_item.data(|data| codec::read_uuid(data))
    }

    /// Swap the root for a fresh one over `(left, right)`, transactionally.
    fn update_root(&self, left: Uuid, right: Uuid, key: u64) -> Result<()> {
        let _guard = self.boot_lock.lock();
        let new_root = self
            .dm
            .insert(TxnId::SUPER, &node::new_root_raw(left, right, key))?;
        self.boot_item.before();
        self.boot_item
            .data_mut(|data| codec::put_uuid(data, new_root));
        self.boot_item.after(TxnId::SUPER);
        debug!(%new_root, "root swapped");
        Ok(())
    }

    /// Map `key` to `value`. Duplicate keys are allowed and all returned
    /// by searches.
    pub fn insert(&self, key: u64, value: Uuid) -> Result<()> {
        let root = self.root_uuid();
        if let Some((new_node, new_key)) = self.insert_into(root, value, key)? {
            self.update_root(root, new_node, new_key)?;
        }
        Ok(())
    }

    /// Every value stored under `key`.
    pub fn search(&self, key: u64) -> Result<Vec<Uuid>> {
        self.search_range(key, key)
    }

    /// Every value with `left <= key <= right`, in key order.
    pub fn search_range(&self, left: u64, right: u64) -> Result<Vec<Uuid>> {
        let mut node_uuid = self.find_leaf(left)?;
        let mut found = Vec::new();
        loop {
            let node = Node::load(&self.dm, node_uuid)?;
            let (uuids, sibling) = node.leaf_search_range(left, right);
            found.extend(uuids);
            if sibling.is_nil() {
                return Ok(found);
            }
            // The range may continue on the right-linked neighbor.
            node_uuid = sibling;
        }
    }

    /// Descend to the leaf whose range covers `key`, chasing right links
    /// past in-flight splits.
    fn find_leaf(&self, key: u64) -> Result<Uuid> {
        let mut node_uuid = self.root_uuid();
        loop {
            let node = Node::load(&self.dm, node_uuid)?;
            if node.is_leaf() {
                return Ok(node_uuid);
            }
            node_uuid = self.search_next_chain(node_uuid, key)?;
        }
    }

    /// Child of `node_uuid` covering `key`, following siblings as needed.
    fn search_next_chain(&self, mut node_uuid: Uuid, key: u64) -> Result<Uuid> {
        loop {
            let node = Node::load(&self.dm, node_uuid)?;
            let (child, sibling) = node.search_next(key);
            if !child.is_nil() {
                return Ok(child);
            }
            assert!(!sibling.is_nil(), "internal node chain ended before {key}");
            node_uuid = sibling;
        }
    }

    /// Recursive insert; returns the split pair the caller must add to
    /// this level's parent, if any.
    fn insert_into(&self, node_uuid: Uuid, value: Uuid, key: u64) -> Result<Option<(Uuid, u64)>> {
        let is_leaf = Node::load(&self.dm, node_uuid)?.is_leaf();
        if is_leaf {
            self.push_pair(node_uuid, value, key)
        } else {
            let next = self.search_next_chain(node_uuid, key)?;
            match self.insert_into(next, value, key)? {
                Some((split_node, split_key)) => self.push_pair(node_uuid, split_node, split_key),
                None => Ok(None),
            }
        }
    }

    /// Insert a pair at this level, walking right until a node accepts it.
    fn push_pair(&self, mut node_uuid: Uuid, child: Uuid, key: u64) -> Result<Option<(Uuid, u64)>> {
        loop {
            let node = Node::load(&self.dm, node_uuid)?;
            match node.insert_and_split(&self.dm, child, key)? {
                NodeInsert::Redirect(sibling) => node_uuid = sibling,
                NodeInsert::Done => return Ok(None),
                NodeInsert::Split(new_node, new_key) => return Ok(Some((new_node, new_key))),
            }
        }
    }
}
