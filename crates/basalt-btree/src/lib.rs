//! Concurrent right-linked B+tree.
//!
//! Every node is a data item; structural writes go through the data-item
//! update protocol under the super transaction, so the index is redo-only
//! and invisible to MVCC. Searches tolerate concurrent splits by chasing
//! right-sibling links instead of holding ancestor latches.

mod node;
mod tree;

pub use tree::BPlusTree;
