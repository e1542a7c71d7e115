//! # onode-tree
//!
//! A persistent, copy-on-write B+tree mapping object identifiers to
//! fixed-layout metadata records ("onodes") over a transactional extent
//! file. The tree is the metadata index of an object store: keys are
//! three-stage composite identifiers (placement, name, snapshot) and every
//! node occupies exactly one fixed-size extent.
//!
//! ## Quick start
//!
//! ```ignore
//! use onode_tree::{Context, ExtentManager, ObjectKey, Onode, OnodeTree};
//!
//! let manager = ExtentManager::create("./index.db")?;
//! let tree = OnodeTree::new();
//!
//! let tx = manager.begin();
//! let ctx = Context::new(&manager, &tx);
//! tree.mkfs(ctx)?;
//! let key = ObjectKey::new(0, 1, 0xC0FFEE, "ns", "object-1", 0, 0);
//! tree.insert(ctx, &key, &Onode::new(4096, 0, 0))?;
//! manager.commit(tx)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------+
//! |   OnodeTree (facade)                 |
//! +--------------------------------------+
//! |   Node layer                         |  leaves, interior nodes,
//! |   (tracking graph + cursors)         |  split propagation, root
//! +--------------------------------------+  lifecycle
//! |   Layout layer                       |  slot arrays, staged insert
//! +--------------------------------------+  planning
//! |   Storage layer                      |  mmap'd extent file,
//! |   (extents + transactions)           |  copy-on-write commit
//! +--------------------------------------+
//! ```
//!
//! Mutations are insert-only: the tree grows by leaf splits propagating
//! upward and by root promotion. Cursors returned from lookups stay valid
//! across those mutations; their owning leaves rewrite or invalidate them
//! in the same step as the extent change.
//!
//! ## Module overview
//!
//! - [`storage`]: memory-mapped extent file, transactions, extent identity
//! - [`layout`]: on-extent node encoding and insert planning
//! - [`tree`]: nodes, cursors, root tracking, and the tree facade
//! - [`config`]: block-size constants

pub mod config;
pub mod layout;
pub mod storage;
pub mod tree;

pub use storage::{Context, ExtentManager, Laddr, Transaction};
pub use tree::{
    MatchKind, Node, ObjectKey, Onode, OnodeTree, RootTracker, SearchPosition, TreeCursor,
};
