//! Extent manager and transactions.
//!
//! The manager owns the extent file and hands out extents under a
//! transaction. Within one transaction every logical address resolves to a
//! single `NodeExtent` object, whatever the mix of reads, mutations, and
//! allocations that produced it; this is what lets long-lived node objects
//! keep their extent references valid while the transaction rewrites
//! content underneath them.
//!
//! Commit is copy-on-write at the file level: mutable extent versions are
//! written to their blocks (growing the file for fresh allocations), the
//! root pointer is updated last, and the mapping is flushed. An aborted
//! transaction is simply dropped; the committed image was never touched.
//!
//! Single-writer discipline is assumed: one open transaction mutates a given
//! tree at a time.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::storage::{ExtentFile, Laddr, NodeExtent, LADDR_NULL};

#[derive(Debug)]
pub struct ExtentManager {
    file: RefCell<ExtentFile>,
}

/// Per-transaction state: the extent identity table, the allocation cursor,
/// and the pending root pointer update.
#[derive(Debug, Default)]
pub struct Transaction {
    extents: RefCell<HashMap<Laddr, Rc<NodeExtent>>>,
    next_alloc: Cell<Laddr>,
    new_root: Cell<Option<Laddr>>,
}

impl Transaction {
    /// The root address this transaction will install at commit, if any.
    pub fn pending_root(&self) -> Option<Laddr> {
        self.new_root.get()
    }

    pub(crate) fn set_pending_root(&self, laddr: Laddr) {
        self.new_root.set(Some(laddr));
    }
}

/// Borrowed handles threaded through every operation that touches storage.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub manager: &'a ExtentManager,
    pub tx: &'a Transaction,
}

impl<'a> Context<'a> {
    pub fn new(manager: &'a ExtentManager, tx: &'a Transaction) -> Self {
        Self { manager, tx }
    }

    /// Upgrades a clean extent to a mutable version owned by this
    /// transaction. Idempotent. Extents of another transaction are
    /// rejected, which is what turns a node graph held across a commit
    /// into a loud error instead of a lost write.
    pub fn prepare_mutate(&self, extent: &Rc<NodeExtent>) -> Result<()> {
        let known = self
            .tx
            .extents
            .borrow()
            .get(&extent.laddr())
            .is_some_and(|e| Rc::ptr_eq(e, extent));
        ensure!(
            known,
            "extent {} does not belong to this transaction",
            extent.laddr()
        );
        if !extent.is_mutable() {
            extent.mark_mutable();
            trace!(laddr = extent.laddr(), "extent prepared for mutation");
        }
        Ok(())
    }
}

impl ExtentManager {
    /// Creates a fresh extent file ready for `mkfs`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: RefCell::new(ExtentFile::create(path)?),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: RefCell::new(ExtentFile::open(path)?),
        })
    }

    pub fn begin(&self) -> Transaction {
        Transaction {
            extents: RefCell::new(HashMap::new()),
            next_alloc: Cell::new(self.file.borrow().block_count()),
            new_root: Cell::new(None),
        }
    }

    /// The root address as seen by this transaction: a pending update if one
    /// exists, else the committed header value.
    pub fn root_laddr(&self, tx: &Transaction) -> Result<Laddr> {
        if let Some(laddr) = tx.pending_root() {
            return Ok(laddr);
        }
        self.file.borrow().root_laddr()
    }

    /// Reads one node extent. Repeated reads of the same address inside one
    /// transaction return the same buffer, including any mutable version.
    pub fn read_extent(&self, tx: &Transaction, laddr: Laddr) -> Result<Rc<NodeExtent>> {
        if let Some(extent) = tx.extents.borrow().get(&laddr) {
            return Ok(Rc::clone(extent));
        }

        let file = self.file.borrow();
        let extent = Rc::new(NodeExtent::new_clean(laddr, file.block(laddr)?)?);
        tx.extents.borrow_mut().insert(laddr, Rc::clone(&extent));
        trace!(laddr, "extent read");
        Ok(extent)
    }

    /// Reserves a fresh logical address and returns its zeroed, mutable
    /// extent. The block is materialized in the file at commit.
    pub fn alloc_extent(&self, tx: &Transaction) -> Result<Rc<NodeExtent>> {
        let laddr = tx.next_alloc.get();
        ensure!(laddr != LADDR_NULL, "allocation cursor corrupt");
        tx.next_alloc.set(laddr + 1);

        let extent = Rc::new(NodeExtent::new_allocated(laddr));
        let prior = tx.extents.borrow_mut().insert(laddr, Rc::clone(&extent));
        ensure!(prior.is_none(), "double allocation of extent {}", laddr);
        debug!(laddr, "extent allocated");
        Ok(extent)
    }

    /// Writes every mutable extent version back to the file, installs the
    /// pending root pointer, and flushes.
    pub fn commit(&self, tx: Transaction) -> Result<()> {
        let mut file = self.file.borrow_mut();

        let extents = tx.extents.borrow();
        let mut dirty: Vec<&Rc<NodeExtent>> =
            extents.values().filter(|e| e.is_mutable()).collect();
        dirty.sort_by_key(|e| e.laddr());

        if let Some(last) = dirty.last() {
            let needed = last.laddr() + 1;
            if needed > file.block_count() {
                file.grow(needed)?;
            }
        }

        for extent in &dirty {
            file.block_mut(extent.laddr())?
                .copy_from_slice(&extent.read());
        }

        if let Some(root) = tx.new_root.get() {
            file.write_root_laddr(root)?;
        }

        file.sync()?;
        debug!(
            dirty = dirty.len(),
            root = ?tx.new_root.get(),
            "transaction committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_manager() -> (tempfile::TempDir, ExtentManager) {
        let dir = tempdir().unwrap();
        let manager = ExtentManager::create(dir.path().join("tree.db")).unwrap();
        (dir, manager)
    }

    #[test]
    fn alloc_then_commit_persists_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        {
            let manager = ExtentManager::create(&path).unwrap();
            let tx = manager.begin();
            let extent = manager.alloc_extent(&tx).unwrap();
            extent.write().unwrap().fill(0x5A);
            manager.commit(tx).unwrap();
        }

        let manager = ExtentManager::open(&path).unwrap();
        let tx = manager.begin();
        let extent = manager.read_extent(&tx, 1).unwrap();
        assert!(extent.read().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn read_extent_has_transaction_identity() {
        let (_dir, manager) = make_manager();

        let tx = manager.begin();
        let a = manager.alloc_extent(&tx).unwrap();
        manager.commit(tx).unwrap();

        let tx = manager.begin();
        let b = manager.read_extent(&tx, a.laddr()).unwrap();
        let c = manager.read_extent(&tx, a.laddr()).unwrap();
        assert!(Rc::ptr_eq(&b, &c));
    }

    #[test]
    fn abort_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");
        let manager = ExtentManager::create(&path).unwrap();

        {
            let tx = manager.begin();
            let extent = manager.alloc_extent(&tx).unwrap();
            extent.write().unwrap().fill(0xFF);
            drop(tx);
        }

        let tx = manager.begin();
        assert!(manager.read_extent(&tx, 1).is_err());
    }

    #[test]
    fn prepare_mutate_requires_membership() {
        let (_dir, manager) = make_manager();

        let tx1 = manager.begin();
        let extent = manager.alloc_extent(&tx1).unwrap();
        manager.commit(tx1).unwrap();

        let tx2 = manager.begin();
        let foreign = Rc::new(NodeExtent::new_allocated(extent.laddr()));
        let ctx = Context::new(&manager, &tx2);
        assert!(ctx.prepare_mutate(&foreign).is_err());

        let owned = manager.read_extent(&tx2, extent.laddr()).unwrap();
        ctx.prepare_mutate(&owned).unwrap();
        assert!(owned.is_mutable());
    }

    #[test]
    fn pending_root_shadows_committed_root() {
        let (_dir, manager) = make_manager();

        let tx = manager.begin();
        assert_eq!(manager.root_laddr(&tx).unwrap(), LADDR_NULL);
        tx.set_pending_root(7);
        assert_eq!(manager.root_laddr(&tx).unwrap(), 7);
    }
}
