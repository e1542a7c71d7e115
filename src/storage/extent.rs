//! In-memory node extents.
//!
//! A `NodeExtent` is the unit the node layer works on: one block's worth of
//! bytes bound to a stable logical address. Reading an extent inside a
//! transaction materializes the committed bytes into a clean buffer; the
//! first mutation upgrades that same buffer to a mutable transaction-private
//! version. The address never changes across the upgrade, so every in-memory
//! reference held by nodes keeps following the extent through its versions.

use std::cell::{Cell, Ref, RefCell, RefMut};

use eyre::{ensure, Result};

use crate::config::NODE_BLOCK_SIZE;
use crate::storage::Laddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// A read-only view of the committed bytes.
    Clean,
    /// A transaction-private version, written back on commit.
    Mutable,
}

#[derive(Debug)]
pub struct NodeExtent {
    laddr: Laddr,
    state: Cell<ExtentState>,
    buf: RefCell<Box<[u8]>>,
}

impl NodeExtent {
    /// Wraps committed block bytes read from the extent file.
    pub fn new_clean(laddr: Laddr, bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == NODE_BLOCK_SIZE,
            "extent {} has {} bytes, expected {}",
            laddr,
            bytes.len(),
            NODE_BLOCK_SIZE
        );
        Ok(Self {
            laddr,
            state: Cell::new(ExtentState::Clean),
            buf: RefCell::new(bytes.to_vec().into_boxed_slice()),
        })
    }

    /// A zeroed, freshly allocated extent. Born mutable: it exists only
    /// inside the allocating transaction until commit.
    pub fn new_allocated(laddr: Laddr) -> Self {
        Self {
            laddr,
            state: Cell::new(ExtentState::Mutable),
            buf: RefCell::new(vec![0u8; NODE_BLOCK_SIZE].into_boxed_slice()),
        }
    }

    pub fn laddr(&self) -> Laddr {
        self.laddr
    }

    pub fn is_mutable(&self) -> bool {
        self.state.get() == ExtentState::Mutable
    }

    pub(crate) fn mark_mutable(&self) {
        self.state.set(ExtentState::Mutable);
    }

    /// Borrows the extent bytes for reading.
    pub fn read(&self) -> Ref<'_, [u8]> {
        Ref::map(self.buf.borrow(), |b| &b[..])
    }

    /// Borrows the extent bytes for writing. The extent must have been
    /// prepared for mutation under the current transaction first.
    pub fn write(&self) -> Result<RefMut<'_, [u8]>> {
        ensure!(
            self.is_mutable(),
            "extent {} mutated without prepare_mutate",
            self.laddr
        );
        Ok(RefMut::map(self.buf.borrow_mut(), |b| &mut b[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_extent_rejects_writes() {
        let extent = NodeExtent::new_clean(1, &[0u8; NODE_BLOCK_SIZE]).unwrap();
        assert!(!extent.is_mutable());
        assert!(extent.write().is_err());
    }

    #[test]
    fn mark_mutable_enables_writes() {
        let extent = NodeExtent::new_clean(1, &[0u8; NODE_BLOCK_SIZE]).unwrap();
        extent.mark_mutable();
        extent.write().unwrap()[0] = 7;
        assert_eq!(extent.read()[0], 7);
    }

    #[test]
    fn allocated_extent_is_zeroed_and_mutable() {
        let extent = NodeExtent::new_allocated(5);
        assert_eq!(extent.laddr(), 5);
        assert!(extent.is_mutable());
        assert!(extent.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn new_clean_validates_length() {
        assert!(NodeExtent::new_clean(1, &[0u8; 16]).is_err());
    }
}
