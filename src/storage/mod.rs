//! Transactional extent storage.
//!
//! The tree's persistence substrate is a single memory-mapped file of
//! fixed-size blocks. Every node occupies exactly one block, addressed by a
//! logical address (`Laddr`, the block number). Mutations are copy-on-write
//! at transaction granularity: reading an extent yields a clean in-memory
//! buffer of the committed bytes, and preparing it for mutation upgrades that
//! buffer to a transaction-private version. Nothing reaches the file until
//! the transaction commits, at which point all mutable versions are written
//! back to their blocks and the root pointer in the file header is updated.
//!
//! Layering:
//!
//! ```text
//! +--------------------------------------+
//! | ExtentManager / Transaction / Context|  copy-on-write, extent identity
//! +--------------------------------------+
//! | NodeExtent                           |  laddr-bound block buffer
//! +--------------------------------------+
//! | ExtentFile                           |  mmap'd blocks + file header
//! +--------------------------------------+
//! ```

mod extent;
mod file;
mod manager;

pub use extent::NodeExtent;
pub use file::{ExtentFile, FileHeader, EXTENT_MAGIC};
pub use manager::{Context, ExtentManager, Transaction};

/// Logical address of a node extent: its block number in the extent file.
pub type Laddr = u64;

/// Reserved address; block 0 holds the file header and is never a node.
pub const LADDR_NULL: Laddr = 0;
