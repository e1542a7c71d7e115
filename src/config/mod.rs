//! Configuration constants.
//!
//! Interdependent values are co-located here and the relationships between
//! them are enforced with compile-time assertions, so a change to one cannot
//! silently invalidate another.

/// Size of every node extent in bytes. A node occupies exactly one block.
pub const NODE_BLOCK_SIZE: usize = 4096;

/// Size of the extent-file header stored at the front of block 0.
pub const FILE_HEADER_SIZE: usize = 128;

/// Size of the node header at the front of every node extent.
pub const NODE_HEADER_SIZE: usize = 24;

/// Bytes of a node extent available for slots and cells.
pub const NODE_USABLE_SIZE: usize = NODE_BLOCK_SIZE - NODE_HEADER_SIZE;

const _: () = assert!(NODE_BLOCK_SIZE > FILE_HEADER_SIZE);
const _: () = assert!(NODE_USABLE_SIZE == NODE_BLOCK_SIZE - NODE_HEADER_SIZE);
const _: () = assert!(NODE_BLOCK_SIZE % 512 == 0);
