//! The node layer: tree membership, search, insert, and cursor tracking.
//!
//! ```text
//! +-----------------------------+
//! | OnodeTree                   |  facade: mkfs / load / lookup / insert
//! +-----------------------------+
//! | Node / LeafNode / Interior  |  tracking graph, split propagation,
//! | TreeCursor                  |  root lifecycle, cursor stability
//! +-----------------------------+
//! | layout                      |  on-extent encoding and insert planning
//! +-----------------------------+
//! | storage                     |  transactional extent file
//! +-----------------------------+
//! ```
//!
//! Structure changes flow bottom-up: a full leaf splits, hands its parent a
//! fresh right sibling through `insert_parent`, and the parent absorbs it
//! or splits in turn; a split arriving at the root first promotes it. At
//! every step the in-memory tracking graph (parents to children, leaves to
//! cursors) is rewritten in the same atomic step as the extent mutation, so
//! live cursors stay valid across any legal mutation sequence.

pub mod cursor;
pub mod interior;
pub mod key;
pub mod leaf;
pub mod node;
pub mod position;
mod tree;

pub use cursor::TreeCursor;
pub use interior::InteriorNode;
pub use key::{ObjectKey, Onode};
pub use leaf::LeafNode;
pub use node::{Node, RootTracker, SearchResult, Super};
pub use position::{MatchHistory, MatchKind, SearchPosition};
pub use tree::OnodeTree;
