//! Shared node machinery: tree membership, load, and the root lifecycle.
//!
//! Every node is reachable in exactly one of two ways, encoded as a sum so
//! the illegal states cannot exist: a root holds the `Super` handle binding
//! it to its tree identity, and every other node holds its parent plus its
//! position inside that parent. The parent link is strong and the tracking
//! maps hold weak links back down, so a leaf pinned by a cursor keeps its
//! whole ancestor path in memory while unreferenced subtrees unload freely.
//! On its last drop a node deregisters itself from whichever side tracks
//! it.
//!
//! `Node` is the dispatch handle over the two concrete node kinds. The base
//! layer interprets nothing of the extent beyond its discriminating header
//! fields; everything else belongs to the layout layer.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use eyre::{bail, ensure, Result};
use tracing::debug;

use crate::layout::{read_node_kind, FieldType, NodeType};
use crate::storage::{Context, Laddr, NodeExtent, LADDR_NULL};
use crate::tree::cursor::TreeCursor;
use crate::tree::interior::InteriorNode;
use crate::tree::key::{ObjectKey, Onode};
use crate::tree::leaf::LeafNode;
use crate::tree::position::{MatchHistory, MatchKind, SearchPosition};

/// Binds one tree identity to its live root node. A process may run any
/// number of trees, each with its own tracker.
#[derive(Debug, Default)]
pub struct RootTracker {
    root: RefCell<Option<WeakNode>>,
}

impl RootTracker {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// The live root, if one is currently in memory.
    pub fn get_root(&self) -> Option<Node> {
        self.root.borrow().as_ref().and_then(WeakNode::upgrade)
    }

    fn track(&self, node: &Node) {
        let mut slot = self.root.borrow_mut();
        debug_assert!(
            slot.as_ref().and_then(WeakNode::upgrade).is_none(),
            "a live root is already tracked"
        );
        *slot = Some(node.downgrade());
    }

    fn untrack(&self) {
        *self.root.borrow_mut() = None;
    }

    /// Clears the slot only when the tracked root is gone. A dying node
    /// cannot be upgraded, which is how a dropping stale root is told apart
    /// from a live successor it must not untrack.
    fn untrack_if_dead(&self) {
        let mut slot = self.root.borrow_mut();
        if slot.as_ref().is_some_and(|w| w.upgrade().is_none()) {
            *slot = None;
        }
    }
}

/// Per-transaction view of a tree's root binding: the root address as this
/// transaction sees it, plus the tracker to notify of root changes.
pub struct Super {
    tracker: Rc<RootTracker>,
    root_laddr: Cell<Laddr>,
}

impl Super {
    pub fn get_root_laddr(&self) -> Laddr {
        self.root_laddr.get()
    }

    /// Installs a new root address, journaled through the transaction.
    pub fn write_root_laddr(&self, ctx: Context<'_>, laddr: Laddr) {
        ctx.tx.set_pending_root(laddr);
        self.root_laddr.set(laddr);
    }

    pub(crate) fn do_track_root(&self, node: &Node) {
        self.tracker.track(node);
    }

    pub(crate) fn do_untrack_root(&self) {
        self.tracker.untrack();
    }

    pub(crate) fn do_untrack_root_on_drop(&self) {
        self.tracker.untrack_if_dead();
    }
}

/// Obtains the super handle for a tree under the current transaction.
pub fn get_super(ctx: Context<'_>, tracker: &Rc<RootTracker>) -> Result<Super> {
    let root_laddr = ctx.manager.root_laddr(ctx.tx)?;
    Ok(Super {
        tracker: Rc::clone(tracker),
        root_laddr: Cell::new(root_laddr),
    })
}

/// How a node hangs in the tree.
pub(crate) enum Parentage {
    Root(Super),
    Child {
        parent: Rc<InteriorNode>,
        pos: SearchPosition,
    },
}

/// State shared by both node kinds: the backing extent and the tree
/// linkage. The linkage is `None` only transiently, between allocation and
/// the node's installation as root or child.
pub(crate) struct NodeBase {
    extent: Rc<NodeExtent>,
    parentage: RefCell<Option<Parentage>>,
}

impl NodeBase {
    pub(crate) fn new(extent: Rc<NodeExtent>) -> Self {
        Self {
            extent,
            parentage: RefCell::new(None),
        }
    }

    pub(crate) fn extent(&self) -> &Rc<NodeExtent> {
        &self.extent
    }

    pub(crate) fn laddr(&self) -> Laddr {
        self.extent.laddr()
    }

    pub(crate) fn is_root(&self) -> bool {
        matches!(*self.parentage.borrow(), Some(Parentage::Root(_)))
    }

    pub(crate) fn parent_info(&self) -> Option<(Rc<InteriorNode>, SearchPosition)> {
        match &*self.parentage.borrow() {
            Some(Parentage::Child { parent, pos }) => Some((Rc::clone(parent), *pos)),
            _ => None,
        }
    }

    pub(crate) fn set_parentage(&self, parentage: Parentage) {
        *self.parentage.borrow_mut() = Some(parentage);
    }

    /// Deregisters this node from whichever side tracks it. Called on drop.
    pub(crate) fn detach(&self) {
        match self.parentage.borrow_mut().take() {
            Some(Parentage::Root(sup)) => sup.do_untrack_root_on_drop(),
            Some(Parentage::Child { parent, pos }) => parent.do_untrack_child_on_drop(&pos),
            None => {}
        }
    }

    fn take_super(&self) -> Option<Super> {
        let mut slot = self.parentage.borrow_mut();
        match slot.take() {
            Some(Parentage::Root(sup)) => Some(sup),
            other => {
                *slot = other;
                None
            }
        }
    }
}

#[derive(Clone)]
pub enum Node {
    Leaf(Rc<LeafNode>),
    Interior(Rc<InteriorNode>),
}

#[derive(Clone, Debug)]
pub(crate) enum WeakNode {
    Leaf(Weak<LeafNode>),
    Interior(Weak<InteriorNode>),
}

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        match self {
            WeakNode::Leaf(w) => w.upgrade().map(Node::Leaf),
            WeakNode::Interior(w) => w.upgrade().map(Node::Interior),
        }
    }
}

/// Outcome of a tracked lower-bound descent.
pub struct SearchResult {
    pub cursor: Rc<TreeCursor>,
    pub match_kind: MatchKind,
}

impl Node {
    pub(crate) fn base(&self) -> &NodeBase {
        match self {
            Node::Leaf(n) => n.base(),
            Node::Interior(n) => n.base(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        match self {
            Node::Leaf(n) => WeakNode::Leaf(Rc::downgrade(n)),
            Node::Interior(n) => WeakNode::Interior(Rc::downgrade(n)),
        }
    }

    pub fn laddr(&self) -> Laddr {
        self.base().laddr()
    }

    pub fn is_root(&self) -> bool {
        self.base().is_root()
    }

    pub fn level(&self) -> Result<u8> {
        Ok(read_node_kind(self.base().extent())?.2)
    }

    pub fn is_level_tail(&self) -> Result<bool> {
        Ok(read_node_kind(self.base().extent())?.3)
    }

    pub fn field_type(&self) -> Result<FieldType> {
        Ok(read_node_kind(self.base().extent())?.1)
    }

    pub(crate) fn largest_key_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Node::Leaf(n) => n.largest_key_bytes(),
            Node::Interior(n) => n.largest_key_bytes(),
        }
    }

    /// Binds this node as the tree's root under an already-written super
    /// handle.
    pub(crate) fn as_root(&self, sup: Super) {
        debug_assert!(
            self.base().parentage.borrow().is_none(),
            "as_root on a node that is already linked"
        );
        debug_assert_eq!(sup.get_root_laddr(), self.laddr());
        debug_assert!(self.is_level_tail().unwrap_or(false));
        sup.do_track_root(self);
        self.base().set_parentage(Parentage::Root(sup));
    }

    /// Installs this node as root: writes the root pointer through the
    /// transaction, then binds.
    pub(crate) fn make_root(&self, ctx: Context<'_>, sup: Super) {
        sup.write_root_laddr(ctx, self.laddr());
        self.as_root(sup);
    }

    /// Binds this node under `parent` at `pos` and registers it in the
    /// parent's tracking map. Any previous registration must already be
    /// gone.
    pub(crate) fn as_child(&self, pos: SearchPosition, parent: Rc<InteriorNode>) {
        debug_assert!(
            !self.base().is_root(),
            "as_child on a node still bound as root"
        );
        parent.do_track_child(&pos, self.downgrade());
        self.base().set_parentage(Parentage::Child { parent, pos });
    }

    /// The root has filled: demote it to a child of a fresh internal root
    /// one level up, transferring the super binding onto the new root.
    pub(crate) fn upgrade_root(&self, ctx: Context<'_>) -> Result<()> {
        ensure!(
            self.field_type()? == FieldType::N0,
            "only a canonical root can be promoted"
        );
        ensure!(self.is_level_tail()?, "root must hold the level tail");
        let Some(sup) = self.base().take_super() else {
            bail!("upgrade_root on a non-root node");
        };
        sup.do_untrack_root();

        let old_level = self.level()?;
        let new_root = InteriorNode::allocate_root(ctx, old_level, self.laddr(), sup)?;
        self.as_child(SearchPosition::end(), Rc::clone(&new_root));
        debug!(
            old_root = self.laddr(),
            new_root = new_root.base().laddr(),
            level = old_level + 1,
            "root promoted"
        );
        Ok(())
    }

    /// Propagates a split of this node to its parent.
    pub(crate) fn insert_parent(&self, ctx: Context<'_>, right: Node) -> Result<()> {
        let Some((parent, pos)) = self.base().parent_info() else {
            bail!("insert_parent on the root");
        };
        parent.apply_child_split(ctx, pos, self.clone(), right)
    }

    /// Reads one node extent and constructs the matching node kind. An
    /// unrecognized header is corruption and fails the load.
    pub fn load(ctx: Context<'_>, addr: Laddr, expect_level_tail: bool) -> Result<Node> {
        let extent = ctx.manager.read_extent(ctx.tx, addr)?;
        let (node_type, _field_type, level, is_tail) = read_node_kind(&extent)?;
        ensure!(
            is_tail == expect_level_tail,
            "node {} has level-tail={}, expected {}",
            addr,
            is_tail,
            expect_level_tail
        );
        debug!(laddr = addr, ?node_type, level, "node loaded");
        match node_type {
            NodeType::Leaf => {
                ensure!(level == 0, "leaf node {} claims level {}", addr, level);
                Ok(Node::Leaf(LeafNode::from_extent(extent)?))
            }
            NodeType::Internal => {
                ensure!(level > 0, "interior node {} claims level 0", addr);
                Ok(Node::Interior(InteriorNode::from_extent(extent)?))
            }
        }
    }

    /// Creates an empty tree: a lone leaf root.
    pub fn mkfs(ctx: Context<'_>, tracker: &Rc<RootTracker>) -> Result<()> {
        LeafNode::allocate_root(ctx, tracker)?;
        Ok(())
    }

    /// Loads the root of an existing tree and binds it to the tracker.
    pub fn load_root(ctx: Context<'_>, tracker: &Rc<RootTracker>) -> Result<Node> {
        let sup = get_super(ctx, tracker)?;
        let addr = sup.get_root_laddr();
        ensure!(addr != LADDR_NULL, "extent file holds no tree root");

        let root = Node::load(ctx, addr, true)?;
        ensure!(
            root.field_type()? == FieldType::N0,
            "root node has a non-canonical field type"
        );
        root.as_root(sup);
        Ok(root)
    }

    pub fn lookup_smallest(&self, ctx: Context<'_>) -> Result<Rc<TreeCursor>> {
        match self {
            Node::Leaf(n) => n.lookup_smallest(),
            Node::Interior(n) => n.lookup_smallest(ctx),
        }
    }

    pub fn lookup_largest(&self, ctx: Context<'_>) -> Result<Rc<TreeCursor>> {
        match self {
            Node::Leaf(n) => n.lookup_largest(),
            Node::Interior(n) => n.lookup_largest(ctx),
        }
    }

    pub(crate) fn lower_bound_tracked(
        &self,
        ctx: Context<'_>,
        key: &[u8],
        history: &mut MatchHistory,
    ) -> Result<SearchResult> {
        match self {
            Node::Leaf(n) => n.lower_bound_tracked(key, history),
            Node::Interior(n) => n.lower_bound_tracked(ctx, key, history),
        }
    }

    /// Point lookup: descends to the cursor at or after `key`.
    pub fn lower_bound(&self, ctx: Context<'_>, key: &ObjectKey) -> Result<SearchResult> {
        let encoded = key.encode();
        let mut history = MatchHistory::new();
        self.lower_bound_tracked(ctx, &encoded, &mut history)
    }

    /// Inserts `key -> value`. An already-present key leaves the tree
    /// untouched and hands back its existing cursor.
    pub fn insert(
        &self,
        ctx: Context<'_>,
        key: &ObjectKey,
        value: &Onode,
    ) -> Result<(Rc<TreeCursor>, bool)> {
        let encoded = key.encode();
        let mut history = MatchHistory::new();
        let found = self.lower_bound_tracked(ctx, &encoded, &mut history)?;
        if found.match_kind == MatchKind::Eq {
            return Ok((found.cursor, false));
        }
        let leaf = found.cursor.leaf();
        let pos = found.cursor.position();
        let cursor = leaf.insert_value(ctx, &encoded, value, &pos, &history)?;
        Ok((cursor, true))
    }

    /// Multi-line structural dump for diagnostics.
    pub fn dump(&self) -> Result<String> {
        match self {
            Node::Leaf(n) => n.dump(),
            Node::Interior(n) => n.dump(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Node::Leaf(_) => "leaf",
            Node::Interior(_) => "interior",
        };
        write!(f, "Node({} laddr={})", kind, self.laddr())
    }
}
