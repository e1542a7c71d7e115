//! Interior nodes.
//!
//! An interior node routes searches to its children and owns their tracked
//! presence in memory. When a child splits, the parent absorbs the split:
//! the old slot is repointed at the new right sibling, the left child's
//! largest key is inserted as a fresh separator, and when the parent itself
//! has no room the split recurses upward, promoting the root if it gets
//! that far.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

use eyre::{ensure, eyre, Result};
use smallvec::SmallVec;
use tracing::debug;

use crate::layout::{FieldType, InteriorLayout, InteriorLayoutMut};
use crate::storage::{Context, Laddr, NodeExtent};
use crate::tree::cursor::TreeCursor;
use crate::tree::node::{Node, NodeBase, SearchResult, Super, WeakNode};
use crate::tree::position::{MatchHistory, SearchPosition, INDEX_END};

pub struct InteriorNode {
    base: NodeBase,
    tracked_children: RefCell<BTreeMap<SearchPosition, WeakNode>>,
}

impl InteriorNode {
    fn new(extent: Rc<NodeExtent>) -> Rc<Self> {
        Rc::new(Self {
            base: NodeBase::new(extent),
            tracked_children: RefCell::new(BTreeMap::new()),
        })
    }

    /// Wraps an already-read interior extent.
    pub(crate) fn from_extent(extent: Rc<NodeExtent>) -> Result<Rc<Self>> {
        InteriorLayout::new(&extent)?;
        Ok(Self::new(extent))
    }

    /// Reserves a fresh extent and formats it as an empty interior node.
    pub(crate) fn allocate(
        ctx: Context<'_>,
        field_type: FieldType,
        is_level_tail: bool,
        level: u8,
    ) -> Result<Rc<Self>> {
        let extent = ctx.manager.alloc_extent(ctx.tx)?;
        InteriorLayoutMut::init(&extent, field_type, level, is_level_tail)?;
        Ok(Self::new(extent))
    }

    /// Allocates the internal root that takes over from a filled root one
    /// level below, wiring the old root in as its tail child.
    pub(crate) fn allocate_root(
        ctx: Context<'_>,
        old_root_level: u8,
        old_root_addr: Laddr,
        sup: Super,
    ) -> Result<Rc<Self>> {
        ensure!(old_root_level < u8::MAX, "tree is at maximum height");
        let root = Self::allocate(ctx, FieldType::N0, true, old_root_level + 1)?;
        {
            let mut layout = InteriorLayoutMut::new(root.base.extent())?;
            layout.set_tail_child(old_root_addr)?;
        }
        root.as_node().make_root(ctx, sup);
        Ok(root)
    }

    pub(crate) fn base(&self) -> &NodeBase {
        &self.base
    }

    pub(crate) fn as_node(self: &Rc<Self>) -> Node {
        Node::Interior(Rc::clone(self))
    }

    fn layout(&self) -> Result<InteriorLayout<'_>> {
        InteriorLayout::new(self.base.extent())
    }

    fn layout_mut(&self) -> Result<InteriorLayoutMut<'_>> {
        InteriorLayoutMut::new(self.base.extent())
    }

    pub(crate) fn largest_key_bytes(&self) -> Result<Vec<u8>> {
        self.layout()?.largest_key_bytes()
    }

    /// Every child slot in routing order.
    pub(crate) fn child_entries(&self) -> Result<Vec<(SearchPosition, Laddr)>> {
        self.layout()?.entries()
    }

    pub fn lookup_smallest(self: &Rc<Self>, ctx: Context<'_>) -> Result<Rc<TreeCursor>> {
        let (pos, child_addr) = {
            let layout = self.layout()?;
            if layout.cell_count() == 0 {
                ensure!(layout.is_level_tail(), "empty non-tail interior node");
                let pos = SearchPosition::end();
                (pos, layout.get_p_value(&pos)?)
            } else {
                let pos = SearchPosition::begin();
                (pos, layout.get_p_value(&pos)?)
            }
        };
        let child = self.get_or_track_child(ctx, &pos, child_addr)?;
        child.lookup_smallest(ctx)
    }

    /// Only the level-tail node can answer this: the greatest key lives
    /// under its tail child.
    pub fn lookup_largest(self: &Rc<Self>, ctx: Context<'_>) -> Result<Rc<TreeCursor>> {
        let pos = SearchPosition::end();
        let child_addr = {
            let layout = self.layout()?;
            ensure!(
                layout.is_level_tail(),
                "lookup_largest through a non-tail interior node"
            );
            layout.get_p_value(&pos)?
        };
        let child = self.get_or_track_child(ctx, &pos, child_addr)?;
        child.lookup_largest(ctx)
    }

    pub(crate) fn lower_bound_tracked(
        self: &Rc<Self>,
        ctx: Context<'_>,
        key: &[u8],
        history: &mut MatchHistory,
    ) -> Result<SearchResult> {
        let (pos, child_addr) = self.layout()?.lower_bound(key, history)?;
        let child = self.get_or_track_child(ctx, &pos, child_addr)?;
        child.lower_bound_tracked(ctx, key, history)
    }

    /// Absorbs the split of the child tracked at `pos`: `left` stays at a
    /// new separator slot, `right` takes over the child slot at `pos`.
    pub(crate) fn apply_child_split(
        self: &Rc<Self>,
        ctx: Context<'_>,
        pos: SearchPosition,
        left: Node,
        right: Node,
    ) -> Result<()> {
        if pos.is_end() {
            ensure!(
                self.layout()?.is_level_tail(),
                "end position split on a non-tail interior node"
            );
        }
        ctx.prepare_mutate(self.base.extent())?;

        let left_addr = left.laddr();
        let right_addr = right.laddr();
        {
            let mut layout = self.layout_mut()?;
            layout.replace_child_addr(&pos, right_addr, left_addr)?;
        }
        self.replace_track(&pos, &right, &left)?;

        let left_key = left.largest_key_bytes()?;
        let (plan, free) = {
            let layout = self.layout()?;
            let plan = layout.evaluate_insert(&left_key, &pos)?;
            (plan, layout.free_size())
        };

        if free >= plan.size {
            self.layout_mut()?.insert(&left_key, left_addr, &plan)?;
            self.track_insert(&plan.pos, plan.stage, &left, Some(&right))?;
            #[cfg(debug_assertions)]
            self.validate_tracked_children()?;
            return Ok(());
        }

        debug!(
            laddr = self.base.laddr(),
            need = plan.size,
            free,
            "interior node full, splitting"
        );
        if self.base.is_root() {
            self.as_node().upgrade_root(ctx)?;
        }

        let (field_type, is_tail, level) = {
            let layout = self.layout()?;
            (layout.field_type(), layout.is_level_tail(), layout.level())
        };
        let right_node = InteriorNode::allocate(ctx, field_type, is_tail, level)?;
        let result = {
            let mut layout = self.layout_mut()?;
            layout.split_insert(right_node.base.extent(), &left_key, left_addr, &plan)?
        };

        self.track_split(&result.split_pos, &right_node)?;
        if result.is_insert_left {
            self.track_insert(&result.insert_pos, result.insert_stage, &left, None)?;
        } else {
            right_node.track_insert(&result.insert_pos, result.insert_stage, &left, None)?;
        }
        #[cfg(debug_assertions)]
        {
            self.validate_tracked_children()?;
            right_node.validate_tracked_children()?;
        }

        self.as_node().insert_parent(ctx, right_node.as_node())
    }

    /// Returns the tracked child at `pos`, loading and binding it when it
    /// is not in memory.
    pub(crate) fn get_or_track_child(
        self: &Rc<Self>,
        ctx: Context<'_>,
        pos: &SearchPosition,
        child_addr: Laddr,
    ) -> Result<Node> {
        let existing = self
            .tracked_children
            .borrow()
            .get(pos)
            .and_then(WeakNode::upgrade);
        let child = match existing {
            Some(child) => child,
            None => {
                let child = Node::load(ctx, child_addr, pos.is_end())?;
                child.as_child(*pos, Rc::clone(self));
                child
            }
        };
        ensure!(
            child.laddr() == child_addr,
            "tracked child at {} has address {}, expected {}",
            pos,
            child.laddr(),
            child_addr
        );
        #[cfg(debug_assertions)]
        self.validate_child(&child)?;
        Ok(child)
    }

    /// Shifts tracked children inside the insert's stage window up by one
    /// and registers `insert_child` at the freed slot. `nxt_child`, when
    /// given, is the child expected to sit right behind the insert.
    fn track_insert(
        self: &Rc<Self>,
        insert_pos: &SearchPosition,
        stage: u8,
        insert_child: &Node,
        nxt_child: Option<&Node>,
    ) -> Result<()> {
        let upper = insert_pos.with_index_at(stage, INDEX_END);
        let moved: Vec<(SearchPosition, Node)> = {
            let mut map = self.tracked_children.borrow_mut();
            let keys: SmallVec<[SearchPosition; 8]> =
                map.range(*insert_pos..upper).map(|(p, _)| *p).collect();
            keys.iter()
                .filter_map(|p| map.remove(p).map(|w| (*p, w)))
                .filter_map(|(p, w)| w.upgrade().map(|n| (p, n)))
                .collect()
        };
        for (pos, child) in &moved {
            let new_pos = pos.with_index_at(stage, pos.index_at(stage) + 1);
            child.as_child(new_pos, Rc::clone(self));
        }
        insert_child.as_child(*insert_pos, Rc::clone(self));

        if let Some(nxt) = nxt_child {
            let map = self.tracked_children.borrow();
            let behind = map
                .range((Bound::Excluded(*insert_pos), Bound::Unbounded))
                .next()
                .and_then(|(_, w)| w.upgrade());
            debug_assert!(
                behind.map_or(true, |n| n.laddr() == nxt.laddr()),
                "child behind the inserted separator is not the split sibling"
            );
        }
        Ok(())
    }

    /// Swaps which node is tracked at `pos`. The displaced child keeps its
    /// stale parent link only until the caller re-binds it.
    fn replace_track(
        self: &Rc<Self>,
        pos: &SearchPosition,
        new_child: &Node,
        old_child: &Node,
    ) -> Result<()> {
        let removed = self
            .tracked_children
            .borrow_mut()
            .remove(pos)
            .and_then(|w| w.upgrade());
        ensure!(
            removed.map(|n| n.laddr()) == Some(old_child.laddr()),
            "tracked child at {} is not the splitting child",
            pos
        );
        new_child.as_child(*pos, Rc::clone(self));
        Ok(())
    }

    /// Re-homes tracked children at or past the split point onto the right
    /// sibling, with positions rewritten into its coordinates.
    fn track_split(
        self: &Rc<Self>,
        split_pos: &SearchPosition,
        right: &Rc<InteriorNode>,
    ) -> Result<()> {
        let moved: Vec<(SearchPosition, Node)> = {
            let mut map = self.tracked_children.borrow_mut();
            let keys: SmallVec<[SearchPosition; 8]> =
                map.range(*split_pos..).map(|(p, _)| *p).collect();
            keys.iter()
                .filter_map(|p| map.remove(p).map(|w| (*p, w)))
                .filter_map(|(p, w)| w.upgrade().map(|n| (p, n)))
                .collect()
        };
        for (pos, child) in &moved {
            child.as_child(pos.stage_sub(split_pos), Rc::clone(right));
        }
        Ok(())
    }

    pub(crate) fn do_track_child(&self, pos: &SearchPosition, child: WeakNode) {
        let mut map = self.tracked_children.borrow_mut();
        debug_assert!(
            map.get(pos).and_then(WeakNode::upgrade).is_none(),
            "position {} already tracks a live child",
            pos
        );
        map.insert(*pos, child);
    }

    /// Called from a child's drop. The dying child's weak entry no longer
    /// upgrades, which is how it is distinguished from a live replacement
    /// that must be left alone.
    pub(crate) fn do_untrack_child_on_drop(&self, pos: &SearchPosition) {
        let mut map = self.tracked_children.borrow_mut();
        let dead = map.get(pos).is_some_and(|w| w.upgrade().is_none());
        debug_assert!(dead, "dropping child not tracked at {}", pos);
        if dead {
            map.remove(pos);
        }
    }

    #[cfg(debug_assertions)]
    fn validate_child(self: &Rc<Self>, child: &Node) -> Result<()> {
        let layout = self.layout()?;
        ensure!(
            layout.level() == child.level()? + 1,
            "child level {} under interior level {}",
            child.level()?,
            layout.level()
        );
        let (parent, pos) = child
            .base()
            .parent_info()
            .ok_or_else(|| eyre!("tracked child has no parent link"))?;
        ensure!(
            Rc::ptr_eq(&parent, self),
            "tracked child points at another parent"
        );
        ensure!(
            layout.get_p_value(&pos)? == child.laddr(),
            "slot at {} does not hold the child's address",
            pos
        );
        if pos.is_end() {
            ensure!(layout.is_level_tail(), "end child under a non-tail parent");
            ensure!(child.is_level_tail()?, "end child is not the level tail");
        } else {
            ensure!(!child.is_level_tail()?, "level tail tracked at {}", pos);
            ensure!(
                layout.get_key_at(&pos)?.encode() == child.largest_key_bytes()?,
                "separator at {} is not the child's largest key",
                pos
            );
        }
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn validate_tracked_children(self: &Rc<Self>) -> Result<()> {
        let tracked: Vec<(SearchPosition, Node)> = self
            .tracked_children
            .borrow()
            .iter()
            .filter_map(|(p, w)| w.upgrade().map(|n| (*p, n)))
            .collect();
        for (pos, child) in tracked {
            let (_, child_pos) = child
                .base()
                .parent_info()
                .ok_or_else(|| eyre!("tracked child has no parent link"))?;
            ensure!(child_pos == pos, "tracked child position diverged at {}", pos);
            self.validate_child(&child)?;
        }
        Ok(())
    }

    pub fn dump(&self) -> Result<String> {
        let mut out = self.layout()?.dump()?;
        out.push_str(&format!(
            "  tracked children: {}\n",
            self.tracked_children.borrow().len()
        ));
        Ok(out)
    }
}

impl Drop for InteriorNode {
    fn drop(&mut self) {
        self.base.detach();
    }
}
