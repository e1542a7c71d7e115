//! Leaf nodes.
//!
//! Leaves terminate every search and own the cursors handed out to callers.
//! The tracking map mirrors the staged order of the entries, so the insert
//! and split protocols can shift or re-home exactly the cursors whose
//! positions are disturbed and leave the rest untouched.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use eyre::{ensure, eyre, Result};
use smallvec::SmallVec;
use tracing::debug;

use crate::layout::{FieldType, LeafLayout, LeafLayoutMut};
use crate::storage::{Context, NodeExtent};
use crate::tree::cursor::TreeCursor;
use crate::tree::key::{ObjectKey, Onode};
use crate::tree::node::{get_super, Node, NodeBase, RootTracker, SearchResult};
use crate::tree::position::{MatchHistory, SearchPosition, INDEX_END, STAGE_SNAP};

pub struct LeafNode {
    base: NodeBase,
    tracked_cursors: RefCell<BTreeMap<SearchPosition, Weak<TreeCursor>>>,
}

impl LeafNode {
    fn new(extent: Rc<NodeExtent>) -> Rc<Self> {
        Rc::new(Self {
            base: NodeBase::new(extent),
            tracked_cursors: RefCell::new(BTreeMap::new()),
        })
    }

    /// Wraps an already-read leaf extent.
    pub(crate) fn from_extent(extent: Rc<NodeExtent>) -> Result<Rc<Self>> {
        LeafLayout::new(&extent)?;
        Ok(Self::new(extent))
    }

    /// Reserves a fresh extent and formats it as an empty leaf.
    pub(crate) fn allocate(
        ctx: Context<'_>,
        field_type: FieldType,
        is_level_tail: bool,
    ) -> Result<Rc<Self>> {
        let extent = ctx.manager.alloc_extent(ctx.tx)?;
        LeafLayoutMut::init(&extent, field_type, is_level_tail)?;
        Ok(Self::new(extent))
    }

    /// Allocates the empty leaf root of a fresh tree and installs it.
    pub(crate) fn allocate_root(
        ctx: Context<'_>,
        tracker: &Rc<RootTracker>,
    ) -> Result<Rc<Self>> {
        let root = Self::allocate(ctx, FieldType::N0, true)?;
        let sup = get_super(ctx, tracker)?;
        root.as_node().make_root(ctx, sup);
        Ok(root)
    }

    pub(crate) fn base(&self) -> &NodeBase {
        &self.base
    }

    pub(crate) fn as_node(self: &Rc<Self>) -> Node {
        Node::Leaf(Rc::clone(self))
    }

    fn layout(&self) -> Result<LeafLayout<'_>> {
        LeafLayout::new(self.base.extent())
    }

    fn layout_mut(&self) -> Result<LeafLayoutMut<'_>> {
        LeafLayoutMut::new(self.base.extent())
    }

    /// Value record at an exact position; cursors re-resolve through this.
    pub fn get_p_value(&self, pos: &SearchPosition) -> Result<Onode> {
        self.layout()?.get_p_value(pos)
    }

    pub fn get_key_at(&self, pos: &SearchPosition) -> Result<ObjectKey> {
        self.layout()?.get_key_at(pos)
    }

    pub(crate) fn largest_key_bytes(&self) -> Result<Vec<u8>> {
        self.layout()?.largest_key_bytes()
    }

    pub(crate) fn entry_count(&self) -> Result<usize> {
        Ok(self.layout()?.cell_count() as usize)
    }

    pub(crate) fn collect_keys(&self, out: &mut Vec<ObjectKey>) -> Result<()> {
        out.extend(self.layout()?.keys_decoded()?);
        Ok(())
    }

    pub fn lookup_smallest(self: &Rc<Self>) -> Result<Rc<TreeCursor>> {
        let (pos, value) = {
            let layout = self.layout()?;
            if layout.is_empty() {
                ensure!(self.base.is_root(), "empty leaf outside the root");
                (SearchPosition::end(), None)
            } else {
                let pos = SearchPosition::begin();
                let value = layout.get_p_value(&pos)?;
                (pos, Some(value))
            }
        };
        self.get_or_track_cursor(pos, value)
    }

    pub fn lookup_largest(self: &Rc<Self>) -> Result<Rc<TreeCursor>> {
        let (pos, value) = {
            let layout = self.layout()?;
            if layout.is_empty() {
                ensure!(self.base.is_root(), "empty leaf outside the root");
                (SearchPosition::end(), None)
            } else {
                let (pos, value) = layout.get_largest_value()?;
                (pos, Some(value))
            }
        };
        self.get_or_track_cursor(pos, value)
    }

    pub(crate) fn lower_bound_tracked(
        self: &Rc<Self>,
        key: &[u8],
        history: &mut MatchHistory,
    ) -> Result<SearchResult> {
        let (pos, value, match_kind) = self.layout()?.lower_bound(key, history)?;
        let cursor = self.get_or_track_cursor(pos, value)?;
        Ok(SearchResult { cursor, match_kind })
    }

    /// Inserts one entry, splitting when the extent is full. Returns the
    /// cursor of the inserted entry.
    pub(crate) fn insert_value(
        self: &Rc<Self>,
        ctx: Context<'_>,
        key: &[u8],
        value: &Onode,
        pos: &SearchPosition,
        history: &MatchHistory,
    ) -> Result<Rc<TreeCursor>> {
        if pos.is_end() {
            ensure!(
                self.layout()?.is_level_tail(),
                "insert at the end of a non-tail leaf"
            );
        }
        ctx.prepare_mutate(self.base.extent())?;

        let (plan, free) = {
            let layout = self.layout()?;
            let plan = layout.evaluate_insert(key, history, pos)?;
            (plan, layout.free_size())
        };

        if free >= plan.size {
            let stored = self.layout_mut()?.insert(key, value, &plan)?;
            let cursor = self.track_insert(&plan.pos, plan.stage, stored)?;
            #[cfg(debug_assertions)]
            self.validate_tracked_cursors()?;
            return Ok(cursor);
        }

        debug!(
            laddr = self.base.laddr(),
            need = plan.size,
            free,
            "leaf full, splitting"
        );
        if self.base.is_root() {
            self.as_node().upgrade_root(ctx)?;
        }

        let (field_type, is_tail) = {
            let layout = self.layout()?;
            (layout.field_type(), layout.is_level_tail())
        };
        let right = LeafNode::allocate(ctx, field_type, is_tail)?;
        let result = {
            let mut layout = self.layout_mut()?;
            layout.split_insert(right.base.extent(), key, value, &plan)?
        };

        self.track_split(&result.split_pos, &right)?;
        let cursor = if result.is_insert_left {
            self.track_insert(&result.insert_pos, result.insert_stage, result.value)?
        } else {
            right.track_insert(&result.insert_pos, result.insert_stage, result.value)?
        };
        #[cfg(debug_assertions)]
        {
            self.validate_tracked_cursors()?;
            right.validate_tracked_cursors()?;
        }

        self.as_node().insert_parent(ctx, right.as_node())?;
        Ok(cursor)
    }

    /// Returns the tracked cursor at `pos`, or creates and tracks one. End
    /// positions always get a fresh untracked cursor.
    fn get_or_track_cursor(
        self: &Rc<Self>,
        pos: SearchPosition,
        value: Option<Onode>,
    ) -> Result<Rc<TreeCursor>> {
        if pos.is_end() {
            ensure!(
                self.layout()?.is_level_tail(),
                "end cursor on a non-tail leaf"
            );
            ensure!(value.is_none(), "end cursor cannot carry a value");
            return Ok(TreeCursor::create(Rc::clone(self), pos, None));
        }

        let existing = self
            .tracked_cursors
            .borrow()
            .get(&pos)
            .and_then(Weak::upgrade);
        match existing {
            Some(cursor) => {
                debug_assert!(Rc::ptr_eq(&cursor.leaf(), self));
                debug_assert_eq!(cursor.position(), pos);
                if let Some(value) = value {
                    cursor.set_value(value);
                }
                Ok(cursor)
            }
            None => {
                let value = value.ok_or_else(|| eyre!("live cursor requires a value"))?;
                Ok(TreeCursor::create(Rc::clone(self), pos, Some(value)))
            }
        }
    }

    /// Rewrites cursor state around an insert at `insert_pos`: caches at or
    /// past the start of the disturbed snapshot group are invalidated, and
    /// cursors inside the insert's stage window move up one index at that
    /// stage. Returns the tracked cursor of the new entry.
    fn track_insert(
        self: &Rc<Self>,
        insert_pos: &SearchPosition,
        stage: u8,
        value: Onode,
    ) -> Result<Rc<TreeCursor>> {
        let floor = insert_pos.with_index_at(STAGE_SNAP, 0);
        for (_, weak) in self.tracked_cursors.borrow().range(floor..) {
            if let Some(cursor) = weak.upgrade() {
                cursor.invalidate_value();
            }
        }

        let upper = insert_pos.with_index_at(stage, INDEX_END);
        let moved: Vec<Rc<TreeCursor>> = {
            let mut map = self.tracked_cursors.borrow_mut();
            let keys: SmallVec<[SearchPosition; 8]> =
                map.range(*insert_pos..upper).map(|(p, _)| *p).collect();
            keys.iter()
                .filter_map(|p| map.remove(p))
                .filter_map(|w| w.upgrade())
                .collect()
        };
        for cursor in &moved {
            let mut pos = cursor.position();
            pos.set_index_at(stage, pos.index_at(stage) + 1);
            cursor.update_track(Rc::clone(self), pos);
        }

        Ok(TreeCursor::create(Rc::clone(self), *insert_pos, Some(value)))
    }

    /// Re-homes every cursor at or past the split point onto the right
    /// sibling, with positions rewritten into its coordinates.
    fn track_split(self: &Rc<Self>, split_pos: &SearchPosition, right: &Rc<LeafNode>) -> Result<()> {
        let floor = split_pos.with_index_at(STAGE_SNAP, 0);
        for (_, weak) in self.tracked_cursors.borrow().range(floor..) {
            if let Some(cursor) = weak.upgrade() {
                cursor.invalidate_value();
            }
        }

        let moved: Vec<(SearchPosition, Rc<TreeCursor>)> = {
            let mut map = self.tracked_cursors.borrow_mut();
            let keys: SmallVec<[SearchPosition; 8]> =
                map.range(*split_pos..).map(|(p, _)| *p).collect();
            keys.iter()
                .filter_map(|p| map.remove(p).map(|w| (*p, w)))
                .filter_map(|(p, w)| w.upgrade().map(|c| (p, c)))
                .collect()
        };
        for (pos, cursor) in &moved {
            cursor.update_track(Rc::clone(right), pos.stage_sub(split_pos));
        }
        Ok(())
    }

    pub(crate) fn do_track_cursor(&self, pos: &SearchPosition, cursor: &Rc<TreeCursor>) {
        let mut map = self.tracked_cursors.borrow_mut();
        debug_assert!(
            map.get(pos).and_then(Weak::upgrade).is_none(),
            "position {} already tracks a live cursor",
            pos
        );
        map.insert(*pos, Rc::downgrade(cursor));
    }

    /// Called from a cursor's drop. The dying cursor's weak entry no longer
    /// upgrades, which is how it is distinguished from a live replacement
    /// that must be left alone.
    pub(crate) fn do_untrack_cursor(&self, pos: &SearchPosition) {
        let mut map = self.tracked_cursors.borrow_mut();
        let dead = map.get(pos).is_some_and(|w| w.upgrade().is_none());
        debug_assert!(dead, "dropping cursor not tracked at {}", pos);
        if dead {
            map.remove(pos);
        }
    }

    #[cfg(debug_assertions)]
    fn validate_tracked_cursors(self: &Rc<Self>) -> Result<()> {
        let layout = self.layout()?;
        for (pos, weak) in self.tracked_cursors.borrow().iter() {
            let cursor = weak
                .upgrade()
                .ok_or_else(|| eyre!("dead cursor tracked at {}", pos))?;
            ensure!(!pos.is_end(), "end cursor found in the tracking map");
            ensure!(cursor.position() == *pos, "cursor position diverged");
            ensure!(
                Rc::ptr_eq(&cursor.leaf(), self),
                "tracked cursor points at another leaf"
            );
            if let Some(cached) = cursor.cached_value() {
                ensure!(
                    cached == layout.get_p_value(pos)?,
                    "cursor cache diverged at {}",
                    pos
                );
            }
        }
        Ok(())
    }

    pub fn dump(&self) -> Result<String> {
        let mut out = self.layout()?.dump()?;
        out.push_str(&format!(
            "  tracked cursors: {}\n",
            self.tracked_cursors.borrow().len()
        ));
        Ok(out)
    }
}

impl Drop for LeafNode {
    fn drop(&mut self) {
        self.base.detach();
    }
}
