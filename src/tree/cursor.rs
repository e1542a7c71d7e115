//! Tree cursors.
//!
//! A cursor is a stable handle to one leaf entry: the leaf, the staged
//! position inside it, and a cached copy of the value record. The owning
//! leaf tracks every live cursor by position and rewrites or invalidates
//! them as inserts and splits reshape the node, so a cursor held across
//! structural mutation keeps resolving to the same logical entry.
//!
//! The end cursor is the one exception: it marks past-the-end (and the
//! insertion slot on the level-tail leaf), carries no value, and is never
//! tracked.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use eyre::{ensure, Result};

use crate::tree::key::{ObjectKey, Onode};
use crate::tree::leaf::LeafNode;
use crate::tree::position::SearchPosition;

pub struct TreeCursor {
    leaf: RefCell<Rc<LeafNode>>,
    position: Cell<SearchPosition>,
    value: Cell<Option<Onode>>,
}

impl TreeCursor {
    /// Creates a cursor and, unless it is the end cursor, registers it with
    /// its leaf. A live cursor is born with the leaf's current value at its
    /// position; an end cursor is born empty.
    pub(crate) fn create(
        leaf: Rc<LeafNode>,
        position: SearchPosition,
        value: Option<Onode>,
    ) -> Rc<Self> {
        debug_assert_eq!(
            position.is_end(),
            value.is_none(),
            "live cursors carry a value, end cursors do not"
        );
        let cursor = Rc::new(Self {
            leaf: RefCell::new(leaf),
            position: Cell::new(position),
            value: Cell::new(value),
        });
        if !position.is_end() {
            cursor.leaf.borrow().do_track_cursor(&position, &cursor);
        }
        cursor
    }

    pub fn is_end(&self) -> bool {
        self.position.get().is_end()
    }

    pub fn position(&self) -> SearchPosition {
        self.position.get()
    }

    pub fn leaf(&self) -> Rc<LeafNode> {
        Rc::clone(&self.leaf.borrow())
    }

    /// The value record at the cursor. Re-resolves from the leaf when the
    /// cache was invalidated by a structural change. Calling this on the
    /// end cursor is a caller bug.
    pub fn value(&self) -> Result<Onode> {
        ensure!(!self.is_end(), "end cursor has no value");
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let value = self.leaf.borrow().get_p_value(&self.position.get())?;
        self.value.set(Some(value));
        Ok(value)
    }

    /// The object key at the cursor.
    pub fn key(&self) -> Result<ObjectKey> {
        ensure!(!self.is_end(), "end cursor has no key");
        self.leaf.borrow().get_key_at(&self.position.get())
    }

    /// Drops the cached value; the next `value()` re-resolves it.
    pub(crate) fn invalidate_value(&self) {
        self.value.set(None);
    }

    /// The cache as it stands, without resolving.
    pub(crate) fn cached_value(&self) -> Option<Onode> {
        self.value.get()
    }

    /// Fills the cache. An already-populated cache must agree.
    pub(crate) fn set_value(&self, value: Onode) {
        match self.value.get() {
            None => self.value.set(Some(value)),
            Some(cached) => debug_assert_eq!(cached, value, "cursor cache diverged from leaf"),
        }
    }

    /// Re-homes the cursor after the caller removed it from its previous
    /// leaf's tracking map. The cache must already be invalidated and the
    /// new position must be live.
    pub(crate) fn update_track(
        self: &Rc<Self>,
        leaf: Rc<LeafNode>,
        position: SearchPosition,
    ) {
        debug_assert!(!position.is_end(), "cannot re-home a cursor to the end");
        debug_assert!(!self.is_end(), "end cursors are never tracked");
        debug_assert!(
            self.value.get().is_none(),
            "cursor cache must be invalidated before re-homing"
        );
        *self.leaf.borrow_mut() = leaf;
        self.position.set(position);
        self.leaf.borrow().do_track_cursor(&position, self);
    }
}

impl Drop for TreeCursor {
    fn drop(&mut self) {
        let position = self.position.get();
        if !position.is_end() {
            self.leaf.borrow().do_untrack_cursor(&position);
        }
    }
}

impl std::fmt::Debug for TreeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCursor")
            .field("position", &self.position.get())
            .field("cached", &self.value.get().is_some())
            .finish()
    }
}
