//! The tree facade.
//!
//! `OnodeTree` binds one tree identity (a root tracker) to the node layer
//! and exposes the operation surface callers use: format, load, point
//! lookups, and insert. Each call threads the caller's transaction context
//! through; the tree itself holds no storage state beyond the tracker.

use std::rc::Rc;

use eyre::Result;

use crate::storage::Context;
use crate::tree::cursor::TreeCursor;
use crate::tree::key::{ObjectKey, Onode};
use crate::tree::node::{Node, RootTracker, SearchResult};
use crate::tree::position::MatchKind;

pub struct OnodeTree {
    tracker: Rc<RootTracker>,
}

impl OnodeTree {
    pub fn new() -> Self {
        Self {
            tracker: RootTracker::new(),
        }
    }

    /// Formats an empty tree: a lone leaf root, written at commit.
    pub fn mkfs(&self, ctx: Context<'_>) -> Result<()> {
        Node::mkfs(ctx, &self.tracker)
    }

    /// The live root, loading it from the extent file when necessary.
    pub fn root(&self, ctx: Context<'_>) -> Result<Node> {
        if let Some(root) = self.tracker.get_root() {
            return Ok(root);
        }
        Node::load_root(ctx, &self.tracker)
    }

    pub fn lookup_smallest(&self, ctx: Context<'_>) -> Result<Rc<TreeCursor>> {
        self.root(ctx)?.lookup_smallest(ctx)
    }

    pub fn lookup_largest(&self, ctx: Context<'_>) -> Result<Rc<TreeCursor>> {
        self.root(ctx)?.lookup_largest(ctx)
    }

    /// Cursor at or after `key`, with whether it is an exact hit.
    pub fn lower_bound(&self, ctx: Context<'_>, key: &ObjectKey) -> Result<SearchResult> {
        self.root(ctx)?.lower_bound(ctx, key)
    }

    /// Exact-match point lookup.
    pub fn get(&self, ctx: Context<'_>, key: &ObjectKey) -> Result<Option<Onode>> {
        let found = self.lower_bound(ctx, key)?;
        match found.match_kind {
            MatchKind::Eq => Ok(Some(found.cursor.value()?)),
            MatchKind::Ne => Ok(None),
        }
    }

    /// Inserts `key -> value`; an already-present key is returned untouched
    /// with `false`.
    pub fn insert(
        &self,
        ctx: Context<'_>,
        key: &ObjectKey,
        value: &Onode,
    ) -> Result<(Rc<TreeCursor>, bool)> {
        self.root(ctx)?.insert(ctx, key, value)
    }

    /// Number of levels from root to leaves.
    pub fn height(&self, ctx: Context<'_>) -> Result<u8> {
        Ok(self.root(ctx)?.level()? + 1)
    }

    /// Total entries, by walking every node.
    pub fn entry_count(&self, ctx: Context<'_>) -> Result<usize> {
        fn walk(ctx: Context<'_>, node: &Node) -> Result<usize> {
            match node {
                Node::Leaf(leaf) => leaf.entry_count(),
                Node::Interior(interior) => {
                    let mut total = 0;
                    for (pos, addr) in interior.child_entries()? {
                        let child = interior.get_or_track_child(ctx, &pos, addr)?;
                        total += walk(ctx, &child)?;
                    }
                    Ok(total)
                }
            }
        }
        let root = self.root(ctx)?;
        walk(ctx, &root)
    }

    /// Ordered key sequence of the whole tree, for verification.
    pub fn collect_keys(&self, ctx: Context<'_>) -> Result<Vec<ObjectKey>> {
        fn walk(ctx: Context<'_>, node: &Node, out: &mut Vec<ObjectKey>) -> Result<()> {
            match node {
                Node::Leaf(leaf) => leaf.collect_keys(out),
                Node::Interior(interior) => {
                    for (pos, addr) in interior.child_entries()? {
                        let child = interior.get_or_track_child(ctx, &pos, addr)?;
                        walk(ctx, &child, out)?;
                    }
                    Ok(())
                }
            }
        }
        let root = self.root(ctx)?;
        let mut out = Vec::new();
        walk(ctx, &root, &mut out)?;
        Ok(out)
    }
}

impl Default for OnodeTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ExtentManager;
    use crate::tree::position::MatchKind;
    use tempfile::tempdir;

    fn key(pool: u64, name: &str) -> ObjectKey {
        ObjectKey::new(0, pool, 0, "ns", name, 0, 0)
    }

    #[test]
    fn mkfs_insert_get_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = ExtentManager::create(dir.path().join("t.db")).unwrap();
        let tree = OnodeTree::new();
        let tx = manager.begin();
        let ctx = Context::new(&manager, &tx);

        tree.mkfs(ctx).unwrap();
        let (cursor, inserted) = tree
            .insert(ctx, &key(1, "first"), &Onode::new(512, 0, 0))
            .unwrap();
        assert!(inserted);
        assert_eq!(cursor.value().unwrap(), Onode::new(512, 0, 0));

        assert_eq!(
            tree.get(ctx, &key(1, "first")).unwrap(),
            Some(Onode::new(512, 0, 0))
        );
        assert_eq!(tree.get(ctx, &key(1, "second")).unwrap(), None);
    }

    #[test]
    fn lower_bound_lands_on_the_successor() {
        let dir = tempdir().unwrap();
        let manager = ExtentManager::create(dir.path().join("t.db")).unwrap();
        let tree = OnodeTree::new();
        let tx = manager.begin();
        let ctx = Context::new(&manager, &tx);

        tree.mkfs(ctx).unwrap();
        tree.insert(ctx, &key(1, "b"), &Onode::new(1, 0, 0)).unwrap();
        tree.insert(ctx, &key(1, "d"), &Onode::new(2, 0, 0)).unwrap();

        let found = tree.lower_bound(ctx, &key(1, "c")).unwrap();
        assert_eq!(found.match_kind, MatchKind::Ne);
        assert_eq!(found.cursor.key().unwrap(), key(1, "d"));

        let past = tree.lower_bound(ctx, &key(9, "z")).unwrap();
        assert_eq!(past.match_kind, MatchKind::Ne);
        assert!(past.cursor.is_end());
    }
}
