//! Interior extent layout.
//!
//! An interior cell holds only a separator key: the largest key of the
//! child it routes to. The child's address rides inline in the slot, so
//! navigation never touches cell content until the prefix hint is
//! inconclusive. A level-tail interior node additionally owns the tail
//! child slot in its header, routing every key greater than all separators;
//! non-tail nodes have exactly one child per cell because their parent
//! never routes such keys to them.

use std::cell::{Ref, RefMut};

use eyre::{ensure, Result};
use tracing::trace;
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{NODE_BLOCK_SIZE, NODE_HEADER_SIZE};
use crate::layout::{
    choose_split_index, extract_prefix, flat_lower_bound_by_key, flat_lower_bound_by_position,
    plan_insert_position, staged_position_of, FieldType, InsertPlan, NodeHeader, NodeType,
    SplitResult,
};
use crate::storage::{Laddr, NodeExtent, LADDR_NULL};
use crate::tree::key::{KeySegments, ObjectKey};
use crate::tree::position::{MatchHistory, SearchPosition, STAGE_NAME, STAGE_PLACEMENT, STAGE_SNAP};

pub const INTERIOR_SLOT_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct InteriorSlot {
    prefix: [u8; 4],
    child: U64,
    offset: U16,
    key_len: U16,
}

const _: () = assert!(std::mem::size_of::<InteriorSlot>() == INTERIOR_SLOT_SIZE);

impl InteriorSlot {
    fn new(key: &[u8], child: Laddr, offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            child: U64::new(child),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }

    fn child(&self) -> Laddr {
        self.child.get()
    }
}

pub struct InteriorLayout<'a> {
    data: Ref<'a, [u8]>,
}

pub struct InteriorLayoutMut<'a> {
    data: RefMut<'a, [u8]>,
}

fn check_interior(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == NODE_BLOCK_SIZE,
        "invalid extent size: {} != {}",
        data.len(),
        NODE_BLOCK_SIZE
    );
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.node_type()? == NodeType::Internal,
        "expected an interior extent, found {:?}",
        header.node_type()?
    );
    header.field_type()?;
    Ok(())
}

fn slot_at(data: &[u8], index: usize) -> Result<&InteriorSlot> {
    let header = NodeHeader::from_bytes(data).unwrap(); // INVARIANT: extent validated on construction
    ensure!(
        index < header.cell_count() as usize,
        "slot index {} out of bounds (cell_count={})",
        index,
        header.cell_count()
    );
    let offset = NODE_HEADER_SIZE + index * INTERIOR_SLOT_SIZE;
    InteriorSlot::ref_from_bytes(&data[offset..offset + INTERIOR_SLOT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read interior slot {}: {:?}", index, e))
}

fn key_bytes_at(data: &[u8], index: usize) -> Result<&[u8]> {
    let slot = slot_at(data, index)?;
    let start = slot.offset.get() as usize;
    let len = slot.key_len.get() as usize;
    ensure!(
        start + len <= NODE_BLOCK_SIZE,
        "interior cell {} extends beyond the extent",
        index
    );
    Ok(&data[start..start + len])
}

fn collect_keys(data: &[u8]) -> Result<Vec<&[u8]>> {
    let count = NodeHeader::from_bytes(data).unwrap().cell_count() as usize; // INVARIANT: validated
    (0..count).map(|i| key_bytes_at(data, i)).collect()
}

impl<'a> InteriorLayout<'a> {
    pub fn new(extent: &'a NodeExtent) -> Result<Self> {
        let data = extent.read();
        check_interior(&data)?;
        Ok(Self { data })
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_bytes(&self.data).unwrap() // INVARIANT: extent validated in new()
    }

    pub fn cell_count(&self) -> u16 {
        self.header().cell_count()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0 && self.header().tail_child() == LADDR_NULL
    }

    pub fn free_size(&self) -> usize {
        (self.header().free_end() - self.header().free_start()) as usize
    }

    pub fn level(&self) -> u8 {
        self.header().level()
    }

    pub fn field_type(&self) -> FieldType {
        self.header().field_type().unwrap() // INVARIANT: extent validated in new()
    }

    pub fn is_level_tail(&self) -> bool {
        self.header().is_level_tail()
    }

    /// Routes a key: the child of the first separator at or above it, or
    /// the tail child when it is above every separator.
    pub fn lower_bound(
        &self,
        key: &[u8],
        history: &mut MatchHistory,
    ) -> Result<(SearchPosition, Laddr)> {
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_key(&keys, key);

        if flat == keys.len() {
            ensure!(
                self.is_level_tail(),
                "key routed past every separator of a non-tail interior node"
            );
            return Ok((SearchPosition::end(), self.header().tail_child()));
        }

        let sep = KeySegments::parse(keys[flat])?;
        let probe = KeySegments::parse(key)?;
        history.record(STAGE_PLACEMENT, probe.placement.cmp(sep.placement));
        if probe.placement == sep.placement {
            history.record(STAGE_NAME, probe.name.cmp(sep.name));
            if probe.name == sep.name {
                history.record(STAGE_SNAP, probe.snapshot.cmp(sep.snapshot));
            }
        }

        let pos = staged_position_of(&keys, flat)?;
        Ok((pos, slot_at(&self.data, flat)?.child()))
    }

    /// Child address at an exact position; the end position resolves to the
    /// tail child and is valid only on the level-tail node.
    pub fn get_p_value(&self, pos: &SearchPosition) -> Result<Laddr> {
        if pos.is_end() {
            ensure!(
                self.is_level_tail(),
                "end position on a non-tail interior node"
            );
            let tail = self.header().tail_child();
            ensure!(tail != LADDR_NULL, "tail child slot is unset");
            return Ok(tail);
        }
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_position(&keys, pos)?;
        ensure!(
            flat < keys.len() && staged_position_of(&keys, flat)? == *pos,
            "position {} does not address an interior entry",
            pos
        );
        Ok(slot_at(&self.data, flat)?.child())
    }

    pub fn get_key_at(&self, pos: &SearchPosition) -> Result<ObjectKey> {
        ensure!(!pos.is_end(), "no separator at the end position");
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_position(&keys, pos)?;
        ensure!(
            flat < keys.len() && staged_position_of(&keys, flat)? == *pos,
            "position {} does not address an interior entry",
            pos
        );
        ObjectKey::decode(keys[flat])
    }

    pub fn largest_key_bytes(&self) -> Result<Vec<u8>> {
        let count = self.cell_count() as usize;
        ensure!(count > 0, "largest key of an empty interior node");
        Ok(key_bytes_at(&self.data, count - 1)?.to_vec())
    }

    /// Plans inserting `key` as a separator routing to a child.
    pub fn evaluate_insert(&self, key: &[u8], hint: &SearchPosition) -> Result<InsertPlan> {
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_key(&keys, key);
        ensure!(
            keys.get(flat).copied() != Some(key),
            "separator already present"
        );

        let (pos, stage) = plan_insert_position(&keys, key, flat)?;
        debug_assert!(
            hint.is_end() || pos <= *hint,
            "planned position {} beyond hint {}",
            pos,
            hint
        );

        Ok(InsertPlan {
            pos,
            stage,
            size: INTERIOR_SLOT_SIZE + key.len(),
        })
    }

    /// Every child slot in routing order: each separator's position and
    /// child address, then the tail child on the level-tail node.
    pub fn entries(&self) -> Result<Vec<(SearchPosition, Laddr)>> {
        let keys = collect_keys(&self.data)?;
        let mut out = Vec::with_capacity(keys.len() + 1);
        for flat in 0..keys.len() {
            out.push((
                staged_position_of(&keys, flat)?,
                slot_at(&self.data, flat)?.child(),
            ));
        }
        if self.is_level_tail() {
            out.push((SearchPosition::end(), self.header().tail_child()));
        }
        Ok(out)
    }

    pub fn dump(&self) -> Result<String> {
        use std::fmt::Write as _;
        let mut out = String::new();
        writeln!(
            out,
            "interior level={} tail={} entries={} free={}",
            self.level(),
            self.is_level_tail(),
            self.cell_count(),
            self.free_size()
        )?;
        let keys = collect_keys(&self.data)?;
        for flat in 0..keys.len() {
            writeln!(
                out,
                "  {} {} -> {}",
                staged_position_of(&keys, flat)?,
                ObjectKey::decode(keys[flat])?,
                slot_at(&self.data, flat)?.child()
            )?;
        }
        if self.is_level_tail() {
            writeln!(out, "  (end) -> {}", self.header().tail_child())?;
        }
        Ok(out)
    }
}

impl<'a> InteriorLayoutMut<'a> {
    pub fn new(extent: &'a NodeExtent) -> Result<Self> {
        let data = extent.write()?;
        check_interior(&data)?;
        Ok(Self { data })
    }

    /// Initializes a fresh extent as an empty interior node at `level`.
    pub fn init(
        extent: &'a NodeExtent,
        field_type: FieldType,
        level: u8,
        is_level_tail: bool,
    ) -> Result<Self> {
        ensure!(level > 0, "interior node cannot sit at level 0");
        let mut data = extent.write()?;
        ensure!(
            data.len() == NODE_BLOCK_SIZE,
            "invalid extent size: {} != {}",
            data.len(),
            NODE_BLOCK_SIZE
        );
        NodeHeader::init(&mut data, NodeType::Internal, field_type, level, is_level_tail)?;
        Ok(Self { data })
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_bytes_mut(&mut self.data).unwrap() // INVARIANT: extent validated in new()
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_bytes(&self.data).unwrap() // INVARIANT: extent validated in new()
    }

    pub fn cell_count(&self) -> u16 {
        self.header().cell_count()
    }

    pub fn free_size(&self) -> usize {
        (self.header().free_end() - self.header().free_start()) as usize
    }

    pub fn is_level_tail(&self) -> bool {
        self.header().is_level_tail()
    }

    pub fn field_type(&self) -> FieldType {
        self.header().field_type().unwrap() // INVARIANT: extent validated in new()
    }

    pub fn set_tail_child(&mut self, laddr: Laddr) -> Result<()> {
        ensure!(
            self.is_level_tail(),
            "tail child slot exists only on the level-tail node"
        );
        self.header_mut().set_tail_child(laddr);
        Ok(())
    }

    /// Repoints one child slot, verifying the address being replaced.
    pub fn replace_child_addr(
        &mut self,
        pos: &SearchPosition,
        new_addr: Laddr,
        expected_old: Laddr,
    ) -> Result<()> {
        if pos.is_end() {
            ensure!(
                self.is_level_tail(),
                "end position on a non-tail interior node"
            );
            let header = self.header_mut();
            ensure!(
                header.tail_child() == expected_old,
                "tail child is {}, expected {}",
                header.tail_child(),
                expected_old
            );
            header.set_tail_child(new_addr);
            return Ok(());
        }

        let (flat, slot) = {
            let keys = collect_keys(&self.data)?;
            let flat = flat_lower_bound_by_position(&keys, pos)?;
            ensure!(
                flat < keys.len() && staged_position_of(&keys, flat)? == *pos,
                "position {} does not address an interior entry",
                pos
            );
            (flat, *slot_at(&self.data, flat)?)
        };
        ensure!(
            slot.child() == expected_old,
            "child at {} is {}, expected {}",
            pos,
            slot.child(),
            expected_old
        );

        let mut updated = slot;
        updated.child = U64::new(new_addr);
        let offset = NODE_HEADER_SIZE + flat * INTERIOR_SLOT_SIZE;
        self.data[offset..offset + INTERIOR_SLOT_SIZE].copy_from_slice(updated.as_bytes());
        Ok(())
    }

    pub fn insert(&mut self, key: &[u8], child: Laddr, plan: &InsertPlan) -> Result<()> {
        debug_assert_eq!(plan.size, INTERIOR_SLOT_SIZE + key.len());
        ensure!(
            self.free_size() >= plan.size,
            "not enough free space: need {}, have {}",
            plan.size,
            self.free_size()
        );

        let flat = {
            let keys = collect_keys(&self.data)?;
            flat_lower_bound_by_position(&keys, &plan.pos)?
        };
        self.insert_cell_at(flat, key, child)
    }

    fn insert_cell_at(&mut self, flat: usize, key: &[u8], child: Laddr) -> Result<()> {
        let count = self.cell_count() as usize;
        ensure!(flat <= count, "insert index {} out of bounds", flat);

        let new_free_end = self.header().free_end() as usize - key.len();
        self.data[new_free_end..new_free_end + key.len()].copy_from_slice(key);

        for i in (flat..count).rev() {
            let src = NODE_HEADER_SIZE + i * INTERIOR_SLOT_SIZE;
            let dst = src + INTERIOR_SLOT_SIZE;
            self.data.copy_within(src..src + INTERIOR_SLOT_SIZE, dst);
        }

        let slot = InteriorSlot::new(key, child, new_free_end as u16);
        let slot_offset = NODE_HEADER_SIZE + flat * INTERIOR_SLOT_SIZE;
        self.data[slot_offset..slot_offset + INTERIOR_SLOT_SIZE]
            .copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(count as u16 + 1);
        header.set_free_start(header.free_start() + INTERIOR_SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);
        Ok(())
    }

    fn push_cell(&mut self, key: &[u8], child: Laddr) -> Result<()> {
        let count = self.cell_count() as usize;
        self.insert_cell_at(count, key, child)
    }

    /// Splits this node into itself plus a fresh right sibling while
    /// inserting one separator. The tail child slot and level-tail flag
    /// move to the right sibling; the right extent must already be
    /// initialized as an empty interior node at this level carrying the
    /// flag.
    pub fn split_insert(
        &mut self,
        right: &NodeExtent,
        key: &[u8],
        child: Laddr,
        plan: &InsertPlan,
    ) -> Result<SplitResult<Laddr>> {
        let entries: Vec<(Vec<u8>, Laddr)> = {
            let keys = collect_keys(&self.data)?;
            keys.iter()
                .enumerate()
                .map(|(i, k)| Ok((k.to_vec(), slot_at(&self.data, i)?.child())))
                .collect::<Result<_>>()?
        };
        let refs: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();

        let insert_flat = flat_lower_bound_by_key(&refs, key);
        ensure!(
            refs.get(insert_flat).copied() != Some(key),
            "split-insert of a separator that is already present"
        );

        let sizes: Vec<usize> = refs.iter().map(|k| k.len()).collect();
        let split_flat = choose_split_index(&refs, &sizes, insert_flat, key.len())?;
        let split_pos = staged_position_of(&refs, split_flat)?;
        let is_insert_left = insert_flat < split_flat;
        let was_tail = self.is_level_tail();
        let tail_child = self.header().tail_child();
        let level = self.header().level();

        let mut right_layout = InteriorLayoutMut::new(right)?;
        ensure!(
            right_layout.cell_count() == 0
                && right_layout.is_level_tail() == was_tail
                && right_layout.header().level() == level,
            "right sibling not initialized for split"
        );

        for (i, (k, c)) in entries.iter().enumerate().skip(split_flat) {
            if !is_insert_left && i == insert_flat {
                right_layout.push_cell(key, child)?;
            }
            right_layout.push_cell(k, *c)?;
        }
        if !is_insert_left && insert_flat >= entries.len() {
            right_layout.push_cell(key, child)?;
        }
        if was_tail {
            right_layout.set_tail_child(tail_child)?;
        }

        let (insert_pos, insert_stage) = if is_insert_left {
            (plan.pos, plan.stage)
        } else {
            let right_refs: Vec<&[u8]> = refs[split_flat..].to_vec();
            plan_insert_position(&right_refs, key, insert_flat - split_flat)?
        };

        let field_type = self.field_type();
        NodeHeader::init(&mut self.data, NodeType::Internal, field_type, level, false)?;
        for (i, (k, c)) in entries.iter().enumerate().take(split_flat) {
            if is_insert_left && i == insert_flat {
                self.push_cell(key, child)?;
            }
            self.push_cell(k, *c)?;
        }

        trace!(%split_pos, is_insert_left, level, "interior split");

        Ok(SplitResult {
            split_pos,
            is_insert_left,
            insert_pos,
            insert_stage,
            value: child,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(pool: u64, name: &str) -> Vec<u8> {
        ObjectKey::new(0, pool, 0, "ns", name, 0, 0).encode()
    }

    fn make_interior(tail: bool) -> NodeExtent {
        let extent = NodeExtent::new_allocated(1);
        InteriorLayoutMut::init(&extent, FieldType::N0, 1, tail).unwrap();
        extent
    }

    fn insert_one(extent: &NodeExtent, key: &[u8], child: Laddr) {
        let plan = {
            let layout = InteriorLayout::new(extent).unwrap();
            layout.evaluate_insert(key, &SearchPosition::end()).unwrap()
        };
        let mut layout = InteriorLayoutMut::new(extent).unwrap();
        layout.insert(key, child, &plan).unwrap();
    }

    #[test]
    fn interior_slot_is_16_bytes() {
        assert_eq!(std::mem::size_of::<InteriorSlot>(), INTERIOR_SLOT_SIZE);
    }

    #[test]
    fn lower_bound_routes_through_separators() {
        let extent = make_interior(true);
        insert_one(&extent, &enc(1, "m"), 10);
        insert_one(&extent, &enc(2, "m"), 20);
        {
            let mut layout = InteriorLayoutMut::new(&extent).unwrap();
            layout.set_tail_child(30).unwrap();
        }

        let layout = InteriorLayout::new(&extent).unwrap();
        let mut history = MatchHistory::new();

        let (pos, child) = layout.lower_bound(&enc(1, "a"), &mut history).unwrap();
        assert_eq!(child, 10);
        assert_eq!(pos, SearchPosition::new(0, 0, 0));

        let (pos, child) = layout.lower_bound(&enc(1, "z"), &mut history).unwrap();
        assert_eq!(child, 20);
        assert_eq!(pos, SearchPosition::new(1, 0, 0));

        let (pos, child) = layout.lower_bound(&enc(9, "a"), &mut history).unwrap();
        assert!(pos.is_end());
        assert_eq!(child, 30);
    }

    #[test]
    fn replace_child_addr_checks_the_old_address() {
        let extent = make_interior(true);
        insert_one(&extent, &enc(1, "m"), 10);
        {
            let mut layout = InteriorLayoutMut::new(&extent).unwrap();
            layout.set_tail_child(30).unwrap();
        }

        let mut layout = InteriorLayoutMut::new(&extent).unwrap();
        let pos = SearchPosition::new(0, 0, 0);

        assert!(layout.replace_child_addr(&pos, 11, 99).is_err());
        layout.replace_child_addr(&pos, 11, 10).unwrap();
        layout
            .replace_child_addr(&SearchPosition::end(), 31, 30)
            .unwrap();
        drop(layout);

        let layout = InteriorLayout::new(&extent).unwrap();
        assert_eq!(layout.get_p_value(&pos).unwrap(), 11);
        assert_eq!(layout.get_p_value(&SearchPosition::end()).unwrap(), 31);
    }

    #[test]
    fn split_insert_moves_tail_child_right() {
        let extent = make_interior(true);
        for i in 0..6 {
            insert_one(&extent, &enc(i, "m"), 10 + i);
        }
        {
            let mut layout = InteriorLayoutMut::new(&extent).unwrap();
            layout.set_tail_child(99).unwrap();
        }

        let key = enc(6, "m");
        let plan = {
            let layout = InteriorLayout::new(&extent).unwrap();
            layout.evaluate_insert(&key, &SearchPosition::end()).unwrap()
        };

        let right = NodeExtent::new_allocated(2);
        InteriorLayoutMut::init(&right, FieldType::N0, 1, true).unwrap();

        let result = {
            let mut layout = InteriorLayoutMut::new(&extent).unwrap();
            layout.split_insert(&right, &key, 16, &plan).unwrap()
        };

        let left = InteriorLayout::new(&extent).unwrap();
        let right_layout = InteriorLayout::new(&right).unwrap();

        assert!(!left.is_level_tail());
        assert!(right_layout.is_level_tail());
        assert_eq!(right_layout.get_p_value(&SearchPosition::end()).unwrap(), 99);
        assert_eq!(
            left.cell_count() + right_layout.cell_count(),
            7,
            "a separator was lost in the split"
        );
        if !result.is_insert_left {
            assert_eq!(right_layout.get_p_value(&result.insert_pos).unwrap(), 16);
        }
    }

    #[test]
    fn get_p_value_end_requires_level_tail() {
        let extent = make_interior(false);
        insert_one(&extent, &enc(1, "m"), 10);

        let layout = InteriorLayout::new(&extent).unwrap();
        assert!(layout.get_p_value(&SearchPosition::end()).is_err());
    }
}
