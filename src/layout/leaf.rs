//! Leaf extent layout.
//!
//! Leaf cells hold `encoded key | onode record`. The onode is fixed-layout,
//! so a cell's value sits at a known offset behind its key and no length
//! prefix is needed. Slots carry a 4-byte key prefix hint ahead of the full
//! comparison, as everywhere else in this crate.

use std::cell::{Ref, RefMut};

use eyre::{ensure, Result};
use tracing::trace;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{NODE_BLOCK_SIZE, NODE_HEADER_SIZE};
use crate::layout::{
    choose_split_index, extract_prefix, flat_lower_bound_by_key, flat_lower_bound_by_position,
    plan_insert_position, staged_position_of, FieldType, InsertPlan, NodeHeader, NodeType,
    SplitResult,
};
use crate::storage::NodeExtent;
use crate::tree::key::{KeySegments, ObjectKey, Onode, ONODE_SIZE};
use crate::tree::position::{
    MatchHistory, MatchKind, SearchPosition, STAGE_NAME, STAGE_PLACEMENT, STAGE_SNAP,
};

pub const LEAF_SLOT_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct LeafSlot {
    prefix: [u8; 4],
    offset: U16,
    key_len: U16,
}

const _: () = assert!(std::mem::size_of::<LeafSlot>() == LEAF_SLOT_SIZE);

impl LeafSlot {
    fn new(key: &[u8], offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }
}

pub struct LeafLayout<'a> {
    data: Ref<'a, [u8]>,
}

pub struct LeafLayoutMut<'a> {
    data: RefMut<'a, [u8]>,
}

fn check_leaf(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == NODE_BLOCK_SIZE,
        "invalid extent size: {} != {}",
        data.len(),
        NODE_BLOCK_SIZE
    );
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.node_type()? == NodeType::Leaf,
        "expected a leaf extent, found {:?}",
        header.node_type()?
    );
    header.field_type()?;
    Ok(())
}

fn slot_at(data: &[u8], index: usize) -> Result<&LeafSlot> {
    let header = NodeHeader::from_bytes(data).unwrap(); // INVARIANT: extent validated on construction
    ensure!(
        index < header.cell_count() as usize,
        "slot index {} out of bounds (cell_count={})",
        index,
        header.cell_count()
    );
    let offset = NODE_HEADER_SIZE + index * LEAF_SLOT_SIZE;
    LeafSlot::ref_from_bytes(&data[offset..offset + LEAF_SLOT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read leaf slot {}: {:?}", index, e))
}

fn key_bytes_at(data: &[u8], index: usize) -> Result<&[u8]> {
    let slot = slot_at(data, index)?;
    let start = slot.offset.get() as usize;
    let len = slot.key_len.get() as usize;
    ensure!(
        start + len + ONODE_SIZE <= NODE_BLOCK_SIZE,
        "leaf cell {} extends beyond the extent",
        index
    );
    Ok(&data[start..start + len])
}

fn onode_at(data: &[u8], index: usize) -> Result<Onode> {
    let slot = slot_at(data, index)?;
    let start = slot.offset.get() as usize + slot.key_len.get() as usize;
    Onode::from_bytes(&data[start..start + ONODE_SIZE])
}

fn collect_keys(data: &[u8]) -> Result<Vec<&[u8]>> {
    let count = NodeHeader::from_bytes(data).unwrap().cell_count() as usize; // INVARIANT: validated
    (0..count).map(|i| key_bytes_at(data, i)).collect()
}

/// Records per-stage comparison evidence of `key` against `entry`.
fn record_history(history: &mut MatchHistory, key: &[u8], entry: &[u8]) -> Result<()> {
    let k = KeySegments::parse(key)?;
    let e = KeySegments::parse(entry)?;
    history.record(STAGE_PLACEMENT, k.placement.cmp(e.placement));
    if k.placement == e.placement {
        history.record(STAGE_NAME, k.name.cmp(e.name));
        if k.name == e.name {
            history.record(STAGE_SNAP, k.snapshot.cmp(e.snapshot));
        }
    }
    Ok(())
}

impl<'a> LeafLayout<'a> {
    pub fn new(extent: &'a NodeExtent) -> Result<Self> {
        let data = extent.read();
        check_leaf(&data)?;
        Ok(Self { data })
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_bytes(&self.data).unwrap() // INVARIANT: extent validated in new()
    }

    pub fn cell_count(&self) -> u16 {
        self.header().cell_count()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
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

    /// Lower bound by encoded key. Landing past every entry yields the end
    /// position, which only the level-tail leaf may produce.
    pub fn lower_bound(
        &self,
        key: &[u8],
        history: &mut MatchHistory,
    ) -> Result<(SearchPosition, Option<Onode>, MatchKind)> {
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_key(&keys, key);

        if let Some(probe) = keys.get(flat.min(keys.len().saturating_sub(1))) {
            if !keys.is_empty() {
                record_history(history, key, probe)?;
            }
        }

        if flat == keys.len() {
            debug_assert!(
                self.is_level_tail(),
                "search past the last entry of a non-tail leaf"
            );
            return Ok((SearchPosition::end(), None, MatchKind::Ne));
        }

        let pos = staged_position_of(&keys, flat)?;
        let kind = if keys[flat] == key {
            MatchKind::Eq
        } else {
            MatchKind::Ne
        };
        Ok((pos, Some(onode_at(&self.data, flat)?), kind))
    }

    pub fn get_p_value(&self, pos: &SearchPosition) -> Result<Onode> {
        ensure!(!pos.is_end(), "no value at the end position of a leaf");
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_position(&keys, pos)?;
        ensure!(
            flat < keys.len() && staged_position_of(&keys, flat)? == *pos,
            "position {} does not address a leaf entry",
            pos
        );
        onode_at(&self.data, flat)
    }

    pub fn get_largest_value(&self) -> Result<(SearchPosition, Onode)> {
        let keys = collect_keys(&self.data)?;
        ensure!(!keys.is_empty(), "largest value of an empty leaf");
        let flat = keys.len() - 1;
        Ok((staged_position_of(&keys, flat)?, onode_at(&self.data, flat)?))
    }

    pub fn get_key_at(&self, pos: &SearchPosition) -> Result<ObjectKey> {
        ensure!(!pos.is_end(), "no key at the end position of a leaf");
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_position(&keys, pos)?;
        ensure!(
            flat < keys.len() && staged_position_of(&keys, flat)? == *pos,
            "position {} does not address a leaf entry",
            pos
        );
        ObjectKey::decode(keys[flat])
    }

    pub fn largest_key_bytes(&self) -> Result<Vec<u8>> {
        let count = self.cell_count() as usize;
        ensure!(count > 0, "largest key of an empty leaf");
        Ok(key_bytes_at(&self.data, count - 1)?.to_vec())
    }

    /// Plans an insert. The landing position is derived from the node's own
    /// neighbor entries, which is authoritative at node granularity; the
    /// descent history is surfaced for diagnosis.
    pub fn evaluate_insert(
        &self,
        key: &[u8],
        history: &MatchHistory,
        hint: &SearchPosition,
    ) -> Result<InsertPlan> {
        let keys = collect_keys(&self.data)?;
        let flat = flat_lower_bound_by_key(&keys, key);
        ensure!(
            keys.get(flat).copied() != Some(key),
            "insert of a key that is already present"
        );

        let (pos, stage) = plan_insert_position(&keys, key, flat)?;
        debug_assert!(
            hint.is_end() || pos <= *hint,
            "planned position {} beyond hint {}",
            pos,
            hint
        );
        trace!(%pos, stage, ?history, "leaf insert planned");

        Ok(InsertPlan {
            pos,
            stage,
            size: LEAF_SLOT_SIZE + key.len() + ONODE_SIZE,
        })
    }

    /// Every key in entry order, decoded.
    pub fn keys_decoded(&self) -> Result<Vec<ObjectKey>> {
        let keys = collect_keys(&self.data)?;
        keys.iter().map(|k| ObjectKey::decode(k)).collect()
    }

    /// Formats a one-entry-per-line dump for diagnostics.
    pub fn dump(&self) -> Result<String> {
        use std::fmt::Write as _;
        let mut out = String::new();
        writeln!(
            out,
            "leaf level={} tail={} entries={} free={}",
            self.level(),
            self.is_level_tail(),
            self.cell_count(),
            self.free_size()
        )?;
        let keys = collect_keys(&self.data)?;
        for flat in 0..keys.len() {
            writeln!(
                out,
                "  {} {}",
                staged_position_of(&keys, flat)?,
                ObjectKey::decode(keys[flat])?
            )?;
        }
        Ok(out)
    }
}

impl<'a> LeafLayoutMut<'a> {
    pub fn new(extent: &'a NodeExtent) -> Result<Self> {
        let data = extent.write()?;
        check_leaf(&data)?;
        Ok(Self { data })
    }

    /// Initializes a fresh extent as an empty leaf.
    pub fn init(
        extent: &'a NodeExtent,
        field_type: FieldType,
        is_level_tail: bool,
    ) -> Result<Self> {
        let mut data = extent.write()?;
        ensure!(
            data.len() == NODE_BLOCK_SIZE,
            "invalid extent size: {} != {}",
            data.len(),
            NODE_BLOCK_SIZE
        );
        NodeHeader::init(&mut data, NodeType::Leaf, field_type, 0, is_level_tail)?;
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

    /// Inserts one entry at a planned position. Free space must have been
    /// checked by the caller.
    pub fn insert(&mut self, key: &[u8], onode: &Onode, plan: &InsertPlan) -> Result<Onode> {
        let cell_size = key.len() + ONODE_SIZE;
        debug_assert_eq!(plan.size, LEAF_SLOT_SIZE + cell_size);
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
        self.insert_cell_at(flat, key, onode)?;
        Ok(*onode)
    }

    fn insert_cell_at(&mut self, flat: usize, key: &[u8], onode: &Onode) -> Result<()> {
        let count = self.cell_count() as usize;
        ensure!(flat <= count, "insert index {} out of bounds", flat);

        let cell_size = key.len() + ONODE_SIZE;
        let new_free_end = self.header().free_end() as usize - cell_size;

        self.data[new_free_end..new_free_end + key.len()].copy_from_slice(key);
        self.data[new_free_end + key.len()..new_free_end + cell_size]
            .copy_from_slice(onode.as_bytes());

        for i in (flat..count).rev() {
            let src = NODE_HEADER_SIZE + i * LEAF_SLOT_SIZE;
            let dst = src + LEAF_SLOT_SIZE;
            self.data.copy_within(src..src + LEAF_SLOT_SIZE, dst);
        }

        let slot = LeafSlot::new(key, new_free_end as u16);
        let slot_offset = NODE_HEADER_SIZE + flat * LEAF_SLOT_SIZE;
        self.data[slot_offset..slot_offset + LEAF_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(count as u16 + 1);
        header.set_free_start(header.free_start() + LEAF_SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);
        Ok(())
    }

    /// Appends an entry known to sort after every present entry.
    fn push_cell(&mut self, key: &[u8], onode: &Onode) -> Result<()> {
        let count = self.cell_count() as usize;
        self.insert_cell_at(count, key, onode)
    }

    /// Splits this leaf into itself plus a fresh right sibling while
    /// inserting one entry on whichever side it belongs. The right extent
    /// must already be initialized as an empty leaf carrying this node's
    /// level-tail flag; the flag is cleared here on the left.
    pub fn split_insert(
        &mut self,
        right: &NodeExtent,
        key: &[u8],
        onode: &Onode,
        plan: &InsertPlan,
    ) -> Result<SplitResult<Onode>> {
        let entries: Vec<(Vec<u8>, Onode)> = {
            let keys = collect_keys(&self.data)?;
            keys.iter()
                .enumerate()
                .map(|(i, k)| Ok((k.to_vec(), onode_at(&self.data, i)?)))
                .collect::<Result<_>>()?
        };
        let refs: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();

        let insert_flat = flat_lower_bound_by_key(&refs, key);
        ensure!(
            refs.get(insert_flat).copied() != Some(key),
            "split-insert of a key that is already present"
        );

        let sizes: Vec<usize> = refs.iter().map(|k| k.len() + ONODE_SIZE).collect();
        let split_flat =
            choose_split_index(&refs, &sizes, insert_flat, key.len() + ONODE_SIZE)?;
        let split_pos = staged_position_of(&refs, split_flat)?;
        let is_insert_left = insert_flat < split_flat;
        let was_tail = self.is_level_tail();

        let mut right_layout = LeafLayoutMut::new(right)?;
        ensure!(
            right_layout.cell_count() == 0 && right_layout.is_level_tail() == was_tail,
            "right sibling not initialized for split"
        );

        for (i, (k, v)) in entries.iter().enumerate().skip(split_flat) {
            if !is_insert_left && i == insert_flat {
                right_layout.push_cell(key, onode)?;
            }
            right_layout.push_cell(k, v)?;
        }
        if !is_insert_left && insert_flat >= entries.len() {
            right_layout.push_cell(key, onode)?;
        }

        let (insert_pos, insert_stage) = if is_insert_left {
            (plan.pos, plan.stage)
        } else {
            let right_refs: Vec<&[u8]> = refs[split_flat..].to_vec();
            plan_insert_position(&right_refs, key, insert_flat - split_flat)?
        };

        let field_type = self.field_type();
        NodeHeader::init(&mut self.data, NodeType::Leaf, field_type, 0, false)?;
        for (i, (k, v)) in entries.iter().enumerate().take(split_flat) {
            if is_insert_left && i == insert_flat {
                self.push_cell(key, onode)?;
            }
            self.push_cell(k, v)?;
        }

        trace!(
            %split_pos,
            is_insert_left,
            left = split_flat,
            right = entries.len() - split_flat + usize::from(!is_insert_left),
            "leaf split"
        );

        Ok(SplitResult {
            split_pos,
            is_insert_left,
            insert_pos,
            insert_stage,
            value: *onode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::position::STAGE_SNAP;

    fn make_extent() -> NodeExtent {
        NodeExtent::new_allocated(1)
    }

    fn enc(pool: u64, name: &str, snap: u64) -> Vec<u8> {
        ObjectKey::new(0, pool, 0, "ns", name, snap, 0).encode()
    }

    fn onode(size: u64) -> Onode {
        Onode::new(size, 0, 0)
    }

    fn insert_one(extent: &NodeExtent, key: &[u8], value: &Onode) -> InsertPlan {
        let plan = {
            let layout = LeafLayout::new(extent).unwrap();
            layout
                .evaluate_insert(key, &MatchHistory::new(), &SearchPosition::end())
                .unwrap()
        };
        let mut layout = LeafLayoutMut::new(extent).unwrap();
        layout.insert(key, value, &plan).unwrap();
        plan
    }

    #[test]
    fn leaf_slot_is_8_bytes() {
        assert_eq!(std::mem::size_of::<LeafSlot>(), LEAF_SLOT_SIZE);
    }

    #[test]
    fn init_makes_an_empty_tail_leaf() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();

        let layout = LeafLayout::new(&extent).unwrap();
        assert!(layout.is_empty());
        assert!(layout.is_level_tail());
        assert_eq!(layout.level(), 0);
        assert_eq!(layout.field_type(), FieldType::N0);
    }

    #[test]
    fn insert_keeps_sorted_order_and_positions() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();

        insert_one(&extent, &enc(1, "b", 0), &onode(2));
        insert_one(&extent, &enc(1, "a", 0), &onode(1));
        insert_one(&extent, &enc(1, "a", 5), &onode(3));

        let layout = LeafLayout::new(&extent).unwrap();
        assert_eq!(layout.cell_count(), 3);
        assert_eq!(
            layout.get_p_value(&SearchPosition::new(0, 0, 0)).unwrap(),
            onode(1)
        );
        assert_eq!(
            layout.get_p_value(&SearchPosition::new(0, 0, 1)).unwrap(),
            onode(3)
        );
        assert_eq!(
            layout.get_p_value(&SearchPosition::new(0, 1, 0)).unwrap(),
            onode(2)
        );
    }

    #[test]
    fn lower_bound_reports_match_kind() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();
        insert_one(&extent, &enc(1, "a", 0), &onode(1));
        insert_one(&extent, &enc(1, "c", 0), &onode(3));

        let layout = LeafLayout::new(&extent).unwrap();
        let mut history = MatchHistory::new();

        let (pos, value, kind) = layout.lower_bound(&enc(1, "a", 0), &mut history).unwrap();
        assert_eq!(kind, MatchKind::Eq);
        assert_eq!(pos, SearchPosition::new(0, 0, 0));
        assert_eq!(value, Some(onode(1)));

        let (pos, _, kind) = layout.lower_bound(&enc(1, "b", 0), &mut history).unwrap();
        assert_eq!(kind, MatchKind::Ne);
        assert_eq!(pos, SearchPosition::new(0, 1, 0));

        let (pos, value, kind) = layout.lower_bound(&enc(9, "z", 0), &mut history).unwrap();
        assert_eq!(kind, MatchKind::Ne);
        assert!(pos.is_end());
        assert_eq!(value, None);
    }

    #[test]
    fn evaluate_insert_classifies_stages() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();
        insert_one(&extent, &enc(1, "a", 0), &onode(1));

        let layout = LeafLayout::new(&extent).unwrap();
        let history = MatchHistory::new();

        let plan = layout
            .evaluate_insert(&enc(1, "a", 9), &history, &SearchPosition::end())
            .unwrap();
        assert_eq!(plan.stage, STAGE_SNAP);
        assert_eq!(plan.pos, SearchPosition::new(0, 0, 1));

        let plan = layout
            .evaluate_insert(&enc(1, "b", 0), &history, &SearchPosition::end())
            .unwrap();
        assert_eq!(plan.stage, STAGE_NAME);

        let plan = layout
            .evaluate_insert(&enc(4, "a", 0), &history, &SearchPosition::end())
            .unwrap();
        assert_eq!(plan.stage, STAGE_PLACEMENT);
    }

    #[test]
    fn split_insert_distributes_entries_and_moves_tail() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();
        for i in 0..8 {
            insert_one(&extent, &enc(1, &format!("obj{:02}", i), 0), &onode(i));
        }

        let key = enc(1, "obj99", 0);
        let value = onode(99);
        let plan = {
            let layout = LeafLayout::new(&extent).unwrap();
            layout
                .evaluate_insert(&key, &MatchHistory::new(), &SearchPosition::end())
                .unwrap()
        };

        let right = NodeExtent::new_allocated(2);
        LeafLayoutMut::init(&right, FieldType::N0, true).unwrap();

        let result = {
            let mut layout = LeafLayoutMut::new(&extent).unwrap();
            layout.split_insert(&right, &key, &value, &plan).unwrap()
        };

        let left = LeafLayout::new(&extent).unwrap();
        let right_layout = LeafLayout::new(&right).unwrap();

        assert!(!result.is_insert_left);
        assert!(!left.is_level_tail());
        assert!(right_layout.is_level_tail());
        assert_eq!(
            left.cell_count() + right_layout.cell_count(),
            9,
            "an entry was lost in the split"
        );
        assert_eq!(
            right_layout.get_p_value(&result.insert_pos).unwrap(),
            value
        );
    }

    #[test]
    fn split_insert_can_land_left() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();
        for i in 0..8 {
            insert_one(&extent, &enc(2, &format!("obj{:02}", i), 0), &onode(i));
        }

        let key = enc(0, "aaa", 0);
        let value = onode(7);
        let plan = {
            let layout = LeafLayout::new(&extent).unwrap();
            layout
                .evaluate_insert(&key, &MatchHistory::new(), &SearchPosition::begin())
                .unwrap()
        };

        let right = NodeExtent::new_allocated(2);
        LeafLayoutMut::init(&right, FieldType::N0, true).unwrap();

        let result = {
            let mut layout = LeafLayoutMut::new(&extent).unwrap();
            layout.split_insert(&right, &key, &value, &plan).unwrap()
        };

        assert!(result.is_insert_left);
        let left = LeafLayout::new(&extent).unwrap();
        assert_eq!(left.get_p_value(&result.insert_pos).unwrap(), value);
    }

    #[test]
    fn largest_value_addresses_the_last_entry() {
        let extent = make_extent();
        LeafLayoutMut::init(&extent, FieldType::N0, true).unwrap();
        insert_one(&extent, &enc(1, "a", 0), &onode(1));
        insert_one(&extent, &enc(2, "b", 3), &onode(2));

        let layout = LeafLayout::new(&extent).unwrap();
        let (pos, value) = layout.get_largest_value().unwrap();
        assert_eq!(pos, SearchPosition::new(1, 0, 0));
        assert_eq!(value, onode(2));
    }
}
