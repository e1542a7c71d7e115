//! On-extent node layout.
//!
//! This layer owns the physical encoding of nodes and the insert planning
//! primitives the tree layer drives. Every node extent starts with a
//! `NodeHeader`, followed by a slot array growing downward and cell content
//! growing upward from the block end:
//!
//! ```text
//! +----------------------+
//! | NodeHeader (24B)     |  node type, field type, level, tail flag,
//! +----------------------+  cell count, free bounds, tail child
//! | Slot array           |  per-entry: 4-byte key prefix hint, cell
//! | [Slot 0]             |  offset, key length (+ inline child address
//! | [Slot 1]             |  on internal nodes)
//! | ...                  |
//! +----------------------+
//! | Free space           |
//! +----------------------+
//! | Cell content         |  leaf: encoded key | onode record
//! |                      |  internal: encoded separator key
//! +----------------------+
//! ```
//!
//! Entries are flat in the slot array and sorted by encoded key; the staged
//! coordinates the tree layer works with are derived from the group
//! structure of adjacent keys. The helpers at the bottom of this module
//! translate between flat slot indices and staged positions and plan where
//! an insert lands, including which stage it extends.

mod interior;
mod leaf;

pub use interior::{InteriorLayout, InteriorLayoutMut, INTERIOR_SLOT_SIZE};
pub use leaf::{LeafLayout, LeafLayoutMut, LEAF_SLOT_SIZE};

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{NODE_BLOCK_SIZE, NODE_HEADER_SIZE};
use crate::storage::{Laddr, NodeExtent};
use crate::tree::key::KeySegments;
use crate::tree::position::{SearchPosition, STAGE_NAME, STAGE_PLACEMENT, STAGE_SNAP};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal = 0x01,
    Leaf = 0x02,
}

impl NodeType {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(NodeType::Internal),
            0x02 => Ok(NodeType::Leaf),
            _ => bail!("bad node header: unknown node type 0x{:02x}", b),
        }
    }
}

/// Discriminator for the on-extent field encoding. `N0` is the canonical
/// encoding and the only one a root may use. All four discriminants share
/// the slot-array codec in this crate; the value is validated on load and
/// preserved across splits.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldType {
    N0 = 0xA0,
    N1 = 0xA1,
    N2 = 0xA2,
    N3 = 0xA3,
}

impl FieldType {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0xA0 => Ok(FieldType::N0),
            0xA1 => Ok(FieldType::N1),
            0xA2 => Ok(FieldType::N2),
            0xA3 => Ok(FieldType::N3),
            _ => bail!("bad node header: unknown field type 0x{:02x}", b),
        }
    }
}

const FLAG_LEVEL_TAIL: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    node_type: u8,
    field_type: u8,
    level: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    reserved: [u8; 6],
    tail_child: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn init(
        data: &mut [u8],
        node_type: NodeType,
        field_type: FieldType,
        level: u8,
        is_level_tail: bool,
    ) -> Result<&mut Self> {
        let header = Self::from_bytes_mut(data)?;
        header.node_type = node_type as u8;
        header.field_type = field_type as u8;
        header.level = level;
        header.flags = if is_level_tail { FLAG_LEVEL_TAIL } else { 0 };
        header.cell_count = U16::new(0);
        header.free_start = U16::new(NODE_HEADER_SIZE as u16);
        header.free_end = U16::new(NODE_BLOCK_SIZE as u16);
        header.reserved = [0; 6];
        header.tail_child = U64::new(0);
        Ok(header)
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn node_type(&self) -> Result<NodeType> {
        NodeType::from_byte(self.node_type)
    }

    pub fn field_type(&self) -> Result<FieldType> {
        FieldType::from_byte(self.field_type)
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_level_tail(&self) -> bool {
        self.flags & FLAG_LEVEL_TAIL != 0
    }

    pub fn set_level_tail(&mut self, tail: bool) {
        if tail {
            self.flags |= FLAG_LEVEL_TAIL;
        } else {
            self.flags &= !FLAG_LEVEL_TAIL;
        }
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count.get()
    }

    pub fn set_cell_count(&mut self, count: u16) {
        self.cell_count = U16::new(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start = U16::new(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end = U16::new(offset);
    }

    pub fn tail_child(&self) -> Laddr {
        self.tail_child.get()
    }

    pub fn set_tail_child(&mut self, laddr: Laddr) {
        self.tail_child = U64::new(laddr);
    }
}

/// Reads the discriminating header fields of a node extent. This is the
/// only part of the encoding the node base layer interprets itself.
pub fn read_node_kind(extent: &NodeExtent) -> Result<(NodeType, FieldType, u8, bool)> {
    let data = extent.read();
    let header = NodeHeader::from_bytes(&data)?;
    Ok((
        header.node_type()?,
        header.field_type()?,
        header.level(),
        header.is_level_tail(),
    ))
}

pub fn extract_prefix(key: &[u8]) -> [u8; 4] {
    let mut prefix = [0u8; 4];
    let len = key.len().min(4);
    prefix[..len].copy_from_slice(&key[..len]);
    prefix
}

/// A planned insert: the staged landing position, the stage the new entry
/// extends, and the bytes it will consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertPlan {
    pub pos: SearchPosition,
    pub stage: u8,
    pub size: usize,
}

/// Outcome of a split-insert. `split_pos` is the staged position, in the
/// node's pre-insert coordinates, of the first entry moved to the right
/// sibling. When `is_insert_left` is false, `insert_pos`/`insert_stage`
/// have already been rewritten into the right sibling's coordinates, so the
/// caller always tracks the new entry with coordinates local to the node
/// that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitResult<V> {
    pub split_pos: SearchPosition,
    pub is_insert_left: bool,
    pub insert_pos: SearchPosition,
    pub insert_stage: u8,
    pub value: V,
}

/// How many stages two keys share, counted from the outside: 0 when the
/// placement differs, 1 when only the placement matches, 2 when placement
/// and name both match.
pub(crate) fn shared_depth(a: &[u8], b: &[u8]) -> Result<u8> {
    let sa = KeySegments::parse(a)?;
    let sb = KeySegments::parse(b)?;
    Ok(if sa.same_name(&sb) {
        2
    } else if sa.same_placement(&sb) {
        1
    } else {
        0
    })
}

/// Staged coordinates of the entry at flat index `flat`.
pub(crate) fn staged_position_of(keys: &[&[u8]], flat: usize) -> Result<SearchPosition> {
    ensure!(
        flat < keys.len(),
        "flat index {} out of bounds ({} entries)",
        flat,
        keys.len()
    );
    let mut pos = SearchPosition::begin();
    for i in 1..=flat {
        match shared_depth(keys[i - 1], keys[i])? {
            2 => pos.set_index_at(STAGE_SNAP, pos.index_at(STAGE_SNAP) + 1),
            1 => {
                pos.set_index_at(STAGE_NAME, pos.index_at(STAGE_NAME) + 1);
                pos.set_index_at(STAGE_SNAP, 0);
            }
            _ => {
                pos.set_index_at(STAGE_PLACEMENT, pos.index_at(STAGE_PLACEMENT) + 1);
                pos.set_index_at(STAGE_NAME, 0);
                pos.set_index_at(STAGE_SNAP, 0);
            }
        }
    }
    Ok(pos)
}

/// Number of entries whose staged position is strictly below `pos`. This is
/// both the flat index of the entry at `pos` (when one exists) and the flat
/// index an entry inserted at `pos` would take.
pub(crate) fn flat_lower_bound_by_position(
    keys: &[&[u8]],
    pos: &SearchPosition,
) -> Result<usize> {
    if pos.is_end() {
        return Ok(keys.len());
    }
    let mut current = SearchPosition::begin();
    for i in 0..keys.len() {
        if i > 0 {
            match shared_depth(keys[i - 1], keys[i])? {
                2 => current.set_index_at(STAGE_SNAP, current.index_at(STAGE_SNAP) + 1),
                1 => {
                    current.set_index_at(STAGE_NAME, current.index_at(STAGE_NAME) + 1);
                    current.set_index_at(STAGE_SNAP, 0);
                }
                _ => {
                    current
                        .set_index_at(STAGE_PLACEMENT, current.index_at(STAGE_PLACEMENT) + 1);
                    current.set_index_at(STAGE_NAME, 0);
                    current.set_index_at(STAGE_SNAP, 0);
                }
            }
        }
        if current >= *pos {
            return Ok(i);
        }
    }
    Ok(keys.len())
}

/// Flat index of the first entry whose key is `>= key`.
pub(crate) fn flat_lower_bound_by_key(keys: &[&[u8]], key: &[u8]) -> usize {
    keys.partition_point(|k| *k < key)
}

/// Plans the staged landing position and stage for inserting `new_key` at
/// flat index `flat`. The stage is the deepest sharing with either
/// neighbor; the position carries zeroed indices below that stage, which is
/// what lets the planned position land at or left of any search hint.
pub(crate) fn plan_insert_position(
    keys: &[&[u8]],
    new_key: &[u8],
    flat: usize,
) -> Result<(SearchPosition, u8)> {
    if keys.is_empty() {
        return Ok((SearchPosition::begin(), STAGE_PLACEMENT));
    }

    let depth_pred = if flat > 0 {
        shared_depth(keys[flat - 1], new_key)?
    } else {
        0
    };
    let depth_succ = if flat < keys.len() {
        shared_depth(new_key, keys[flat])?
    } else {
        0
    };

    if depth_pred > depth_succ {
        let pred = staged_position_of(keys, flat - 1)?;
        Ok(match depth_pred {
            2 => (
                pred.with_index_at(STAGE_SNAP, pred.index_at(STAGE_SNAP) + 1),
                STAGE_SNAP,
            ),
            _ => (
                pred.with_index_at(STAGE_NAME, pred.index_at(STAGE_NAME) + 1)
                    .with_index_at(STAGE_SNAP, 0),
                STAGE_NAME,
            ),
        })
    } else if flat < keys.len() {
        let stage = 2 - depth_succ;
        Ok((staged_position_of(keys, flat)?, stage))
    } else {
        // Past every entry with nothing shared: a fresh placement group.
        let pred = staged_position_of(keys, flat - 1)?;
        Ok((
            pred.with_index_at(STAGE_PLACEMENT, pred.index_at(STAGE_PLACEMENT) + 1)
                .with_index_at(STAGE_NAME, 0)
                .with_index_at(STAGE_SNAP, 0),
            STAGE_PLACEMENT,
        ))
    }
}

/// Picks the flat index of the first entry to move right in a split. The
/// byte midpoint of the merged entry sequence is snapped to the nearest
/// placement-group boundary within a quarter of the entry count, else to a
/// name-group boundary, else used as is.
pub(crate) fn choose_split_index(
    keys: &[&[u8]],
    cell_sizes: &[usize],
    insert_flat: usize,
    insert_size: usize,
) -> Result<usize> {
    let n = keys.len();
    ensure!(n >= 2, "cannot split a node with {} entries", n);

    let total: usize = cell_sizes.iter().sum::<usize>() + insert_size;
    let half = total / 2;

    let merged_size = |m: usize| -> usize {
        use std::cmp::Ordering::*;
        match m.cmp(&insert_flat) {
            Less => cell_sizes[m],
            Equal => insert_size,
            Greater => cell_sizes[m - 1],
        }
    };

    let mut acc = 0;
    let mut mid = 1;
    for m in 0..=n {
        acc += merged_size(m);
        if acc >= half {
            mid = m + 1;
            break;
        }
    }
    let raw = mid - if insert_flat < mid { 1 } else { 0 };
    let raw = raw.clamp(1, n - 1);

    let window = (n / 4).max(1);
    let lo = raw.saturating_sub(window).max(1);
    let hi = (raw + window).min(n - 1);

    let mut best_placement: Option<usize> = None;
    let mut best_name: Option<usize> = None;
    for j in lo..=hi {
        let depth = shared_depth(keys[j - 1], keys[j])?;
        let better =
            |best: Option<usize>| best.map_or(true, |b: usize| j.abs_diff(raw) < b.abs_diff(raw));
        match depth {
            0 if better(best_placement) => best_placement = Some(j),
            1 if better(best_name) => best_name = Some(j),
            _ => {}
        }
    }

    Ok(best_placement.or(best_name).unwrap_or(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::key::ObjectKey;

    fn enc(pool: u64, name: &str, snap: u64) -> Vec<u8> {
        ObjectKey::new(0, pool, 0, "ns", name, snap, 0).encode()
    }

    fn key_refs(keys: &[Vec<u8>]) -> Vec<&[u8]> {
        keys.iter().map(|k| k.as_slice()).collect()
    }

    #[test]
    fn node_header_is_24_bytes() {
        assert_eq!(std::mem::size_of::<NodeHeader>(), NODE_HEADER_SIZE);
    }

    #[test]
    fn field_type_rejects_unknown_bytes() {
        assert!(FieldType::from_byte(0xA0).is_ok());
        assert!(FieldType::from_byte(0x00).is_err());
        assert!(NodeType::from_byte(0x07).is_err());
    }

    #[test]
    fn staged_positions_follow_group_structure() {
        let keys = vec![
            enc(1, "a", 0),
            enc(1, "a", 5),
            enc(1, "b", 0),
            enc(2, "a", 0),
            enc(2, "a", 1),
        ];
        let refs = key_refs(&keys);

        assert_eq!(
            staged_position_of(&refs, 0).unwrap(),
            SearchPosition::new(0, 0, 0)
        );
        assert_eq!(
            staged_position_of(&refs, 1).unwrap(),
            SearchPosition::new(0, 0, 1)
        );
        assert_eq!(
            staged_position_of(&refs, 2).unwrap(),
            SearchPosition::new(0, 1, 0)
        );
        assert_eq!(
            staged_position_of(&refs, 3).unwrap(),
            SearchPosition::new(1, 0, 0)
        );
        assert_eq!(
            staged_position_of(&refs, 4).unwrap(),
            SearchPosition::new(1, 0, 1)
        );
    }

    #[test]
    fn flat_lower_bound_inverts_staged_positions() {
        let keys = vec![enc(1, "a", 0), enc(1, "a", 5), enc(1, "b", 0), enc(2, "a", 0)];
        let refs = key_refs(&keys);

        for flat in 0..refs.len() {
            let pos = staged_position_of(&refs, flat).unwrap();
            assert_eq!(flat_lower_bound_by_position(&refs, &pos).unwrap(), flat);
        }
        assert_eq!(
            flat_lower_bound_by_position(&refs, &SearchPosition::end()).unwrap(),
            refs.len()
        );
    }

    #[test]
    fn plan_extends_snapshot_group_of_predecessor() {
        let keys = vec![enc(1, "a", 0), enc(1, "a", 5), enc(1, "b", 0)];
        let refs = key_refs(&keys);
        let new = enc(1, "a", 7);
        let flat = flat_lower_bound_by_key(&refs, &new);
        assert_eq!(flat, 2);

        let (pos, stage) = plan_insert_position(&refs, &new, flat).unwrap();
        assert_eq!(stage, STAGE_SNAP);
        assert_eq!(pos, SearchPosition::new(0, 0, 2));
    }

    #[test]
    fn plan_joins_successor_name_group_at_its_head() {
        let keys = vec![enc(1, "a", 0), enc(1, "b", 4)];
        let refs = key_refs(&keys);
        let new = enc(1, "b", 1);
        let flat = flat_lower_bound_by_key(&refs, &new);
        assert_eq!(flat, 1);

        let (pos, stage) = plan_insert_position(&refs, &new, flat).unwrap();
        assert_eq!(stage, STAGE_SNAP);
        assert_eq!(pos, SearchPosition::new(0, 1, 0));
    }

    #[test]
    fn plan_opens_new_name_group() {
        let keys = vec![enc(1, "a", 0), enc(1, "c", 0)];
        let refs = key_refs(&keys);
        let new = enc(1, "b", 0);
        let flat = flat_lower_bound_by_key(&refs, &new);

        let (pos, stage) = plan_insert_position(&refs, &new, flat).unwrap();
        assert_eq!(stage, STAGE_NAME);
        assert_eq!(pos, SearchPosition::new(0, 1, 0));
    }

    #[test]
    fn plan_opens_new_placement_group_past_the_end() {
        let keys = vec![enc(1, "a", 0)];
        let refs = key_refs(&keys);
        let new = enc(5, "z", 0);
        let flat = flat_lower_bound_by_key(&refs, &new);
        assert_eq!(flat, 1);

        let (pos, stage) = plan_insert_position(&refs, &new, flat).unwrap();
        assert_eq!(stage, STAGE_PLACEMENT);
        assert_eq!(pos, SearchPosition::new(1, 0, 0));
    }

    #[test]
    fn split_index_prefers_placement_boundaries() {
        let keys = vec![
            enc(1, "a", 0),
            enc(1, "a", 1),
            enc(1, "a", 2),
            enc(2, "b", 0),
            enc(2, "b", 1),
            enc(2, "b", 2),
        ];
        let refs = key_refs(&keys);
        let sizes = vec![40; refs.len()];

        let split = choose_split_index(&refs, &sizes, refs.len(), 40).unwrap();
        assert_eq!(split, 3);
    }
}
