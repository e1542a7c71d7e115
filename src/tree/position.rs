//! Stages, search positions, and match evidence.
//!
//! A position addresses one logical entry of a node through the three stages
//! of the key space: the placement group, the name group within it, and the
//! snapshot entry within that. Positions order lexicographically by stage,
//! which is the same order as the entries they address.
//!
//! `INDEX_END` is the reserved greatest index. A position with every stage
//! at `INDEX_END` is the distinguished end position: the level-tail child
//! slot on an internal node, the past-the-last slot on a leaf. Positions
//! with a single stage raised to `INDEX_END` appear only as range bounds in
//! the cursor- and child-shifting protocols.

use std::cmp::Ordering;

/// Snapshot stage, the innermost.
pub const STAGE_SNAP: u8 = 0;
/// Name stage.
pub const STAGE_NAME: u8 = 1;
/// Placement stage, the outermost.
pub const STAGE_PLACEMENT: u8 = 2;

pub const NUM_STAGES: usize = 3;

/// Reserved greatest index value at every stage.
pub const INDEX_END: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SearchPosition {
    /// Stage indices ordered outermost first, so the derived lexicographic
    /// ordering matches entry order.
    indices: [u64; NUM_STAGES],
}

impl SearchPosition {
    pub fn new(placement: u64, name: u64, snap: u64) -> Self {
        Self {
            indices: [placement, name, snap],
        }
    }

    pub fn begin() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn end() -> Self {
        Self {
            indices: [INDEX_END; NUM_STAGES],
        }
    }

    pub fn is_begin(&self) -> bool {
        self.indices == [0; NUM_STAGES]
    }

    pub fn is_end(&self) -> bool {
        let end = self.indices[0] == INDEX_END;
        debug_assert!(
            !end || self.indices == [INDEX_END; NUM_STAGES],
            "partial end position {:?}",
            self
        );
        end
    }

    pub fn index_at(&self, stage: u8) -> u64 {
        self.indices[Self::slot(stage)]
    }

    pub fn set_index_at(&mut self, stage: u8, index: u64) {
        self.indices[Self::slot(stage)] = index;
    }

    pub fn with_index_at(mut self, stage: u8, index: u64) -> Self {
        self.set_index_at(stage, index);
        self
    }

    /// The position rewritten into the coordinates of a right sibling that
    /// starts at `split_pos`. Only the outermost differing stage is offset;
    /// inner indices survive unchanged when their enclosing groups move
    /// whole. The end position stays the end position: the level tail a
    /// split moves right remains the tail of the right sibling.
    pub fn stage_sub(&self, split_pos: &SearchPosition) -> Self {
        if self.is_end() {
            return *self;
        }
        debug_assert!(self >= split_pos, "{:?} < split {:?}", self, split_pos);
        let [p, n, s] = self.indices;
        let [sp, sn, ss] = split_pos.indices;

        let mut out = *self;
        out.indices[0] = p - sp;
        if p == sp {
            out.indices[1] = n - sn;
            if n == sn {
                out.indices[2] = s - ss;
            }
        }
        out
    }

    fn slot(stage: u8) -> usize {
        debug_assert!((stage as usize) < NUM_STAGES, "stage {} out of range", stage);
        NUM_STAGES - 1 - stage as usize
    }
}

impl std::fmt::Display for SearchPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_end() {
            return write!(f, "(end)");
        }
        let fmt_idx = |i: u64| -> String {
            if i == INDEX_END {
                "end".to_string()
            } else {
                i.to_string()
            }
        };
        write!(
            f,
            "({}, {}, {})",
            fmt_idx(self.indices[0]),
            fmt_idx(self.indices[1]),
            fmt_idx(self.indices[2])
        )
    }
}

/// Outcome of a lower-bound search at its landing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The key at the position equals the search key.
    Eq,
    /// The position is where the search key would be inserted.
    Ne,
}

/// Per-stage comparison evidence accumulated while descending. Each stage
/// records how the search key related to the stored keys the last time that
/// stage was compared; the insertion planner uses it to bias stage choice
/// when the landing position sits on a group boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchHistory {
    stages: [Option<Ordering>; NUM_STAGES],
}

impl MatchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: u8, ord: Ordering) {
        self.stages[stage as usize] = Some(ord);
    }

    pub fn get(&self, stage: u8) -> Option<Ordering> {
        self.stages[stage as usize]
    }

    /// True when every stage outside `stage` compared equal, meaning the
    /// search key extends an existing group at `stage`.
    pub fn is_group_extension(&self, stage: u8) -> bool {
        ((stage + 1)..NUM_STAGES as u8).all(|s| self.get(s) == Some(Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic_by_stage() {
        let a = SearchPosition::new(0, 5, 9);
        let b = SearchPosition::new(1, 0, 0);
        let c = SearchPosition::new(1, 0, 1);
        assert!(a < b && b < c);
        assert!(c < SearchPosition::end());
    }

    #[test]
    fn end_position_is_greatest() {
        let end = SearchPosition::end();
        assert!(end.is_end());
        assert!(SearchPosition::new(INDEX_END - 1, INDEX_END, INDEX_END) < end);
    }

    #[test]
    fn index_at_addresses_stages() {
        let mut pos = SearchPosition::new(4, 5, 6);
        assert_eq!(pos.index_at(STAGE_PLACEMENT), 4);
        assert_eq!(pos.index_at(STAGE_NAME), 5);
        assert_eq!(pos.index_at(STAGE_SNAP), 6);

        pos.set_index_at(STAGE_NAME, 9);
        assert_eq!(pos, SearchPosition::new(4, 9, 6));
    }

    #[test]
    fn stage_sub_offsets_outermost_differing_stage_only() {
        let split = SearchPosition::new(2, 3, 1);

        // Same placement group and name group: snap offset applies.
        assert_eq!(
            SearchPosition::new(2, 3, 4).stage_sub(&split),
            SearchPosition::new(0, 0, 3)
        );
        // Same placement group, later name group: name offset, snap kept.
        assert_eq!(
            SearchPosition::new(2, 5, 7).stage_sub(&split),
            SearchPosition::new(0, 2, 7)
        );
        // Later placement group: placement offset, inner indices kept.
        assert_eq!(
            SearchPosition::new(4, 1, 2).stage_sub(&split),
            SearchPosition::new(2, 1, 2)
        );
        // The end position is not a coordinate and never shifts.
        assert_eq!(
            SearchPosition::end().stage_sub(&split),
            SearchPosition::end()
        );
    }

    #[test]
    fn history_detects_group_extension() {
        let mut h = MatchHistory::new();
        h.record(STAGE_PLACEMENT, Ordering::Equal);
        h.record(STAGE_NAME, Ordering::Equal);
        h.record(STAGE_SNAP, Ordering::Less);

        assert!(h.is_group_extension(STAGE_SNAP));
        assert!(h.is_group_extension(STAGE_NAME));
        assert!(h.is_group_extension(STAGE_PLACEMENT));

        h.record(STAGE_NAME, Ordering::Less);
        assert!(!h.is_group_extension(STAGE_SNAP));
        assert!(h.is_group_extension(STAGE_NAME));
    }
}
