//! Object keys and onode records.
//!
//! The tree maps three-stage composite object identifiers to fixed-layout
//! onode records. A key is ordered by its stages from the outside in:
//!
//! ```text
//! placement stage:  shard, pool, hash
//! name stage:       namespace, name
//! snapshot stage:   snap, generation
//! ```
//!
//! ## Byte encoding
//!
//! Keys are stored encoded, and the encoding preserves order: comparing two
//! encoded keys with `memcmp` gives the same answer as comparing the decoded
//! keys field by field. Fixed-width fields are big-endian; the two string
//! fields use escape encoding so embedded terminator bytes cannot cut a
//! string short:
//!
//! ```text
//! 0x00 -> 0x00 0xFF
//! 0xFF -> 0xFF 0x00
//! terminator: 0x00 0x00
//! ```
//!
//! The three stages occupy disjoint encoded segments, so stage-level
//! comparison works directly on encoded bytes without a full decode.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::Laddr;

/// Encoded length of the placement stage: shard (1) + pool (8) + hash (4).
pub const PLACEMENT_ENC_LEN: usize = 13;

/// Fixed encoded length of the snapshot stage: snap (8) + generation (8).
pub const SNAPSHOT_ENC_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub shard: u8,
    pub pool: u64,
    pub hash: u32,
    pub nspace: String,
    pub name: String,
    pub snap: u64,
    pub generation: u64,
}

impl ObjectKey {
    pub fn new(
        shard: u8,
        pool: u64,
        hash: u32,
        nspace: impl Into<String>,
        name: impl Into<String>,
        snap: u64,
        generation: u64,
    ) -> Self {
        Self {
            shard,
            pool,
            hash,
            nspace: nspace.into(),
            name: name.into(),
            snap,
            generation,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            PLACEMENT_ENC_LEN + SNAPSHOT_ENC_LEN + self.nspace.len() + self.name.len() + 8,
        );
        buf.push(self.shard);
        buf.extend_from_slice(&self.pool.to_be_bytes());
        buf.extend_from_slice(&self.hash.to_be_bytes());
        encode_escaped(self.nspace.as_bytes(), &mut buf);
        encode_escaped(self.name.as_bytes(), &mut buf);
        buf.extend_from_slice(&self.snap.to_be_bytes());
        buf.extend_from_slice(&self.generation.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let seg = KeySegments::parse(bytes)?;
        let shard = seg.placement[0];
        let pool = u64::from_be_bytes(seg.placement[1..9].try_into().unwrap());
        let hash = u32::from_be_bytes(seg.placement[9..13].try_into().unwrap());

        let mut rest = seg.name;
        let nspace = decode_escaped(&mut rest)?;
        let name = decode_escaped(&mut rest)?;
        ensure!(rest.is_empty(), "trailing bytes in name stage");

        let snap = u64::from_be_bytes(seg.snapshot[..8].try_into().unwrap());
        let generation = u64::from_be_bytes(seg.snapshot[8..].try_into().unwrap());

        Ok(Self {
            shard,
            pool,
            hash,
            nspace: String::from_utf8(nspace)?,
            name: String::from_utf8(name)?,
            snap,
            generation,
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{:08x}/{}/{}@{}.{}",
            self.shard, self.pool, self.hash, self.nspace, self.name, self.snap, self.generation
        )
    }
}

/// The three encoded stage segments of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySegments<'a> {
    pub placement: &'a [u8],
    pub name: &'a [u8],
    pub snapshot: &'a [u8],
}

impl<'a> KeySegments<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= PLACEMENT_ENC_LEN + 4 + SNAPSHOT_ENC_LEN,
            "encoded key too short: {} bytes",
            bytes.len()
        );
        let placement = &bytes[..PLACEMENT_ENC_LEN];
        let name_start = PLACEMENT_ENC_LEN;
        let name_end = name_start + escaped_segment_len(&bytes[name_start..], 2)?;
        let name = &bytes[name_start..name_end];
        let snapshot = &bytes[name_end..];
        ensure!(
            snapshot.len() == SNAPSHOT_ENC_LEN,
            "encoded key has {} snapshot bytes, expected {}",
            snapshot.len(),
            SNAPSHOT_ENC_LEN
        );
        Ok(Self {
            placement,
            name,
            snapshot,
        })
    }

    pub fn same_placement(&self, other: &KeySegments<'_>) -> bool {
        self.placement == other.placement
    }

    pub fn same_name(&self, other: &KeySegments<'_>) -> bool {
        self.placement == other.placement && self.name == other.name
    }
}

fn encode_escaped(data: &[u8], buf: &mut Vec<u8>) {
    for &b in data {
        match b {
            0x00 => buf.extend_from_slice(&[0x00, 0xFF]),
            0xFF => buf.extend_from_slice(&[0xFF, 0x00]),
            _ => buf.push(b),
        }
    }
    buf.extend_from_slice(&[0x00, 0x00]);
}

fn decode_escaped(rest: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        ensure!(i + 1 < rest.len(), "unterminated escaped string");
        match (rest[i], rest[i + 1]) {
            (0x00, 0x00) => {
                *rest = &rest[i + 2..];
                return Ok(out);
            }
            (0x00, 0xFF) => {
                out.push(0x00);
                i += 2;
            }
            (0xFF, 0x00) => {
                out.push(0xFF);
                i += 2;
            }
            (0xFF, _) => bail!("bad escape sequence in encoded string"),
            (b, _) => {
                out.push(b);
                i += 1;
            }
        }
    }
}

/// Byte length of `count` consecutive escape-terminated strings at the
/// front of `bytes`, terminators included.
fn escaped_segment_len(bytes: &[u8], count: usize) -> Result<usize> {
    let mut i = 0;
    let mut seen = 0;
    while seen < count {
        ensure!(i < bytes.len(), "unterminated escaped string");
        match bytes[i] {
            0x00 => {
                ensure!(i + 1 < bytes.len(), "truncated escape sequence");
                if bytes[i + 1] == 0x00 {
                    seen += 1;
                }
                i += 2;
            }
            0xFF => {
                ensure!(i + 1 < bytes.len(), "truncated escape sequence");
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(i)
}

/// The onode: the fixed-layout object-metadata record stored in leaves.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Onode {
    size: U64,
    data_root: U64,
    flags: U32,
    reserved: U32,
}

pub const ONODE_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<Onode>() == ONODE_SIZE);

impl Onode {
    pub fn new(size: u64, data_root: Laddr, flags: u32) -> Self {
        Self {
            size: U64::new(size),
            data_root: U64::new(data_root),
            flags: U32::new(flags),
            reserved: U32::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= ONODE_SIZE,
            "buffer too small for Onode: {} < {}",
            bytes.len(),
            ONODE_SIZE
        );
        Ok(Self::read_from_bytes(&bytes[..ONODE_SIZE])
            .map_err(|e| eyre::eyre!("failed to read Onode: {:?}", e))?)
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub fn data_root(&self) -> Laddr {
        self.data_root.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pool: u64, name: &str, snap: u64) -> ObjectKey {
        ObjectKey::new(0, pool, 0xC0FFEE, "ns", name, snap, 0)
    }

    #[test]
    fn onode_is_24_bytes() {
        assert_eq!(std::mem::size_of::<Onode>(), ONODE_SIZE);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let k = ObjectKey::new(3, 17, 0xDEADBEEF, "space", "object-1", 42, 7);
        let decoded = ObjectKey::decode(&k.encode()).unwrap();
        assert_eq!(decoded, k);
    }

    #[test]
    fn encoding_preserves_field_order() {
        let a = key(1, "obj", 5);
        let b = key(1, "obj", 6);
        let c = key(1, "pbj", 0);
        let d = key(2, "aaa", 0);

        assert!(a.encode() < b.encode());
        assert!(b.encode() < c.encode());
        assert!(c.encode() < d.encode());
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn embedded_nul_and_ff_bytes_survive() {
        let mut k = key(1, "x", 0);
        k.nspace = "a\u{0}b".to_string();
        let decoded = ObjectKey::decode(&k.encode()).unwrap();
        assert_eq!(decoded.nspace, "a\u{0}b");
    }

    #[test]
    fn empty_name_sorts_before_nonempty() {
        let a = key(1, "", 0);
        let b = key(1, "a", 0);
        assert!(a.encode() < b.encode());
    }

    #[test]
    fn segments_split_the_three_stages() {
        let k = ObjectKey::new(1, 2, 3, "nn", "oo", 9, 1);
        let enc = k.encode();
        let seg = KeySegments::parse(&enc).unwrap();

        assert_eq!(seg.placement.len(), PLACEMENT_ENC_LEN);
        assert_eq!(seg.snapshot.len(), SNAPSHOT_ENC_LEN);
        assert_eq!(
            seg.placement.len() + seg.name.len() + seg.snapshot.len(),
            enc.len()
        );
    }

    #[test]
    fn segment_comparison_matches_stage_sharing() {
        let a = key(1, "obj", 1);
        let b = key(1, "obj", 2);
        let c = key(1, "other", 0);
        let d = key(9, "obj", 1);

        let (ea, eb, ec, ed) = (a.encode(), b.encode(), c.encode(), d.encode());
        let sa = KeySegments::parse(&ea).unwrap();
        let sb = KeySegments::parse(&eb).unwrap();
        let sc = KeySegments::parse(&ec).unwrap();
        let sd = KeySegments::parse(&ed).unwrap();

        assert!(sa.same_name(&sb));
        assert!(sa.same_placement(&sc) && !sa.same_name(&sc));
        assert!(!sa.same_placement(&sd));
    }
}
