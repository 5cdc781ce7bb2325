#![forbid(unsafe_code)]
//! On-disk tag codec and wire structures for FlintFS.
//!
//! Everything that defines the storage format lives here: the 32-bit
//! XOR-chained tag header, the commit CRC, the superblock / CTZ / gstate
//! payload layouts and the block-pair helpers. Multi-byte payload fields are
//! little-endian; the tag header is big-endian so that an erased (all-ones)
//! region XOR-chains to an invalid tag and cleanly terminates a log scan.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Block addressing ────────────────────────────────────────────────────────

/// Index of an erasable block on the device.
pub type BlockId = u64;

/// Sentinel for "no block".
pub const BLOCK_NULL: BlockId = BlockId::MAX;

/// Sentinel for "content lives inline in a metadata entry".
pub const BLOCK_INLINE: BlockId = BlockId::MAX - 1;

/// A two-block metadata pair address.
pub type BlockPair = [BlockId; 2];

/// Pair with both members unset.
pub const PAIR_NULL: BlockPair = [BLOCK_NULL, BLOCK_NULL];

/// Whether either member of the pair is the null sentinel.
#[must_use]
pub fn pair_is_null(pair: &BlockPair) -> bool {
    pair[0] == BLOCK_NULL || pair[1] == BLOCK_NULL
}

/// Whether two pairs share at least one block.
///
/// A relocated pair keeps one member, so "same directory" checks must accept
/// any overlap, not only exact equality.
#[must_use]
pub fn pair_overlap(a: &BlockPair, b: &BlockPair) -> bool {
    a[0] == b[0] || a[1] == b[1] || a[0] == b[1] || a[1] == b[0]
}

/// Whether two pairs name the same two blocks, in either order.
#[must_use]
pub fn pair_same(a: &BlockPair, b: &BlockPair) -> bool {
    (a[0] == b[0] && a[1] == b[1]) || (a[0] == b[1] && a[1] == b[0])
}

/// Serialize a pair as two le64 words.
#[must_use]
pub fn pair_to_bytes(pair: &BlockPair) -> [u8; 16] {
    let mut out = [0_u8; 16];
    out[..8].copy_from_slice(&pair[0].to_le_bytes());
    out[8..].copy_from_slice(&pair[1].to_le_bytes());
    out
}

/// Parse two le64 words into a pair.
#[must_use]
pub fn pair_from_bytes(bytes: &[u8]) -> BlockPair {
    [read_le_u64(bytes, 0), read_le_u64(bytes, 8)]
}

// ── Format constants ────────────────────────────────────────────────────────

/// Magic bytes stored in the superblock name tag.
pub const MAGIC: &[u8; 8] = b"littlefs";

/// On-disk format version, `(major << 16) | minor`.
pub const DISK_VERSION: u32 = 0x0002_0000;
pub const DISK_VERSION_MAJOR: u16 = (DISK_VERSION >> 16) as u16;
pub const DISK_VERSION_MINOR: u16 = (DISK_VERSION & 0xffff) as u16;

/// Default upper bound on name length in bytes.
pub const NAME_MAX_DEFAULT: u64 = 255;

/// Hard on-disk limit for name length (tag size field minus terminator).
pub const NAME_MAX_LIMIT: u64 = 1022;

/// Hard limit on file size in bytes.
pub const FILE_MAX_LIMIT: u64 = 0x7fff_ffff_ffff_ffff;

/// Hard limit on custom attribute size in bytes.
pub const ATTR_MAX_LIMIT: u64 = 1022;

/// Width of one on-disk block pointer (CTZ skip pointers, pair words).
pub const PTR_SIZE: u64 = 8;

// ── Tag codec ───────────────────────────────────────────────────────────────

/// Broad and full tag types (11-bit field, `type1` is the top 3 bits kept in
/// place, `type3` the full field).
pub mod ttype {
    pub const NAME: u16 = 0x000;
    pub const REG: u16 = 0x001;
    pub const DIR: u16 = 0x002;
    pub const SUPERBLOCK: u16 = 0x0ff;

    pub const FROM: u16 = 0x100;
    pub const FROM_NOOP: u16 = 0x000;
    pub const FROM_MOVE: u16 = 0x101;
    pub const FROM_USERATTRS: u16 = 0x102;

    pub const STRUCT: u16 = 0x200;
    pub const DIRSTRUCT: u16 = 0x200;
    pub const INLINESTRUCT: u16 = 0x201;
    pub const CTZSTRUCT: u16 = 0x202;

    pub const USERATTR: u16 = 0x300;

    pub const SPLICE: u16 = 0x400;
    pub const CREATE: u16 = 0x401;
    pub const DELETE: u16 = 0x4ff;

    pub const CRC: u16 = 0x500;

    pub const TAIL: u16 = 0x600;
    pub const SOFTTAIL: u16 = 0x600;
    pub const HARDTAIL: u16 = 0x601;

    pub const GLOBALS: u16 = 0x700;
    pub const MOVESTATE: u16 = 0x7ff;

    /// Gstate-only flag: the top bit of the gstate tag doubles as the
    /// "filesystem has orphans" marker.
    pub const HAS_ORPHANS: u16 = 0x800;
}

/// Entry id meaning "no id / filesystem-global".
pub const ID_NONE: u16 = 0x3ff;

/// Size field value marking a deleted-attribute tombstone.
pub const SIZE_DELETE: u32 = 0x3ff;

/// A 32-bit metadata tag.
///
/// Bit layout (MSB → LSB): 1-bit valid (0 = valid), 11-bit type, 10-bit id,
/// 10-bit size. Stored big-endian and XOR-chained with the preceding tag on
/// disk. Arithmetic on tags (splice deltas) is wrapping by design; the id
/// field borrows into the type bits exactly as the packed representation
/// dictates, and callers guard the cases where that matters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag(pub u32);

impl Tag {
    /// All-ones tag; invalid, used as the XOR seed for the first tag of a
    /// block and as the "nothing found" sentinel during scans.
    pub const INVALID: Self = Self(0xffff_ffff);

    /// No-op tag (type `FROM_NOOP`, id 0, size 0).
    pub const NOOP: Self = Self(0);

    #[must_use]
    pub const fn new(ttype: u16, id: u16, size: u32) -> Self {
        Self(((ttype as u32) << 20) | ((id as u32) << 10) | size)
    }

    /// `new` when `cond` holds, `NOOP` otherwise. No-op tags are skipped by
    /// every traversal, so conditional attributes can stay in fixed-size
    /// attribute lists.
    #[must_use]
    pub const fn new_if(cond: bool, ttype: u16, id: u16, size: u32) -> Self {
        if cond {
            Self::new(ttype, id, size)
        } else {
            Self::NOOP
        }
    }

    /// Valid bit is clear.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    /// Size field sign-extends to -1: a tombstone for a deleted attribute.
    /// Tombstones carry no payload despite the all-ones size.
    #[must_use]
    pub const fn is_delete(self) -> bool {
        ((self.0 << 22) as i32) >> 22 == -1
    }

    /// Top 3 bits of the type field, kept in place (e.g. `0x400` for any
    /// splice).
    #[must_use]
    pub const fn type1(self) -> u16 {
        ((self.0 & 0x7000_0000) >> 20) as u16
    }

    /// Full 11-bit type field.
    #[must_use]
    pub const fn type3(self) -> u16 {
        ((self.0 & 0x7ff0_0000) >> 20) as u16
    }

    /// Low 8 bits of the type field.
    #[must_use]
    pub const fn chunk(self) -> u8 {
        ((self.0 & 0x0ff0_0000) >> 20) as u8
    }

    /// Chunk reinterpreted as a signed id delta (CREATE = +1, DELETE = -1).
    #[must_use]
    pub const fn splice(self) -> i8 {
        self.chunk() as i8
    }

    #[must_use]
    pub const fn id(self) -> u16 {
        ((self.0 & 0x000f_fc00) >> 10) as u16
    }

    #[must_use]
    pub const fn size(self) -> u64 {
        (self.0 & 0x0000_03ff) as u64
    }

    /// On-disk footprint: tag header plus payload (none for tombstones).
    #[must_use]
    pub const fn dsize(self) -> u64 {
        4 + Self(self.0.wrapping_add(self.is_delete() as u32)).size()
    }

    /// Tag whose wrapping addition shifts the id field by `delta` entries.
    #[must_use]
    pub const fn id_delta(delta: i32) -> Self {
        Self((delta << 10) as u32)
    }

    #[must_use]
    pub const fn wrapping_add(self, other: Self) -> Self {
        Self(self.0.wrapping_add(other.0))
    }

    #[must_use]
    pub const fn wrapping_sub(self, other: Self) -> Self {
        Self(self.0.wrapping_sub(other.0))
    }

    #[must_use]
    pub const fn xor(self, other: Self) -> Self {
        Self(self.0 ^ other.0)
    }

    #[must_use]
    pub const fn and(self, mask: Self) -> Self {
        Self(self.0 & mask.0)
    }

    /// Set the valid bit, marking the tag invalid.
    #[must_use]
    pub const fn invalidate(self) -> Self {
        Self(self.0 | 0x8000_0000)
    }

    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag({:#010x}: type {:#05x}, id {:#05x}, size {:#05x})",
            self.0,
            self.type3(),
            self.id(),
            self.0 & 0x3ff,
        )
    }
}

// ── CRC ─────────────────────────────────────────────────────────────────────

/// Reflected IEEE 802.3 CRC-32, nibble at a time.
///
/// Commits seed with `0xffffffff` and store the raw register le32; the small
/// table keeps this usable on targets without a hardware CRC unit.
#[must_use]
pub fn crc32(mut crc: u32, data: &[u8]) -> u32 {
    const RTABLE: [u32; 16] = [
        0x0000_0000,
        0x1db7_1064,
        0x3b6e_20c8,
        0x26d9_30ac,
        0x76dc_4190,
        0x6b6b_51f4,
        0x4db2_6158,
        0x5005_713c,
        0xedb8_8320,
        0xf00f_9344,
        0xd6d6_a3e8,
        0xcb61_b38c,
        0x9b64_c2b0,
        0x86d3_d2d4,
        0xa00a_e278,
        0xbdbd_f21c,
    ];

    for &byte in data {
        crc = (crc >> 4) ^ RTABLE[((crc ^ u32::from(byte)) & 0xf) as usize];
        crc = (crc >> 4) ^ RTABLE[((crc ^ (u32::from(byte) >> 4)) & 0xf) as usize];
    }

    crc
}

// ── Arithmetic helpers ──────────────────────────────────────────────────────

/// Round `a` down to the nearest multiple of `alignment` (any non-zero
/// alignment, not just powers of two — read/program sizes are only required
/// to divide the cache size).
#[must_use]
pub fn align_down(a: u64, alignment: u64) -> u64 {
    a - (a % alignment)
}

/// Round `a` up to the nearest multiple of `alignment`.
#[must_use]
pub fn align_up(a: u64, alignment: u64) -> u64 {
    align_down(a + alignment - 1, alignment)
}

/// `⌈log2(a)⌉` for `a > 0`.
#[must_use]
pub fn ceil_log2(a: u64) -> u32 {
    debug_assert!(a > 0);
    64 - (a - 1).leading_zeros()
}

/// Sequence comparison of two 32-bit counters: the signed distance from `b`
/// to `a` ignoring overflow. Positive means `a` is newer.
#[must_use]
pub fn seq_cmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[inline]
#[must_use]
fn read_le_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
#[must_use]
fn read_le_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

// ── CTZ struct ──────────────────────────────────────────────────────────────

/// Head pointer and size of a CTZ skip-list, the on-disk form of an outlined
/// file (`CTZSTRUCT` payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ctz {
    pub head: BlockId,
    pub size: u64,
}

impl Ctz {
    pub const DISK_SIZE: usize = 16;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0_u8; Self::DISK_SIZE];
        out[..8].copy_from_slice(&self.head.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            head: read_le_u64(bytes, 0),
            size: read_le_u64(bytes, 8),
        }
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Superblock entry payload (`INLINESTRUCT` of entry 0 in pair (0, 1)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u64,
    pub block_count: u64,
    pub name_max: u64,
    pub file_max: u64,
    pub attr_max: u64,
}

impl Superblock {
    pub const DISK_SIZE: usize = 44;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0_u8; Self::DISK_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..12].copy_from_slice(&self.block_size.to_le_bytes());
        out[12..20].copy_from_slice(&self.block_count.to_le_bytes());
        out[20..28].copy_from_slice(&self.name_max.to_le_bytes());
        out[28..36].copy_from_slice(&self.file_max.to_le_bytes());
        out[36..44].copy_from_slice(&self.attr_max.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            version: read_le_u32(bytes, 0),
            block_size: read_le_u64(bytes, 4),
            block_count: read_le_u64(bytes, 12),
            name_max: read_le_u64(bytes, 20),
            file_max: read_le_u64(bytes, 28),
            attr_max: read_le_u64(bytes, 36),
        }
    }
}

// ── Global state ────────────────────────────────────────────────────────────

/// XOR-accumulated global state: a pending-move marker plus the orphan
/// counter. Each on-disk `MOVESTATE` tag XORs into this, so recording any
/// change costs one extra tag per commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GState {
    pub tag: Tag,
    pub pair: BlockPair,
}

impl GState {
    pub const DISK_SIZE: usize = 20;

    /// XOR every field. The pair words participate at full 64-bit width;
    /// anything narrower would let the high halves of relocated pair ids
    /// desync from disk.
    pub fn xor(&mut self, other: &Self) {
        self.tag = self.tag.xor(other.tag);
        self.pair[0] ^= other.pair[0];
        self.pair[1] ^= other.pair[1];
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.tag == Tag::NOOP && self.pair[0] == 0 && self.pair[1] == 0
    }

    #[must_use]
    pub fn has_orphans(&self) -> bool {
        self.tag.size() != 0
    }

    #[must_use]
    pub fn orphan_count(&self) -> u8 {
        self.tag.size() as u8
    }

    #[must_use]
    pub fn has_move(&self) -> bool {
        self.tag.type1() != 0
    }

    #[must_use]
    pub fn has_move_here(&self, pair: &BlockPair) -> bool {
        self.has_move() && pair_overlap(&self.pair, pair)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0_u8; Self::DISK_SIZE];
        out[0..4].copy_from_slice(&self.tag.0.to_le_bytes());
        out[4..12].copy_from_slice(&self.pair[0].to_le_bytes());
        out[12..20].copy_from_slice(&self.pair[1].to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            tag: Tag(read_le_u32(bytes, 0)),
            pair: [read_le_u64(bytes, 4), read_le_u64(bytes, 12)],
        }
    }
}

// ── Public info types ───────────────────────────────────────────────────────

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
}

/// Info about one file or directory, as returned by `stat` and directory
/// iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub kind: EntryKind,
    /// Size in bytes; only meaningful for regular files.
    pub size: u64,
    pub name: String,
}

/// Filesystem-level info, respecting what the superblock recorded at format
/// time rather than the mount configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub block_size: u64,
    pub block_count: u64,
    /// Blocks in use. Best effort: files sharing COW structure may be
    /// counted more than once.
    pub block_usage: u64,
    pub name_max: u64,
    pub file_max: u64,
    pub attr_max: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tag_field_extraction() {
        let tag = Tag::new(ttype::CREATE, 7, 0);
        assert_eq!(tag.type1(), ttype::SPLICE);
        assert_eq!(tag.type3(), ttype::CREATE);
        assert_eq!(tag.id(), 7);
        assert_eq!(tag.size(), 0);
        assert_eq!(tag.splice(), 1);
        assert!(tag.is_valid());
        assert!(!tag.is_delete());
    }

    #[test]
    fn delete_tag_sign_extension() {
        let del = Tag::new(ttype::DELETE, 3, SIZE_DELETE);
        assert!(del.is_delete());
        assert_eq!(del.splice(), -1);
        // tombstones carry no payload
        assert_eq!(del.dsize(), 4);

        let named = Tag::new(ttype::REG, 3, 11);
        assert!(!named.is_delete());
        assert_eq!(named.dsize(), 4 + 11);
    }

    #[test]
    fn invalid_bit() {
        assert!(!Tag::INVALID.is_valid());
        assert!(Tag::NOOP.is_valid());
        assert!(!Tag::new(ttype::REG, 0, 0).invalidate().is_valid());
    }

    #[test]
    fn id_delta_wraps_through_id_field() {
        let tag = Tag::new(ttype::REG, 5, 20);
        let up = tag.wrapping_add(Tag::id_delta(1));
        assert_eq!(up.id(), 6);
        assert_eq!(up.type3(), ttype::REG);
        let down = tag.wrapping_add(Tag::id_delta(-2));
        assert_eq!(down.id(), 3);
        assert_eq!(down.type3(), ttype::REG);
        assert_eq!(down.size(), 20);
    }

    #[test]
    fn noop_when_condition_fails() {
        assert_eq!(Tag::new_if(false, ttype::DELETE, 9, 0), Tag::NOOP);
        assert_eq!(
            Tag::new_if(true, ttype::DELETE, 9, 0),
            Tag::new(ttype::DELETE, 9, 0)
        );
    }

    #[test]
    fn crc_known_vectors() {
        // Raw register (seed 0xffffffff, no final xor) over "123456789":
        // the standard CRC-32 value xored with 0xffffffff.
        assert_eq!(crc32(0xffff_ffff, b"123456789"), 0xcbf4_3926 ^ 0xffff_ffff);
        assert_eq!(crc32(0xffff_ffff, b""), 0xffff_ffff);
    }

    #[test]
    fn crc_is_incremental() {
        let all = crc32(0xffff_ffff, b"hello world");
        let split = crc32(crc32(0xffff_ffff, b"hello "), b"world");
        assert_eq!(all, split);
    }

    #[test]
    fn alignment_math() {
        assert_eq!(align_down(100, 16), 96);
        assert_eq!(align_up(100, 16), 112);
        assert_eq!(align_up(96, 16), 96);
        assert_eq!(align_down(0, 16), 0);
        // Non-power-of-two program sizes are legal.
        assert_eq!(align_down(100, 24), 96);
        assert_eq!(align_up(100, 24), 120);
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(1 << 40), 40);
    }

    #[test]
    fn sequence_comparison_ignores_overflow() {
        assert!(seq_cmp(1, 0) > 0);
        assert!(seq_cmp(0, 1) < 0);
        assert_eq!(seq_cmp(5, 5), 0);
        // Revision counters that wrapped still compare as newer.
        assert!(seq_cmp(2, u32::MAX) > 0);
        assert!(seq_cmp(u32::MAX, 2) < 0);
    }

    #[test]
    fn pair_relations() {
        assert!(pair_is_null(&PAIR_NULL));
        assert!(pair_is_null(&[3, BLOCK_NULL]));
        assert!(!pair_is_null(&[0, 1]));

        assert!(pair_overlap(&[0, 1], &[1, 7]));
        assert!(!pair_overlap(&[0, 1], &[2, 3]));

        assert!(pair_same(&[4, 5], &[5, 4]));
        assert!(!pair_same(&[4, 5], &[4, 6]));
    }

    #[test]
    fn pair_codec_round_trip() {
        let pair = [0x1122_3344_5566_7788, 42];
        assert_eq!(pair_from_bytes(&pair_to_bytes(&pair)), pair);
    }

    #[test]
    fn superblock_codec_round_trip() {
        let sb = Superblock {
            version: DISK_VERSION,
            block_size: 512,
            block_count: 1024,
            name_max: NAME_MAX_DEFAULT,
            file_max: FILE_MAX_LIMIT,
            attr_max: ATTR_MAX_LIMIT,
        };
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), Superblock::DISK_SIZE);
        assert_eq!(Superblock::from_bytes(&bytes), sb);
        // version is le32 at the front
        assert_eq!(&bytes[0..4], &DISK_VERSION.to_le_bytes());
    }

    #[test]
    fn gstate_xor_and_flags() {
        let mut g = GState::default();
        assert!(g.is_zero());
        assert!(!g.has_move());
        assert!(!g.has_orphans());

        let delta = GState {
            tag: Tag::new(ttype::DELETE, 4, 0),
            pair: [0xdead_beef_0000_0001, 0xcafe_0000_0000_0002],
        };
        g.xor(&delta);
        assert!(g.has_move());
        assert!(g.has_move_here(&[0xdead_beef_0000_0001, 9]));
        assert!(!g.has_move_here(&[7, 9]));

        // XOR is an involution over the full 64-bit pair words.
        g.xor(&delta);
        assert!(g.is_zero());
    }

    #[test]
    fn gstate_orphan_counter_in_size_field() {
        let g = GState {
            tag: Tag::new(ttype::HAS_ORPHANS, 0, 3),
            pair: [0, 0],
        };
        assert!(g.has_orphans());
        assert_eq!(g.orphan_count(), 3);
        assert!(!g.tag.is_valid());
    }

    #[test]
    fn gstate_codec_round_trip() {
        let g = GState {
            tag: Tag::new(ttype::DELETE, 2, 0),
            pair: [0x0102_0304_0506_0708, 11],
        };
        assert_eq!(GState::from_bytes(&g.to_bytes()), g);
    }

    #[test]
    fn ctz_codec_round_trip() {
        let ctz = Ctz {
            head: 0x0011_2233_4455_6677,
            size: 10240,
        };
        assert_eq!(Ctz::from_bytes(&ctz.to_bytes()), ctz);
    }

    proptest! {
        #[test]
        fn tag_fields_round_trip(ttype in 0_u16..0x800, id in 0_u16..0x400, size in 0_u32..0x400) {
            let tag = Tag::new(ttype, id, size);
            prop_assert_eq!(tag.type3(), ttype);
            prop_assert_eq!(tag.id(), id);
            prop_assert_eq!(tag.size(), u64::from(size));
            prop_assert!(tag.is_valid());
        }

        #[test]
        fn tag_be_round_trip(raw in any::<u32>()) {
            let tag = Tag(raw);
            prop_assert_eq!(Tag::from_be_bytes(tag.to_be_bytes()), tag);
        }

        #[test]
        fn xor_chain_round_trip(a in any::<u32>(), b in any::<u32>()) {
            let a = Tag(a);
            let b = Tag(b);
            prop_assert_eq!(a.xor(b).xor(b), a);
        }

        #[test]
        fn crc_differs_on_flip(data in proptest::collection::vec(any::<u8>(), 1..256), idx in any::<proptest::sample::Index>()) {
            let mut flipped = data.clone();
            let i = idx.index(flipped.len());
            flipped[i] ^= 0x01;
            prop_assert_ne!(crc32(0xffff_ffff, &data), crc32(0xffff_ffff, &flipped));
        }

        #[test]
        fn superblock_any_round_trip(
            block_size in 1_u64..1 << 32,
            block_count in 1_u64..1 << 40,
            name_max in 1_u64..=NAME_MAX_LIMIT,
        ) {
            let sb = Superblock {
                version: DISK_VERSION,
                block_size,
                block_count,
                name_max,
                file_max: FILE_MAX_LIMIT,
                attr_max: ATTR_MAX_LIMIT,
            };
            prop_assert_eq!(Superblock::from_bytes(&sb.to_bytes()), sb);
        }
    }
}
