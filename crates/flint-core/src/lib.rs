#![forbid(unsafe_code)]
//! Core filesystem engine for FlintFS.
//!
//! A power-loss-resilient filesystem for raw block-erasable storage. File
//! data lives in copy-on-write CTZ skip-lists, metadata lives in two-block
//! logs ("pairs") finalized by CRC tags, and a rolling lookahead bitmap
//! hands out free blocks. Every mutation is an atomic commit: after a power
//! loss the device holds some prefix of the commit stream, the torn suffix
//! fails its CRC, and a forced-consistency pass (demove + deorphan) resolves
//! the in-between states a multi-commit operation can leave behind.
//!
//! This crate is the unlocked engine; `flintfs` wraps it with the mutual
//! exclusion and tracing expected at the public boundary.

use flint_block::{BlockDevice, Cache, Geometry};
use flint_error::{FlintError, Result};
use flint_types::{BlockPair, GState, PAIR_NULL};
use serde::{Deserialize, Serialize};

mod alloc;
mod commit;
mod ctz;
mod dir;
mod file;
mod fs;
mod handles;
mod mdir;
mod ops;
mod path;
mod traverse;

pub use flint_block::MemDevice;
pub use flint_error::FlintError as Error;
pub use flint_types::{EntryInfo, EntryKind, FsInfo};
pub use handles::{DirHandle, FileHandle};

use alloc::Lookahead;
use handles::Handles;

// ── Configuration ───────────────────────────────────────────────────────────

/// Filesystem configuration.
///
/// Zero means "default": `erase_size` falls back to `block_size`,
/// `block_size` to autodetection at mount, `block_count` to whatever the
/// superblock records, the limits to their on-disk hard maxima and
/// `metadata_max` to `block_size`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Config {
    /// Read granularity in bytes; every device read is a multiple of this.
    pub read_size: u64,
    /// Program granularity in bytes.
    pub prog_size: u64,
    /// Physical erase unit in bytes; 0 means equal to `block_size`.
    pub erase_size: u64,
    /// Logical erasable block in bytes; may be a multiple of `erase_size`.
    /// 0 means autodetect at mount.
    pub block_size: u64,
    /// Total logical blocks; 0 at mount means learn from the superblock.
    pub block_count: u64,
    /// Erase cycles per metadata pair before forced relocation; -1 disables
    /// block-level wear-leveling. 100-1000 is typical.
    pub block_cycles: i32,
    /// Bytes per cache buffer. Must be a multiple of the read and program
    /// sizes and a factor of the erase size.
    pub cache_size: u64,
    /// Lookahead bitmap size in bytes; a multiple of 8. Each byte tracks 8
    /// blocks.
    pub lookahead_size: u64,
    /// Upper limit on name length; 0 means 255, capped at 1022.
    pub name_max: u64,
    /// Upper limit on file size; 0 means the on-disk maximum.
    pub file_max: u64,
    /// Upper limit on custom attribute size; 0 means 1022.
    pub attr_max: u64,
    /// Upper limit on bytes given to a metadata pair; 0 means `block_size`.
    /// Lowering this bounds compaction time on large-block devices.
    pub metadata_max: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_size: 0,
            prog_size: 0,
            erase_size: 0,
            block_size: 0,
            block_count: 0,
            block_cycles: -1,
            cache_size: 0,
            lookahead_size: 0,
            name_max: 0,
            file_max: 0,
            attr_max: 0,
            metadata_max: 0,
        }
    }
}

// ── Open flags ──────────────────────────────────────────────────────────────

/// File open mode, bitwise-orable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub(crate) u32);

impl OpenFlags {
    pub const RDONLY: Self = Self(fflags::RDONLY);
    pub const WRONLY: Self = Self(fflags::WRONLY);
    pub const RDWR: Self = Self(fflags::RDWR);
    /// Create the file if it does not exist.
    pub const CREAT: Self = Self(fflags::CREAT);
    /// Fail if the file already exists.
    pub const EXCL: Self = Self(fflags::EXCL);
    /// Truncate the existing file to zero size.
    pub const TRUNC: Self = Self(fflags::TRUNC);
    /// Move to the end of the file on every write.
    pub const APPEND: Self = Self(fflags::APPEND);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// File state bits. The low half mirrors the open flags; the high half is
/// internal bookkeeping.
pub(crate) mod fflags {
    pub const RDONLY: u32 = 1;
    pub const WRONLY: u32 = 2;
    pub const RDWR: u32 = 3;
    pub const CREAT: u32 = 0x0100;
    pub const EXCL: u32 = 0x0200;
    pub const TRUNC: u32 = 0x0400;
    pub const APPEND: u32 = 0x0800;

    /// Metadata (ctz/size/inline payload) differs from disk.
    pub const DIRTY: u32 = 0x10000;
    /// Unflushed data past `ctz.size` or into new blocks.
    pub const WRITING: u32 = 0x20000;
    /// Cache holds data from the current block.
    pub const READING: u32 = 0x40000;
    /// A write failed; sync is a no-op until close.
    pub const ERRED: u32 = 0x80000;
    /// Data lives inline in the parent directory entry.
    pub const INLINE: u32 = 0x10_0000;
}

/// Per-open-file custom attribute.
///
/// With read access the buffer is filled from disk at open (zero-padded or
/// truncated to its length); with write access it is committed atomically
/// with the file contents at every sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAttr {
    pub atype: u8,
    pub data: Vec<u8>,
}

/// Extra per-file open configuration.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub attrs: Vec<OpenAttr>,
}

// ── Filesystem handle ───────────────────────────────────────────────────────

/// A mounted (or mid-format) filesystem.
///
/// All operations take `&mut self`; the engine is single-threaded by design
/// and mutual exclusion is the caller's job (see `flintfs`).
pub struct Fs<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) cfg: Config,
    pub(crate) geo: Geometry,

    pub(crate) name_max: u64,
    pub(crate) file_max: u64,
    pub(crate) attr_max: u64,

    pub(crate) rcache: Cache,
    pub(crate) pcache: Cache,

    pub(crate) root: BlockPair,
    pub(crate) handles: Handles,
    pub(crate) seed: u32,

    pub(crate) gstate: GState,
    pub(crate) gdisk: GState,
    pub(crate) gdelta: GState,

    pub(crate) free: Lookahead,
}

impl<D: BlockDevice> Fs<D> {
    /// Validate the configuration and build the in-memory state. Shared by
    /// format and mount; does not touch the device.
    pub(crate) fn init(dev: D, cfg: Config) -> Result<Self> {
        if cfg.read_size == 0 || cfg.prog_size == 0 || cfg.cache_size == 0 {
            return Err(FlintError::Inval);
        }
        if cfg.erase_size == 0 && cfg.block_size == 0 {
            return Err(FlintError::Inval);
        }
        if cfg.cache_size % cfg.read_size != 0 || cfg.cache_size % cfg.prog_size != 0 {
            return Err(FlintError::Inval);
        }

        let erase_size = if cfg.erase_size != 0 {
            cfg.erase_size
        } else {
            cfg.block_size
        };

        // block_size multiple of erase_size multiple of cache_size implies
        // everything is a multiple of the read and program sizes
        if erase_size % cfg.cache_size != 0 {
            return Err(FlintError::Inval);
        }
        if cfg.block_size != 0 && cfg.block_size % erase_size != 0 {
            return Err(FlintError::Inval);
        }

        // block_cycles = 0 is not supported; -1 disables wear-leveling
        if cfg.block_cycles == 0 {
            return Err(FlintError::Inval);
        }

        if cfg.lookahead_size == 0 || cfg.lookahead_size % 8 != 0 {
            return Err(FlintError::Inval);
        }

        if cfg.name_max > flint_types::NAME_MAX_LIMIT
            || cfg.file_max > flint_types::FILE_MAX_LIMIT
            || cfg.attr_max > flint_types::ATTR_MAX_LIMIT
        {
            return Err(FlintError::Inval);
        }
        if cfg.block_size != 0 && cfg.metadata_max > cfg.block_size {
            return Err(FlintError::Inval);
        }

        let name_max = if cfg.name_max != 0 {
            cfg.name_max
        } else {
            flint_types::NAME_MAX_DEFAULT
        };
        let file_max = if cfg.file_max != 0 {
            cfg.file_max
        } else {
            flint_types::FILE_MAX_LIMIT
        };
        let attr_max = if cfg.attr_max != 0 {
            cfg.attr_max
        } else {
            flint_types::ATTR_MAX_LIMIT
        };

        let geo = Geometry {
            read_size: cfg.read_size,
            prog_size: cfg.prog_size,
            cache_size: cfg.cache_size,
            erase_size,
            block_size: cfg.block_size,
            block_count: cfg.block_count,
        };

        Ok(Self {
            dev,
            cfg,
            geo,
            name_max,
            file_max,
            attr_max,
            rcache: Cache::new(cfg.cache_size),
            pcache: Cache::new(cfg.cache_size),
            root: PAIR_NULL,
            handles: Handles::new(),
            seed: 0,
            gstate: GState::default(),
            gdisk: GState::default(),
            gdelta: GState::default(),
            free: Lookahead::new(cfg.lookahead_size),
        })
    }

    /// Space a metadata pair may occupy, in bytes.
    pub(crate) fn metadata_max(&self) -> u64 {
        if self.cfg.metadata_max != 0 {
            self.cfg.metadata_max
        } else {
            self.geo.block_size
        }
    }

    /// Largest payload an inline file may hold.
    pub(crate) fn inline_max(&self) -> u64 {
        0x3fe_u64
            .min(self.geo.cache_size)
            .min(self.metadata_max() / 8)
    }

    /// Release the device without touching storage.
    pub fn into_device(self) -> D {
        self.dev
    }

    /// Device geometry as resolved by format/mount.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geo
    }
}
