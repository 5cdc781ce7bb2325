#![forbid(unsafe_code)]
//! Block device abstraction and caching layer for FlintFS.
//!
//! Provides the [`BlockDevice`] trait the host implements, the logical-block
//! to physical-erase-unit translation, and the cached read / program / flush
//! / compare primitives everything above builds on. One read cache and one
//! write cache belong to the filesystem; each open file carries one more.
//!
//! Caches are passed explicitly (rather than reached through a filesystem
//! handle) so callers can mix the shared caches with per-file ones without
//! aliasing: reads consult an optional write cache first for write-through
//! semantics, then the read cache, then the device.

use flint_error::{FlintError, Result};
use flint_types::{align_down, align_up, BlockId, BLOCK_INLINE, BLOCK_NULL};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::trace;

mod mem;

pub use mem::MemDevice;

// ── Device interface ────────────────────────────────────────────────────────

/// Host-supplied storage backing.
///
/// Blocks here are *physical erase units* of `Geometry::erase_size` bytes;
/// the translation from logical blocks happens in this crate. `read` and
/// `program` lengths are multiples of the read/program granularity and never
/// cross an erase-unit boundary.
pub trait BlockDevice {
    /// Read `buf.len()` bytes from `off` within erase unit `block`.
    fn read(&mut self, block: BlockId, off: u64, buf: &mut [u8]) -> Result<()>;

    /// Program previously-erased bytes at `off` within erase unit `block`.
    ///
    /// May return [`FlintError::Corrupt`] to mark the block bad.
    fn program(&mut self, block: BlockId, off: u64, data: &[u8]) -> Result<()>;

    /// Erase one unit. Post-state is all-ones or undefined. May return
    /// [`FlintError::Corrupt`] to mark the block bad.
    fn erase(&mut self, block: BlockId) -> Result<()>;

    /// Flush any device-level buffering.
    fn sync(&mut self) -> Result<()>;

    /// Grow the underlying storage, given the current logical block count.
    /// Returns the new logical block count, or [`FlintError::NoSpace`] if the
    /// device cannot (or will not) grow.
    fn extend(&mut self, block_count: u64) -> Result<u64> {
        let _ = block_count;
        Err(FlintError::NoSpace)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Resolved device geometry.
///
/// `block_size` may be a multiple of `erase_size`; `cache_size` divides
/// `erase_size` and is a multiple of both granularities. `block_count` is in
/// logical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub read_size: u64,
    pub prog_size: u64,
    pub cache_size: u64,
    pub erase_size: u64,
    pub block_size: u64,
    pub block_count: u64,
}

impl Geometry {
    /// Erase units per logical block.
    #[must_use]
    pub fn units_per_block(&self) -> u64 {
        self.block_size / self.erase_size
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// One block-granular cache: a window of `size` bytes at `off` within
/// `block`, or invalid when `block` is [`BLOCK_NULL`].
#[derive(Debug, Clone)]
pub struct Cache {
    pub block: BlockId,
    pub off: u64,
    pub size: u64,
    pub buffer: Vec<u8>,
}

impl Cache {
    #[must_use]
    pub fn new(cache_size: u64) -> Self {
        Self {
            block: BLOCK_NULL,
            off: 0,
            size: 0,
            buffer: vec![0xff; cache_size as usize],
        }
    }

    /// Invalidate without touching the buffer; cheaper when the contents are
    /// read-only or about to be rewritten with identical data (relocates).
    pub fn discard(&mut self) {
        self.block = BLOCK_NULL;
    }

    /// Invalidate and fill with the erased pattern to avoid leaking stale
    /// data into padding that later gets programmed.
    pub fn zero(&mut self) {
        self.buffer.fill(0xff);
        self.block = BLOCK_NULL;
        self.off = 0;
        self.size = 0;
    }
}

// ── Raw device access with erase-size translation ───────────────────────────

fn raw_read(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    block: BlockId,
    off: u64,
    buf: &mut [u8],
) -> Result<()> {
    debug_assert!(block < geo.block_count);
    debug_assert!(off + buf.len() as u64 <= geo.block_size);
    debug_assert_eq!(buf.len() as u64 % geo.read_size, 0);

    // adjust to physical erase units
    let mut unit = block * geo.units_per_block() + off / geo.erase_size;
    let mut off = off % geo.erase_size;
    let mut buf = buf;

    while !buf.is_empty() {
        let delta = (buf.len() as u64).min(geo.erase_size - off) as usize;
        let (chunk, rest) = buf.split_at_mut(delta);
        dev.read(unit, off, chunk)?;

        off += delta as u64;
        if off == geo.erase_size {
            unit += 1;
            off = 0;
        }
        buf = rest;
    }

    Ok(())
}

fn raw_prog(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    block: BlockId,
    off: u64,
    data: &[u8],
) -> Result<()> {
    debug_assert!(block < geo.block_count);
    debug_assert!(off + data.len() as u64 <= geo.block_size);
    debug_assert_eq!(data.len() as u64 % geo.prog_size, 0);

    let mut unit = block * geo.units_per_block() + off / geo.erase_size;
    let mut off = off % geo.erase_size;
    let mut data = data;

    while !data.is_empty() {
        let delta = (data.len() as u64).min(geo.erase_size - off) as usize;
        let (chunk, rest) = data.split_at(delta);
        dev.program(unit, off, chunk)?;

        off += delta as u64;
        if off == geo.erase_size {
            unit += 1;
            off = 0;
        }
        data = rest;
    }

    Ok(())
}

/// Erase every erase unit inside logical block `block`.
pub fn erase(dev: &mut (impl BlockDevice + ?Sized), geo: &Geometry, block: BlockId) -> Result<()> {
    debug_assert!(block < geo.block_count);
    let first = block * geo.units_per_block();
    for unit in first..first + geo.units_per_block() {
        dev.erase(unit)?;
    }
    Ok(())
}

// ── Cached primitives ───────────────────────────────────────────────────────

/// Cached read of `buf.len()` bytes at `(block, off)`.
///
/// The optional write cache is consulted first (write-through), the read
/// cache next. Reads of at least `hint` aligned bytes bypass the cache;
/// otherwise the read cache is repopulated, aligned down to the read
/// granularity and sized up to `hint` (capped by the cache size).
#[allow(clippy::too_many_arguments)]
pub fn read(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    pcache: Option<&Cache>,
    rcache: &mut Cache,
    hint: u64,
    block: BlockId,
    off: u64,
    buf: &mut [u8],
) -> Result<()> {
    if block >= geo.block_count || off + buf.len() as u64 > geo.block_size {
        return Err(FlintError::Corrupt);
    }

    let mut off = off;
    let mut buf = buf;

    while !buf.is_empty() {
        let mut diff = buf.len() as u64;

        if let Some(pcache) = pcache {
            if block == pcache.block && off < pcache.off + pcache.size {
                if off >= pcache.off {
                    // already in the write cache?
                    let diff = diff.min(pcache.size - (off - pcache.off)) as usize;
                    let start = (off - pcache.off) as usize;
                    buf[..diff].copy_from_slice(&pcache.buffer[start..start + diff]);

                    off += diff as u64;
                    buf = &mut buf[diff..];
                    continue;
                }

                // write cache takes priority
                diff = diff.min(pcache.off - off);
            }
        }

        if block == rcache.block && off < rcache.off + rcache.size {
            if off >= rcache.off {
                // already in the read cache?
                let diff = diff.min(rcache.size - (off - rcache.off)) as usize;
                let start = (off - rcache.off) as usize;
                buf[..diff].copy_from_slice(&rcache.buffer[start..start + diff]);

                off += diff as u64;
                buf = &mut buf[diff..];
                continue;
            }

            // read cache takes priority
            diff = diff.min(rcache.off - off);
        }

        if buf.len() as u64 >= hint && off % geo.read_size == 0 && buf.len() as u64 >= geo.read_size
        {
            // bypass the cache
            let diff = align_down(diff, geo.read_size) as usize;
            raw_read(dev, geo, block, off, &mut buf[..diff])?;

            off += diff as u64;
            buf = &mut buf[diff..];
            continue;
        }

        // load into the read cache; after this the first branch cannot fail
        rcache.block = block;
        rcache.off = align_down(off, geo.read_size);
        rcache.size = (align_up(off + hint, geo.read_size).min(geo.block_size) - rcache.off)
            .min(geo.cache_size);
        let size = rcache.size as usize;
        raw_read(dev, geo, rcache.block, rcache.off, &mut rcache.buffer[..size])?;
    }

    Ok(())
}

/// Streaming comparison of on-disk bytes against `data`.
pub fn cmp(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    pcache: Option<&Cache>,
    rcache: &mut Cache,
    hint: u64,
    block: BlockId,
    off: u64,
    data: &[u8],
) -> Result<Ordering> {
    let mut scratch = [0_u8; 256];

    let mut idx = 0_usize;
    while idx < data.len() {
        let diff = (data.len() - idx).min(scratch.len());
        read(
            dev,
            geo,
            pcache,
            rcache,
            hint.saturating_sub(idx as u64),
            block,
            off + idx as u64,
            &mut scratch[..diff],
        )?;

        match scratch[..diff].cmp(&data[idx..idx + diff]) {
            Ordering::Equal => {}
            other => return Ok(other),
        }

        idx += diff;
    }

    Ok(Ordering::Equal)
}

/// Program the accumulated write cache, optionally read-verifying.
pub fn flush(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    pcache: &mut Cache,
    rcache: &mut Cache,
    validate: bool,
) -> Result<()> {
    if pcache.block != BLOCK_NULL && pcache.block != BLOCK_INLINE {
        let diff = align_up(pcache.size, geo.prog_size);
        trace!(
            target: "flint::block",
            block = pcache.block,
            off = pcache.off,
            len = diff,
            "flush"
        );
        raw_prog(dev, geo, pcache.block, pcache.off, &pcache.buffer[..diff as usize])?;

        if validate {
            // check what hit the disk
            rcache.discard();
            let res = cmp(
                dev,
                geo,
                None,
                rcache,
                diff,
                pcache.block,
                pcache.off,
                &pcache.buffer[..diff as usize],
            )?;
            if res != Ordering::Equal {
                return Err(FlintError::Corrupt);
            }
        }

        pcache.zero();
    }

    Ok(())
}

/// Flush the write cache and sync the device.
pub fn sync(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    pcache: &mut Cache,
    rcache: &mut Cache,
    validate: bool,
) -> Result<()> {
    rcache.discard();
    flush(dev, geo, pcache, rcache, validate)?;
    dev.sync()
}

/// Cached program of `data` at `(block, off)`.
///
/// Data accumulates in the single-block write cache, which is flushed eagerly
/// when full. The cache must have been flushed before targeting a different
/// block.
#[allow(clippy::too_many_arguments)]
pub fn write(
    dev: &mut (impl BlockDevice + ?Sized),
    geo: &Geometry,
    pcache: &mut Cache,
    rcache: &mut Cache,
    validate: bool,
    block: BlockId,
    off: u64,
    data: &[u8],
) -> Result<()> {
    debug_assert!(block == BLOCK_INLINE || block < geo.block_count);
    debug_assert!(off + data.len() as u64 <= geo.block_size);

    let mut off = off;
    let mut data = data;

    while !data.is_empty() {
        if block == pcache.block && off >= pcache.off && off < pcache.off + geo.cache_size {
            // fits in the write cache?
            let diff = (data.len() as u64).min(geo.cache_size - (off - pcache.off)) as usize;
            let start = (off - pcache.off) as usize;
            pcache.buffer[start..start + diff].copy_from_slice(&data[..diff]);

            off += diff as u64;
            data = &data[diff..];

            pcache.size = pcache.size.max(off - pcache.off);
            if pcache.size == geo.cache_size {
                // eagerly flush out the write cache if we fill up
                flush(dev, geo, pcache, rcache, validate)?;
            }

            continue;
        }

        // the write cache must have been flushed, either by programming an
        // entire block or by an explicit flush
        debug_assert_eq!(pcache.block, BLOCK_NULL);

        // prepare the write cache; after this the first branch cannot fail
        pcache.block = block;
        pcache.off = align_down(off, geo.prog_size);
        pcache.size = 0;
    }

    Ok(())
}

// ── Bad-block bookkeeping for tests ─────────────────────────────────────────

/// Set of erase units that fail program/erase, shared by test devices.
pub type BadBlocks = BTreeSet<BlockId>;

#[cfg(test)]
mod tests {
    use super::*;

    fn geo(read: u64, prog: u64, cache: u64, erase: u64, block: u64, count: u64) -> Geometry {
        Geometry {
            read_size: read,
            prog_size: prog,
            cache_size: cache,
            erase_size: erase,
            block_size: block,
            block_count: count,
        }
    }

    #[test]
    fn write_read_through_caches() {
        let g = geo(1, 1, 16, 64, 64, 8);
        let mut dev = MemDevice::new(64, 8);
        let mut pcache = Cache::new(16);
        let mut rcache = Cache::new(16);

        erase(&mut dev, &g, 2).unwrap();
        write(&mut dev, &g, &mut pcache, &mut rcache, false, 2, 0, b"hello").unwrap();

        // unflushed data must be visible via the write cache
        let mut buf = [0_u8; 5];
        read(&mut dev, &g, Some(&pcache), &mut rcache, 5, 2, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        flush(&mut dev, &g, &mut pcache, &mut rcache, true).unwrap();
        assert_eq!(pcache.block, BLOCK_NULL);

        let mut buf = [0_u8; 5];
        read(&mut dev, &g, None, &mut rcache, 5, 2, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn cache_fills_and_flushes_eagerly() {
        let g = geo(1, 1, 8, 64, 64, 4);
        let mut dev = MemDevice::new(64, 4);
        let mut pcache = Cache::new(8);
        let mut rcache = Cache::new(8);

        erase(&mut dev, &g, 0).unwrap();
        let data: Vec<u8> = (0..32).collect();
        write(&mut dev, &g, &mut pcache, &mut rcache, false, 0, 0, &data).unwrap();
        flush(&mut dev, &g, &mut pcache, &mut rcache, false).unwrap();

        let mut buf = [0_u8; 32];
        read(&mut dev, &g, None, &mut rcache, 32, 0, 0, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn logical_block_spans_erase_units() {
        // block_size = 2 * erase_size: logical block 1 starts at unit 2
        let g = geo(1, 1, 32, 32, 64, 4);
        let mut dev = MemDevice::new(32, 8);
        let mut pcache = Cache::new(32);
        let mut rcache = Cache::new(32);

        erase(&mut dev, &g, 1).unwrap();
        write(&mut dev, &g, &mut pcache, &mut rcache, false, 1, 30, &[0xaa; 4]).unwrap();
        flush(&mut dev, &g, &mut pcache, &mut rcache, false).unwrap();

        // bytes land at the tail of unit 2 and the head of unit 3
        let mut tail = [0_u8; 2];
        dev.read(2, 30, &mut tail).unwrap();
        let mut head = [0_u8; 2];
        dev.read(3, 0, &mut head).unwrap();
        assert_eq!(tail, [0xaa, 0xaa]);
        assert_eq!(head, [0xaa, 0xaa]);
    }

    #[test]
    fn cmp_orders_like_memcmp() {
        let g = geo(1, 1, 16, 64, 64, 4);
        let mut dev = MemDevice::new(64, 4);
        let mut pcache = Cache::new(16);
        let mut rcache = Cache::new(16);

        erase(&mut dev, &g, 0).unwrap();
        write(&mut dev, &g, &mut pcache, &mut rcache, false, 0, 0, b"mango").unwrap();
        flush(&mut dev, &g, &mut pcache, &mut rcache, false).unwrap();

        assert_eq!(
            cmp(&mut dev, &g, None, &mut rcache, 5, 0, 0, b"mango").unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            cmp(&mut dev, &g, None, &mut rcache, 5, 0, 0, b"manGo").unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            cmp(&mut dev, &g, None, &mut rcache, 5, 0, 0, b"mangz").unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn validate_catches_bad_programs() {
        let g = geo(1, 1, 16, 64, 64, 4);
        let mut dev = MemDevice::new(64, 4);
        dev.set_silent_corruption(1, true);
        let mut pcache = Cache::new(16);
        let mut rcache = Cache::new(16);

        erase(&mut dev, &g, 1).unwrap();
        write(&mut dev, &g, &mut pcache, &mut rcache, true, 1, 0, b"data").unwrap();
        assert_eq!(
            flush(&mut dev, &g, &mut pcache, &mut rcache, true),
            Err(FlintError::Corrupt)
        );
    }

    #[test]
    fn out_of_range_read_is_corrupt() {
        let g = geo(1, 1, 16, 64, 64, 4);
        let mut dev = MemDevice::new(64, 4);
        let mut rcache = Cache::new(16);
        let mut buf = [0_u8; 4];
        assert_eq!(
            read(&mut dev, &g, None, &mut rcache, 4, 9, 0, &mut buf),
            Err(FlintError::Corrupt)
        );
        assert_eq!(
            read(&mut dev, &g, None, &mut rcache, 4, 0, 62, &mut buf),
            Err(FlintError::Corrupt)
        );
    }
}
