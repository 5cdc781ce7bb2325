//! Shared fixtures for the integration tests: small in-memory devices with
//! byte-granular program units, the geometry most tests run on.
#![allow(dead_code)] // not every test binary uses every fixture

use flintfs::{Config, FlintFs, MemDevice};

pub const ERASE: u64 = 512;

/// Byte-granular config over 512-byte blocks.
#[must_use]
pub fn small_cfg(block_count: u64) -> Config {
    Config {
        read_size: 1,
        prog_size: 1,
        erase_size: ERASE,
        block_size: ERASE,
        block_count,
        block_cycles: -1,
        cache_size: 64,
        lookahead_size: 16,
        ..Config::default()
    }
}

/// Format a fresh in-memory device and mount it.
#[must_use]
pub fn fresh(block_count: u64) -> FlintFs<MemDevice> {
    let cfg = small_cfg(block_count);
    let dev = flintfs::format(MemDevice::new(ERASE, block_count), cfg)
        .expect("format");
    FlintFs::mount(dev, cfg).expect("mount")
}

/// Unmount and remount, returning the new handle.
#[must_use]
pub fn remount(fs: FlintFs<MemDevice>, block_count: u64) -> FlintFs<MemDevice> {
    let dev = fs.unmount();
    FlintFs::mount(dev, small_cfg(block_count)).expect("remount")
}
