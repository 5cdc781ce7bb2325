//! Format, mount and superblock behavior.

mod common;

use common::{fresh, remount, small_cfg, ERASE};
use flintfs::{Config, FlintError, FlintFs, MemDevice};

#[test]
fn format_mount_cycle_yields_empty_root() {
    // format; mount; unmount; mount succeeds and the root is empty
    let fs = fresh(16);
    let fs = remount(fs, 16);

    let dh = fs.dir_open("/").unwrap();
    let dot = fs.dir_read(dh).unwrap().unwrap();
    assert_eq!(dot.name, ".");
    let dotdot = fs.dir_read(dh).unwrap().unwrap();
    assert_eq!(dotdot.name, "..");
    assert_eq!(fs.dir_read(dh).unwrap(), None);
    fs.dir_close(dh).unwrap();
}

#[test]
fn mount_unformatted_device_fails() {
    let res = FlintFs::mount(MemDevice::new(ERASE, 16), small_cfg(16));
    assert!(res.is_err());
}

#[test]
fn mount_survives_unrelated_unmounts() {
    let fs = fresh(16);
    fs.mkdir("/keep").unwrap();
    let fs = remount(fs, 16);
    assert_eq!(fs.stat("/keep").unwrap().name, "keep");
    let fs = remount(fs, 16);
    assert_eq!(fs.stat("/keep").unwrap().name, "keep");
}

#[test]
fn fs_stat_reports_superblock_limits() {
    let fs = fresh(16);
    let info = fs.fs_stat().unwrap();
    assert_eq!(info.block_size, ERASE);
    assert_eq!(info.block_count, 16);
    assert_eq!(info.name_max, 255);
    assert_eq!(info.attr_max, 1022);
    assert!(info.block_usage >= 2);
}

#[test]
fn block_size_autodetection_equal_to_erase() {
    // format with block_size == erase_size, mount with block_size = 0
    let cfg = small_cfg(32);
    let dev = flintfs::format(MemDevice::new(ERASE, 32), cfg).unwrap();

    let probe = Config {
        block_size: 0,
        block_count: 32, // in erase units when autodetecting
        ..cfg
    };
    let fs = FlintFs::mount(dev, probe).unwrap();
    assert_eq!(fs.geometry().block_size, ERASE);
    assert_eq!(fs.geometry().block_count, 32);
}

#[test]
fn block_size_autodetection_multiple_of_erase() {
    // block_size = 2 * erase_size
    let cfg = Config {
        block_size: 2 * ERASE,
        block_count: 16,
        ..small_cfg(0)
    };
    let dev = flintfs::format(MemDevice::new(ERASE, 32), cfg).unwrap();

    let probe = Config {
        block_size: 0,
        block_count: 32, // erase units
        ..cfg
    };
    let fs = FlintFs::mount(dev, probe).unwrap();
    assert_eq!(fs.geometry().block_size, 2 * ERASE);
    assert_eq!(fs.geometry().block_count, 16);

    // still a working filesystem at the detected size
    fs.mkdir("/d").unwrap();
    assert_eq!(fs.stat("/d").unwrap().name, "d");
}

#[test]
fn mount_learns_block_count_from_superblock() {
    let cfg = small_cfg(24);
    let dev = flintfs::format(MemDevice::new(ERASE, 24), cfg).unwrap();

    let probe = Config {
        block_count: 0,
        ..cfg
    };
    let fs = FlintFs::mount(dev, probe).unwrap();
    assert_eq!(fs.geometry().block_count, 24);
}

#[test]
fn config_validation_rejects_nonsense() {
    // zero read granularity
    let cfg = Config {
        read_size: 0,
        ..small_cfg(16)
    };
    assert_eq!(
        flintfs::format(MemDevice::new(ERASE, 16), cfg).unwrap_err(),
        FlintError::Inval
    );

    // cache not a multiple of prog size
    let cfg = Config {
        prog_size: 48,
        ..small_cfg(16)
    };
    assert_eq!(
        flintfs::format(MemDevice::new(ERASE, 16), cfg).unwrap_err(),
        FlintError::Inval
    );

    // block_cycles = 0 is not supported
    let cfg = Config {
        block_cycles: 0,
        ..small_cfg(16)
    };
    assert_eq!(
        flintfs::format(MemDevice::new(ERASE, 16), cfg).unwrap_err(),
        FlintError::Inval
    );
}

#[test]
fn grow_updates_superblock() {
    let fs = fresh(16);
    fs.fs_grow(24).unwrap();
    assert_eq!(fs.fs_stat().unwrap().block_count, 24);

    // shrink is refused
    assert_eq!(fs.fs_grow(8).unwrap_err(), FlintError::Inval);

    // the grown count survives a remount (device itself must be bigger)
    let dev = fs.unmount();
    let image = dev.image().to_vec();
    let mut image = image;
    image.resize((ERASE * 24) as usize, 0xff);
    let dev = MemDevice::from_image(ERASE, image);
    let fs = FlintFs::mount(dev, small_cfg(24)).unwrap();
    assert_eq!(fs.fs_stat().unwrap().block_count, 24);
}
