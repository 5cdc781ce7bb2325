//! Longer-running churn: wear-forced relocation and allocator reuse.

mod common;

use common::{remount, ERASE};
use flintfs::{Config, FlintFs, MemDevice, OpenFlags};

fn cycled_cfg(block_count: u64, block_cycles: i32) -> Config {
    Config {
        block_cycles,
        ..common::small_cfg(block_count)
    }
}

fn mount_fresh(block_count: u64, block_cycles: i32) -> FlintFs<MemDevice> {
    let cfg = cycled_cfg(block_count, block_cycles);
    let dev = flintfs::format(MemDevice::new(ERASE, block_count), cfg).unwrap();
    FlintFs::mount(dev, cfg).unwrap()
}

fn churn(fs: &FlintFs<MemDevice>, rounds: usize) {
    for round in 0..rounds {
        for i in 0..4 {
            let path = format!("/f{i}");
            let fh = fs
                .file_open(&path, OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC)
                .unwrap();
            let body = format!("round {round} file {i}");
            fs.file_write(fh, body.as_bytes()).unwrap();
            fs.file_close(fh).unwrap();
        }

        // everything written this round reads back
        for i in 0..4 {
            let path = format!("/f{i}");
            let fh = fs.file_open(&path, OpenFlags::RDONLY).unwrap();
            let size = fs.file_size(fh).unwrap() as usize;
            let mut buf = vec![0_u8; size];
            fs.file_read(fh, &mut buf).unwrap();
            assert_eq!(buf, format!("round {round} file {i}").as_bytes());
            fs.file_close(fh).unwrap();
        }
    }
}

#[test]
fn wear_leveling_with_odd_cycles() {
    // enough commits to trip the (block_cycles+1)|1 modulus repeatedly
    let fs = mount_fresh(32, 5);
    churn(&fs, 40);

    let dev = fs.unmount();
    let fs = FlintFs::mount(dev, cycled_cfg(32, 5)).unwrap();
    churn(&fs, 2);
}

#[test]
fn wear_leveling_with_even_cycles() {
    // even values are the degenerate case the modulus tweak exists for;
    // both blocks of a pair must still rotate
    let fs = mount_fresh(32, 4);
    churn(&fs, 40);

    let dev = fs.unmount();
    let fs = FlintFs::mount(dev, cycled_cfg(32, 4)).unwrap();
    churn(&fs, 2);
}

#[test]
fn allocator_never_hands_out_live_blocks() {
    // repeated create/delete forces the lookahead window to wrap and
    // repopulate from the tree many times; any reuse of a live block shows
    // up as corruption of a surviving file
    let fs = mount_fresh(24, -1);

    let keep = fs
        .file_open("/keep", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    let sentinel = vec![0xc3_u8; 2048];
    fs.file_write(keep, &sentinel).unwrap();
    fs.file_close(keep).unwrap();

    for round in 0..30 {
        let path = format!("/tmp{}", round % 3);
        let fh = fs
            .file_open(&path, OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC)
            .unwrap();
        fs.file_write(fh, &vec![round as u8; 1500]).unwrap();
        fs.file_close(fh).unwrap();

        if round % 3 == 2 {
            for i in 0..3 {
                fs.remove(&format!("/tmp{i}")).unwrap();
            }
        }

        // the sentinel never changes
        let fh = fs.file_open("/keep", OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0_u8; 2048];
        assert_eq!(fs.file_read(fh, &mut buf).unwrap(), 2048);
        assert_eq!(buf, sentinel);
        fs.file_close(fh).unwrap();
    }

    let fs = remount(fs, 24);
    let fh = fs.file_open("/keep", OpenFlags::RDONLY).unwrap();
    let mut buf = vec![0_u8; 2048];
    assert_eq!(fs.file_read(fh, &mut buf).unwrap(), 2048);
    assert_eq!(buf, sentinel);
    fs.file_close(fh).unwrap();
}

#[test]
fn bad_block_relocation_for_file_data() {
    // mark a block bad after format; file writes that land on it must
    // transparently relocate
    let cfg = cycled_cfg(32, -1);
    let mut dev = flintfs::format(MemDevice::new(ERASE, 32), cfg).unwrap();
    // a handful of data-range blocks fail at program time
    for unit in [9, 13] {
        dev.set_bad(unit, true);
    }
    let fs = FlintFs::mount(dev, cfg).unwrap();

    let fh = fs
        .file_open("/data", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    let body: Vec<u8> = (0..4096_u32).map(|i| i as u8).collect();
    fs.file_write(fh, &body).unwrap();
    fs.file_close(fh).unwrap();

    let fh = fs.file_open("/data", OpenFlags::RDONLY).unwrap();
    let mut buf = vec![0_u8; body.len()];
    assert_eq!(fs.file_read(fh, &mut buf).unwrap(), body.len());
    assert_eq!(buf, body);
    fs.file_close(fh).unwrap();
}
