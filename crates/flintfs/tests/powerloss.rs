//! Power-loss replays: every program-granularity snapshot of the device
//! must mount to one of the operation's consistent before/after states.

mod common;

use common::{small_cfg, ERASE};
use flintfs::{FlintError, FlintFs, MemDevice, OpenFlags};

const BLOCKS: u64 = 16;

fn setup(setup_ops: impl FnOnce(&FlintFs<MemDevice>)) -> MemDevice {
    let cfg = small_cfg(BLOCKS);
    let dev = flintfs::format(MemDevice::new(ERASE, BLOCKS), cfg).unwrap();
    let fs = FlintFs::mount(dev, cfg).unwrap();
    setup_ops(&fs);
    fs.unmount()
}

/// Run `op` with snapshot recording on, returning one image per program.
fn record(mut dev: MemDevice, op: impl FnOnce(&FlintFs<MemDevice>)) -> Vec<Vec<u8>> {
    dev.record_snapshots(true);
    let fs = FlintFs::mount(dev, small_cfg(BLOCKS)).unwrap();
    op(&fs);
    let mut dev = fs.unmount();
    dev.take_snapshots()
}

fn mount_image(image: Vec<u8>) -> FlintFs<MemDevice> {
    let dev = MemDevice::from_image(ERASE, image);
    FlintFs::mount(dev, small_cfg(BLOCKS)).expect("every snapshot must mount")
}

fn read_all(fs: &FlintFs<MemDevice>, path: &str) -> Vec<u8> {
    let fh = fs.file_open(path, OpenFlags::RDONLY).unwrap();
    let size = fs.file_size(fh).unwrap() as usize;
    let mut buf = vec![0_u8; size];
    assert_eq!(fs.file_read(fh, &mut buf).unwrap(), size);
    fs.file_close(fh).unwrap();
    buf
}

#[test]
fn interrupted_file_creation_is_all_or_nothing() {
    let dev = setup(|_| {});
    let snapshots = record(dev, |fs| {
        let fh = fs
            .file_open("/x", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(fh, &[0x5a; 20]).unwrap();
        fs.file_close(fh).unwrap();
    });
    assert!(!snapshots.is_empty());

    for image in snapshots {
        let fs = mount_image(image);
        match fs.stat("/x") {
            // died before the entry was created
            Err(FlintError::NoEnt) => {}
            Err(err) => panic!("unexpected error: {err}"),
            Ok(info) => {
                // the entry exists empty (open committed it) or with the
                // full contents (close committed them); never partially
                assert!(info.size == 0 || info.size == 20, "size {}", info.size);
                if info.size == 20 {
                    assert_eq!(read_all(&fs, "/x"), vec![0x5a; 20]);
                }
            }
        }
    }
}

#[test]
fn interrupted_rename_leaves_exactly_one_name() {
    let dev = setup(|fs| {
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        let fh = fs
            .file_open("/a/f", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(fh, b"torn rename test").unwrap();
        fs.file_close(fh).unwrap();
    });

    let snapshots = record(dev, |fs| {
        fs.rename("/a/f", "/b/g").unwrap();
    });
    assert!(!snapshots.is_empty());

    for image in snapshots {
        let fs = mount_image(image);

        let old = fs.stat("/a/f");
        let new = fs.stat("/b/g");
        assert!(
            old.is_ok() != new.is_ok(),
            "exactly one of the names must be visible (old {old:?}, new {new:?})"
        );

        let survivor = if old.is_ok() { "/a/f" } else { "/b/g" };
        assert_eq!(read_all(&fs, survivor), b"torn rename test");

        // force the consistency pass (runs before the first mutation) and
        // make sure recovery settles on the same answer
        fs.mkdir("/poke").unwrap();
        let old = fs.stat("/a/f");
        let new = fs.stat("/b/g");
        assert!(old.is_ok() != new.is_ok());
        assert_eq!(
            read_all(&fs, if old.is_ok() { "/a/f" } else { "/b/g" }),
            b"torn rename test"
        );
    }
}

#[test]
fn interrupted_mkdir_never_corrupts_the_tree() {
    let dev = setup(|fs| {
        fs.mkdir("/stable").unwrap();
    });

    let snapshots = record(dev, |fs| {
        fs.mkdir("/fresh").unwrap();
    });

    for image in snapshots {
        let fs = mount_image(image);

        // the pre-existing tree is always intact
        assert!(fs.stat("/stable").is_ok());

        // a mutation first runs the deorphan pass; afterwards the tree is
        // fully consistent whether or not /fresh survived
        fs.mkdir("/probe").unwrap();
        assert!(fs.stat("/stable").is_ok());
        assert!(fs.stat("/probe").is_ok());

        let size = fs.fs_size().unwrap();
        let mut blocks = std::collections::BTreeSet::new();
        fs.fs_traverse(&mut |b| {
            blocks.insert(b);
        })
        .unwrap();
        assert_eq!(size, blocks.len() as u64);
    }
}

#[test]
fn interrupted_remove_is_all_or_nothing() {
    let dev = setup(|fs| {
        fs.mkdir("/doomed").unwrap();
        let fh = fs
            .file_open("/witness", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(fh, b"still here").unwrap();
        fs.file_close(fh).unwrap();
    });

    let snapshots = record(dev, |fs| {
        fs.remove("/doomed").unwrap();
    });

    for image in snapshots {
        let fs = mount_image(image);
        assert_eq!(read_all(&fs, "/witness"), b"still here");
        match fs.stat("/doomed") {
            Ok(info) => assert_eq!(info.name, "doomed"),
            Err(FlintError::NoEnt) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }

        // recovery reclaims any half-unlinked pair
        fs.mkdir("/probe").unwrap();
        assert!(fs.stat("/witness").is_ok());
    }
}
