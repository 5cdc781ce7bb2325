//! Directory trees, iteration and the split machinery.

mod common;

use common::{fresh, remount};
use flintfs::{EntryKind, FlintError, OpenFlags};
use std::collections::BTreeSet;

#[test]
fn nested_mkdir_and_fs_size_agree_with_traverse() {
    let fs = fresh(8);

    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();

    let info = fs.stat("/a/b").unwrap();
    assert_eq!(info.kind, EntryKind::Dir);
    assert_eq!(info.size, 0);

    // three pairs: root, /a, /a/b
    let mut blocks = BTreeSet::new();
    fs.fs_traverse(&mut |block| {
        blocks.insert(block);
    })
    .unwrap();
    assert_eq!(fs.fs_size().unwrap(), blocks.len() as u64);
    assert_eq!(blocks.len(), 6);
}

#[test]
fn mkdir_collisions_and_missing_parents() {
    let fs = fresh(16);
    fs.mkdir("/a").unwrap();
    assert_eq!(fs.mkdir("/a").unwrap_err(), FlintError::Exists);
    assert_eq!(fs.mkdir("/").unwrap_err(), FlintError::Exists);
    assert_eq!(fs.mkdir("/x/y").unwrap_err(), FlintError::NoEnt);

    // path components through a file are rejected
    let fh = fs
        .file_open("/a/f", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.file_close(fh).unwrap();
    assert_eq!(fs.mkdir("/a/f/sub").unwrap_err(), FlintError::NotDir);
}

#[test]
fn dot_and_dotdot_collapse_in_paths() {
    let fs = fresh(16);
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();

    assert_eq!(fs.stat("/a/./b").unwrap().name, "b");
    assert_eq!(fs.stat("/a/b/../b").unwrap().name, "b");
    assert_eq!(fs.stat("/a/../a/b").unwrap().name, "b");
    assert_eq!(fs.stat("/..").unwrap().name, "/");
    assert_eq!(fs.stat("/.").unwrap().name, "/");
}

#[test]
fn remove_semantics() {
    let fs = fresh(16);
    fs.mkdir("/d").unwrap();
    let fh = fs
        .file_open("/d/f", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.file_close(fh).unwrap();

    // non-empty directory
    assert_eq!(fs.remove("/d").unwrap_err(), FlintError::NotEmpty);
    // the root
    assert_eq!(fs.remove("/").unwrap_err(), FlintError::Inval);
    // missing entries
    assert_eq!(fs.remove("/ghost").unwrap_err(), FlintError::NoEnt);

    fs.remove("/d/f").unwrap();
    assert_eq!(fs.stat("/d/f").unwrap_err(), FlintError::NoEnt);
    fs.remove("/d").unwrap();
    assert_eq!(fs.stat("/d").unwrap_err(), FlintError::NoEnt);

    // the blocks come back
    let fs = remount(fs, 16);
    assert_eq!(fs.fs_size().unwrap(), 2);
}

#[test]
fn forty_files_split_directory() {
    // 40 names plus data overflows one 512-byte pair, forcing a split
    let fs = fresh(64);
    fs.mkdir("/a").unwrap();

    for i in 0..40 {
        let path = format!("/a/f{i}");
        let fh = fs
            .file_open(&path, OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(fh, format!("{i:04}").as_bytes()).unwrap();
        fs.file_close(fh).unwrap();
    }

    let fs = remount(fs, 64);

    // every name comes back through iteration, in some order
    let dh = fs.dir_open("/a").unwrap();
    let mut names = BTreeSet::new();
    while let Some(info) = fs.dir_read(dh).unwrap() {
        if info.name != "." && info.name != ".." {
            assert_eq!(info.kind, EntryKind::File);
            assert_eq!(info.size, 4);
            names.insert(info.name);
        }
    }
    fs.dir_close(dh).unwrap();

    let expected: BTreeSet<String> = (0..40).map(|i| format!("f{i}")).collect();
    assert_eq!(names, expected);

    // and each file reads back its own content
    for i in 0..40 {
        let path = format!("/a/f{i}");
        let fh = fs.file_open(&path, OpenFlags::RDONLY).unwrap();
        let mut buf = [0_u8; 4];
        assert_eq!(fs.file_read(fh, &mut buf).unwrap(), 4);
        assert_eq!(buf, format!("{i:04}").as_bytes());
        fs.file_close(fh).unwrap();
    }
}

#[test]
fn dir_cursor_seek_and_tell() {
    let fs = fresh(32);
    fs.mkdir("/d").unwrap();
    for name in ["x", "y", "z"] {
        let fh = fs
            .file_open(&format!("/d/{name}"), OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_close(fh).unwrap();
    }

    let dh = fs.dir_open("/d").unwrap();
    // consume ".", ".." and the first real entry
    let mut first = None;
    for _ in 0..3 {
        first = fs.dir_read(dh).unwrap();
    }
    let first = first.unwrap();
    let pos = fs.dir_tell(dh).unwrap();

    // drain, rewind, seek back: the same entry comes up next
    while fs.dir_read(dh).unwrap().is_some() {}
    fs.dir_rewind(dh).unwrap();
    assert_eq!(fs.dir_read(dh).unwrap().unwrap().name, ".");

    fs.dir_seek(dh, pos - 1).unwrap();
    assert_eq!(fs.dir_read(dh).unwrap().unwrap().name, first.name);
    fs.dir_close(dh).unwrap();
}

#[test]
fn open_dir_iteration_survives_sibling_removal() {
    // removing an entry below the cursor shifts ids; the open handle must
    // keep its position
    let fs = fresh(32);
    fs.mkdir("/d").unwrap();
    for name in ["a", "b", "c", "e"] {
        let fh = fs
            .file_open(&format!("/d/{name}"), OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_close(fh).unwrap();
    }

    let dh = fs.dir_open("/d").unwrap();
    // read ".", "..", "a"
    for _ in 0..3 {
        fs.dir_read(dh).unwrap();
    }

    fs.remove("/d/a").unwrap();

    // iteration continues from b
    let mut rest = Vec::new();
    while let Some(info) = fs.dir_read(dh).unwrap() {
        rest.push(info.name);
    }
    assert_eq!(rest, ["b", "c", "e"]);
    fs.dir_close(dh).unwrap();
}

#[test]
fn stat_on_root_is_a_directory() {
    let fs = fresh(8);
    let info = fs.stat("/").unwrap();
    assert_eq!(info.kind, EntryKind::Dir);
    assert_eq!(info.name, "/");
}
