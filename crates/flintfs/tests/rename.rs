//! Rename and move semantics, including cross-directory moves.

mod common;

use common::{fresh, remount};
use flintfs::{EntryKind, FlintError, OpenFlags};
use std::collections::BTreeSet;

fn write_file(fs: &flintfs::FlintFs<flintfs::MemDevice>, path: &str, data: &[u8]) {
    let fh = fs
        .file_open(path, OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.file_write(fh, data).unwrap();
    fs.file_close(fh).unwrap();
}

fn read_file(fs: &flintfs::FlintFs<flintfs::MemDevice>, path: &str) -> Vec<u8> {
    let fh = fs.file_open(path, OpenFlags::RDONLY).unwrap();
    let size = fs.file_size(fh).unwrap() as usize;
    let mut buf = vec![0_u8; size];
    assert_eq!(fs.file_read(fh, &mut buf).unwrap(), size);
    fs.file_close(fh).unwrap();
    buf
}

#[test]
fn rename_within_directory() {
    let fs = fresh(16);
    write_file(&fs, "/old", b"contents");

    fs.rename("/old", "/new").unwrap();
    assert_eq!(fs.stat("/old").unwrap_err(), FlintError::NoEnt);
    assert_eq!(read_file(&fs, "/new"), b"contents");
}

#[test]
fn rename_across_directories() {
    let fs = fresh(32);
    fs.mkdir("/a").unwrap();
    fs.mkdir("/b").unwrap();
    write_file(&fs, "/a/f", b"moving day");

    fs.rename("/a/f", "/b/g").unwrap();
    assert_eq!(fs.stat("/a/f").unwrap_err(), FlintError::NoEnt);
    assert_eq!(read_file(&fs, "/b/g"), b"moving day");

    // survives a remount
    let fs = remount(fs, 32);
    assert_eq!(read_file(&fs, "/b/g"), b"moving day");
    assert_eq!(fs.stat("/a/f").unwrap_err(), FlintError::NoEnt);
}

#[test]
fn rename_missing_parent_is_noent() {
    let fs = fresh(32);
    fs.mkdir("/a").unwrap();
    write_file(&fs, "/a/f0", b"data");

    assert_eq!(
        fs.rename("/a/f0", "/b/g0").unwrap_err(),
        FlintError::NoEnt
    );
    // source untouched
    assert_eq!(read_file(&fs, "/a/f0"), b"data");
}

#[test]
fn rename_replaces_same_type_atomically() {
    let fs = fresh(32);
    fs.mkdir("/b").unwrap();
    write_file(&fs, "/a", b"new data");
    write_file(&fs, "/b/g0", b"old data");

    fs.rename("/a", "/b/g0").unwrap();
    assert_eq!(fs.stat("/a").unwrap_err(), FlintError::NoEnt);
    assert_eq!(read_file(&fs, "/b/g0"), b"new data");
}

#[test]
fn rename_type_mismatch_rejected() {
    let fs = fresh(32);
    fs.mkdir("/d").unwrap();
    write_file(&fs, "/f", b"x");

    assert_eq!(fs.rename("/f", "/d").unwrap_err(), FlintError::IsDir);
    assert_eq!(fs.rename("/d", "/f").unwrap_err(), FlintError::IsDir);

    // a non-empty directory cannot be replaced
    fs.mkdir("/e").unwrap();
    write_file(&fs, "/d/inner", b"y");
    assert_eq!(fs.rename("/e", "/d").unwrap_err(), FlintError::NotEmpty);
}

#[test]
fn rename_directory_moves_subtree() {
    let fs = fresh(32);
    fs.mkdir("/src").unwrap();
    write_file(&fs, "/src/f", b"payload");

    fs.rename("/src", "/dst").unwrap();
    assert_eq!(fs.stat("/dst").unwrap().kind, EntryKind::Dir);
    assert_eq!(read_file(&fs, "/dst/f"), b"payload");
    assert_eq!(fs.stat("/src").unwrap_err(), FlintError::NoEnt);
}

#[test]
fn rename_to_self_is_noop() {
    let fs = fresh(16);
    write_file(&fs, "/same", b"stay");
    fs.rename("/same", "/same").unwrap();
    assert_eq!(read_file(&fs, "/same"), b"stay");
}

#[test]
fn rename_back_and_forth_restores_the_tree() {
    let fs = fresh(32);
    fs.mkdir("/a").unwrap();
    fs.mkdir("/b").unwrap();
    write_file(&fs, "/a/f", b"ping pong");

    let size_before = fs.fs_size().unwrap();
    let listing_before = list_tree(&fs);

    fs.rename("/a/f", "/b/f").unwrap();
    fs.rename("/b/f", "/a/f").unwrap();

    assert_eq!(fs.fs_size().unwrap(), size_before);
    assert_eq!(list_tree(&fs), listing_before);
    assert_eq!(read_file(&fs, "/a/f"), b"ping pong");
}

fn list_tree(fs: &flintfs::FlintFs<flintfs::MemDevice>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack = vec![String::from("/")];
    while let Some(dir) = stack.pop() {
        let dh = fs.dir_open(&dir).unwrap();
        while let Some(info) = fs.dir_read(dh).unwrap() {
            if info.name == "." || info.name == ".." {
                continue;
            }
            let path = if dir == "/" {
                format!("/{}", info.name)
            } else {
                format!("{dir}/{}", info.name)
            };
            if info.kind == EntryKind::Dir {
                stack.push(path.clone());
            }
            out.insert(path);
        }
        fs.dir_close(dh).unwrap();
    }
    out
}
