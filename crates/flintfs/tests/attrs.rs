//! Custom attribute round trips.

mod common;

use common::fresh;
use flintfs::{FileConfig, FlintError, OpenAttr, OpenFlags};

#[test]
fn set_get_remove_round_trip() {
    let fs = fresh(16);
    let fh = fs
        .file_open("/f", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.file_close(fh).unwrap();

    fs.set_attr("/f", 0x42, b"metadata!").unwrap();

    let mut buf = [0_u8; 16];
    assert_eq!(fs.get_attr("/f", 0x42, &mut buf).unwrap(), 9);
    assert_eq!(&buf[..9], b"metadata!");
    // shorter stored attribute zero-pads the tail of the buffer
    assert!(buf[9..].iter().all(|&b| b == 0));

    // overwrite in place
    fs.set_attr("/f", 0x42, b"shorter").unwrap();
    assert_eq!(fs.get_attr("/f", 0x42, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"shorter");

    fs.remove_attr("/f", 0x42).unwrap();
    assert_eq!(
        fs.get_attr("/f", 0x42, &mut buf).unwrap_err(),
        FlintError::NoAttr
    );

    // removing an absent attribute is a no-op
    fs.remove_attr("/f", 0x42).unwrap();
}

#[test]
fn attrs_are_keyed_by_type_and_entry() {
    let fs = fresh(16);
    for path in ["/x", "/y"] {
        let fh = fs
            .file_open(path, OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_close(fh).unwrap();
    }

    fs.set_attr("/x", 1, b"one").unwrap();
    fs.set_attr("/x", 2, b"two").unwrap();
    fs.set_attr("/y", 1, b"uno").unwrap();

    let mut buf = [0_u8; 3];
    assert_eq!(fs.get_attr("/x", 1, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"one");
    assert_eq!(fs.get_attr("/x", 2, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"two");
    assert_eq!(fs.get_attr("/y", 1, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"uno");
    assert_eq!(
        fs.get_attr("/y", 2, &mut buf).unwrap_err(),
        FlintError::NoAttr
    );
}

#[test]
fn attrs_on_directories_and_root() {
    let fs = fresh(16);
    fs.mkdir("/d").unwrap();

    fs.set_attr("/d", 7, b"dir attr").unwrap();
    let mut buf = [0_u8; 8];
    assert_eq!(fs.get_attr("/d", 7, &mut buf).unwrap(), 8);
    assert_eq!(&buf, b"dir attr");

    // the root carries attributes on entry 0 of the superblock pair
    fs.set_attr("/", 9, b"root").unwrap();
    let mut buf = [0_u8; 4];
    assert_eq!(fs.get_attr("/", 9, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"root");
}

#[test]
fn oversized_attr_is_rejected() {
    let fs = fresh(16);
    let fh = fs
        .file_open("/f", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.file_close(fh).unwrap();

    let big = vec![0_u8; 1023];
    assert_eq!(
        fs.set_attr("/f", 1, &big).unwrap_err(),
        FlintError::NoSpace
    );
}

#[test]
fn open_attrs_commit_with_sync() {
    let fs = fresh(16);

    // write-mode attrs land atomically with the file contents
    let fcfg = FileConfig {
        attrs: vec![OpenAttr {
            atype: 0x10,
            data: b"bound".to_vec(),
        }],
    };
    let fh = fs
        .file_open_with("/f", OpenFlags::WRONLY | OpenFlags::CREAT, fcfg)
        .unwrap();
    fs.file_write(fh, b"body").unwrap();
    fs.file_close(fh).unwrap();

    let mut buf = [0_u8; 5];
    assert_eq!(fs.get_attr("/f", 0x10, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"bound");

    // read-mode attrs are filled at open, zero-padded to their length
    let fcfg = FileConfig {
        attrs: vec![OpenAttr {
            atype: 0x10,
            data: vec![0xff; 8],
        }],
    };
    let fh = fs
        .file_open_with("/f", OpenFlags::RDONLY, fcfg)
        .unwrap();
    let attrs = fs.file_attrs(fh).unwrap();
    assert_eq!(attrs[0].data, b"bound\0\0\0");
    fs.file_close(fh).unwrap();
}
