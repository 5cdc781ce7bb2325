#![forbid(unsafe_code)]
//! FlintFS: a power-loss-resilient filesystem for raw block-erasable
//! storage (NOR/NAND flash and similar devices).
//!
//! This crate is the public surface: every operation acquires the
//! filesystem lock for its duration (released on all exit paths) and traces
//! entry/exit, then forwards to the raw engine in `flint-core`. The engine
//! itself is single-threaded by design; the lock provides the promised
//! mutual exclusion, nothing more.
//!
//! ```no_run
//! use flintfs::{Config, FlintFs, MemDevice, OpenFlags};
//!
//! let cfg = Config {
//!     read_size: 16,
//!     prog_size: 16,
//!     erase_size: 512,
//!     block_size: 512,
//!     block_count: 128,
//!     block_cycles: 500,
//!     cache_size: 64,
//!     lookahead_size: 16,
//!     ..Config::default()
//! };
//!
//! let dev = flintfs::format(MemDevice::new(512, 128), cfg).unwrap();
//! let fs = FlintFs::mount(dev, cfg).unwrap();
//!
//! let fh = fs.file_open("/hello", OpenFlags::WRONLY | OpenFlags::CREAT).unwrap();
//! fs.file_write(fh, b"hello world").unwrap();
//! fs.file_close(fh).unwrap();
//! ```

use parking_lot::Mutex;
use std::io::SeekFrom;
use tracing::trace;

pub use flint_block::{BlockDevice, Geometry, MemDevice};
pub use flint_core::{
    Config, DirHandle, Error, FileConfig, FileHandle, OpenAttr, OpenFlags,
};
pub use flint_error::{FlintError, Result};
pub use flint_types::{BlockId, EntryInfo, EntryKind, FsInfo};

use flint_core::Fs;

/// Format a block device. Does not leave the filesystem mounted; the device
/// is handed back on success.
pub fn format<D: BlockDevice>(dev: D, cfg: Config) -> Result<D> {
    let res = Fs::format(dev, cfg);
    trace!(target: "flint::api", ok = res.is_ok(), "format");
    res
}

/// A mounted filesystem.
///
/// Methods take `&self`; mutual exclusion is provided internally, so a
/// `FlintFs` can be shared. Only one operation makes progress at a time.
pub struct FlintFs<D: BlockDevice> {
    fs: Mutex<Fs<D>>,
}

impl<D: BlockDevice> FlintFs<D> {
    /// Mount a previously formatted device.
    pub fn mount(dev: D, cfg: Config) -> Result<Self> {
        let res = Fs::mount(dev, cfg);
        trace!(target: "flint::api", ok = res.is_ok(), "mount");
        res.map(|fs| Self { fs: Mutex::new(fs) })
    }

    /// Unmount, releasing the device. Unsynced data in open files is lost.
    pub fn unmount(self) -> D {
        trace!(target: "flint::api", "unmount");
        self.fs.into_inner().unmount()
    }

    /// Geometry as resolved by mount (after block-size autodetection).
    pub fn geometry(&self) -> Geometry {
        self.fs.lock().geometry()
    }

    // ── General operations ──────────────────────────────────────────────────

    /// Info about a file or directory.
    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        let mut fs = self.fs.lock();
        let res = fs.stat(path);
        trace!(target: "flint::api", path, ok = res.is_ok(), "stat");
        res
    }

    /// Remove a file or empty directory.
    pub fn remove(&self, path: &str) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.remove(path);
        trace!(target: "flint::api", path, ok = res.is_ok(), "remove");
        res
    }

    /// Rename or move a file or directory.
    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.rename(oldpath, newpath);
        trace!(target: "flint::api", oldpath, newpath, ok = res.is_ok(), "rename");
        res
    }

    /// Read a custom attribute. Returns its stored size.
    pub fn get_attr(&self, path: &str, atype: u8, buf: &mut [u8]) -> Result<u64> {
        let mut fs = self.fs.lock();
        let res = fs.get_attr(path, atype, buf);
        trace!(target: "flint::api", path, atype, ok = res.is_ok(), "get_attr");
        res
    }

    /// Set a custom attribute.
    pub fn set_attr(&self, path: &str, atype: u8, value: &[u8]) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.set_attr(path, atype, value);
        trace!(target: "flint::api", path, atype, ok = res.is_ok(), "set_attr");
        res
    }

    /// Remove a custom attribute.
    pub fn remove_attr(&self, path: &str, atype: u8) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.remove_attr(path, atype);
        trace!(target: "flint::api", path, atype, ok = res.is_ok(), "remove_attr");
        res
    }

    // ── File operations ─────────────────────────────────────────────────────

    /// Open a file.
    pub fn file_open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let mut fs = self.fs.lock();
        let res = fs.file_open(path, flags);
        trace!(target: "flint::api", path, ok = res.is_ok(), "file_open");
        res
    }

    /// Open a file with per-file configuration.
    pub fn file_open_with(
        &self,
        path: &str,
        flags: OpenFlags,
        fcfg: FileConfig,
    ) -> Result<FileHandle> {
        let mut fs = self.fs.lock();
        let res = fs.file_open_with(path, flags, fcfg);
        trace!(target: "flint::api", path, ok = res.is_ok(), "file_open_with");
        res
    }

    /// Close a file, syncing pending writes.
    pub fn file_close(&self, fh: FileHandle) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.file_close(fh);
        trace!(target: "flint::api", ok = res.is_ok(), "file_close");
        res
    }

    /// Write pending data and metadata out to storage.
    pub fn file_sync(&self, fh: FileHandle) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.file_sync(fh);
        trace!(target: "flint::api", ok = res.is_ok(), "file_sync");
        res
    }

    /// Read from the current position; returns bytes read, zero at EOF.
    pub fn file_read(&self, fh: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut fs = self.fs.lock();
        let res = fs.file_read(fh, buf);
        trace!(target: "flint::api", len = buf.len(), ok = res.is_ok(), "file_read");
        res
    }

    /// Write at the current position. Storage is not updated until sync or
    /// close.
    pub fn file_write(&self, fh: FileHandle, data: &[u8]) -> Result<usize> {
        let mut fs = self.fs.lock();
        let res = fs.file_write(fh, data);
        trace!(target: "flint::api", len = data.len(), ok = res.is_ok(), "file_write");
        res
    }

    /// Change the file position; returns the new position.
    pub fn file_seek(&self, fh: FileHandle, whence: SeekFrom) -> Result<u64> {
        let mut fs = self.fs.lock();
        let res = fs.file_seek(fh, whence);
        trace!(target: "flint::api", ok = res.is_ok(), "file_seek");
        res
    }

    /// Truncate or zero-extend to `size`.
    pub fn file_truncate(&self, fh: FileHandle, size: u64) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.file_truncate(fh, size);
        trace!(target: "flint::api", size, ok = res.is_ok(), "file_truncate");
        res
    }

    /// Current file position.
    pub fn file_tell(&self, fh: FileHandle) -> Result<u64> {
        self.fs.lock().file_tell(fh)
    }

    /// Seek back to the start of the file.
    pub fn file_rewind(&self, fh: FileHandle) -> Result<()> {
        self.fs.lock().file_rewind(fh)
    }

    /// Current file size, including unsynced writes.
    pub fn file_size(&self, fh: FileHandle) -> Result<u64> {
        self.fs.lock().file_size(fh)
    }

    /// The per-file attributes supplied at open, as last read or written.
    pub fn file_attrs(&self, fh: FileHandle) -> Result<Vec<OpenAttr>> {
        self.fs.lock().file_attrs(fh).map(<[OpenAttr]>::to_vec)
    }

    // ── Directory operations ────────────────────────────────────────────────

    /// Create a directory.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.mkdir(path);
        trace!(target: "flint::api", path, ok = res.is_ok(), "mkdir");
        res
    }

    /// Open a directory for iteration.
    pub fn dir_open(&self, path: &str) -> Result<DirHandle> {
        let mut fs = self.fs.lock();
        let res = fs.dir_open(path);
        trace!(target: "flint::api", path, ok = res.is_ok(), "dir_open");
        res
    }

    /// Close a directory.
    pub fn dir_close(&self, dh: DirHandle) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.dir_close(dh);
        trace!(target: "flint::api", ok = res.is_ok(), "dir_close");
        res
    }

    /// Next entry, or `None` at the end of the directory.
    pub fn dir_read(&self, dh: DirHandle) -> Result<Option<EntryInfo>> {
        let mut fs = self.fs.lock();
        let res = fs.dir_read(dh);
        trace!(target: "flint::api", ok = res.is_ok(), "dir_read");
        res
    }

    /// Seek to an offset previously returned by `dir_tell`.
    pub fn dir_seek(&self, dh: DirHandle, off: u64) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.dir_seek(dh, off);
        trace!(target: "flint::api", off, ok = res.is_ok(), "dir_seek");
        res
    }

    /// Current position in the directory iteration.
    pub fn dir_tell(&self, dh: DirHandle) -> Result<u64> {
        self.fs.lock().dir_tell(dh)
    }

    /// Rewind the directory iteration.
    pub fn dir_rewind(&self, dh: DirHandle) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.dir_rewind(dh);
        trace!(target: "flint::api", ok = res.is_ok(), "dir_rewind");
        res
    }

    // ── Filesystem operations ───────────────────────────────────────────────

    /// Filesystem info, respecting what the superblock recorded.
    pub fn fs_stat(&self) -> Result<FsInfo> {
        let mut fs = self.fs.lock();
        let res = fs.fs_stat();
        trace!(target: "flint::api", ok = res.is_ok(), "fs_stat");
        res
    }

    /// Number of blocks in use (best effort under shared COW structures).
    pub fn fs_size(&self) -> Result<u64> {
        let mut fs = self.fs.lock();
        let res = fs.fs_size();
        trace!(target: "flint::api", ok = res.is_ok(), "fs_size");
        res
    }

    /// Visit every block currently in use.
    pub fn fs_traverse(&self, cb: &mut dyn FnMut(BlockId)) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.fs_traverse(cb);
        trace!(target: "flint::api", ok = res.is_ok(), "fs_traverse");
        res
    }

    /// Grow the filesystem to a new block count. Irreversible.
    pub fn fs_grow(&self, block_count: u64) -> Result<()> {
        let mut fs = self.fs.lock();
        let res = fs.fs_grow(block_count);
        trace!(target: "flint::api", block_count, ok = res.is_ok(), "fs_grow");
        res
    }
}
