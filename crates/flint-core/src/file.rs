//! File operations.
//!
//! Small files live inline in their directory entry; once the contents
//! outgrow the inline limit the file is outlined into a CTZ skip-list and
//! never comes back (except through truncate). Writes accumulate in the
//! file's cache and only reach the directory on sync, which commits the
//! struct tag and any per-file attributes atomically. A failed write
//! latches the file in an error state where sync is a no-op, so a broken
//! file can still be closed without committing garbage.

use crate::handles::{FileHandle, FileNode, Node};
use crate::mdir::MetaDir;
use crate::traverse::{Attr, Payload};
use crate::{fflags, FileConfig, Fs, OpenFlags};
use flint_block::{self as bd, BlockDevice, Cache};
use flint_error::{FlintError, Result};
use flint_types::{pair_is_null, ttype, Ctz, Tag, BLOCK_INLINE, BLOCK_NULL, ID_NONE};
use std::io::SeekFrom;
use tracing::debug;

fn file_size_of(file: &FileNode) -> u64 {
    if file.flags & fflags::WRITING != 0 {
        file.pos.max(file.ctz.size)
    } else {
        file.ctz.size
    }
}

impl<D: BlockDevice> Fs<D> {
    // ── Open / close ────────────────────────────────────────────────────────

    /// Open a file.
    pub fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        self.file_open_with(path, flags, FileConfig::default())
    }

    /// Open a file with per-file configuration (custom attributes).
    pub fn file_open_with(
        &mut self,
        path: &str,
        flags: OpenFlags,
        fcfg: FileConfig,
    ) -> Result<FileHandle> {
        let file = self.file_open_raw(path, flags, fcfg)?;
        Ok(FileHandle(self.handles.insert(Node::File(file))))
    }

    fn file_open_raw(
        &mut self,
        path: &str,
        flags: OpenFlags,
        fcfg: FileConfig,
    ) -> Result<FileNode> {
        // deorphan if we haven't yet; needed at most once after power-on
        if flags.0 & fflags::WRONLY == fflags::WRONLY {
            self.fs_force_consistency()?;
        }

        let mut file = FileNode {
            id: 0,
            mdir: MetaDir::default(),
            ctz: Ctz::default(),
            flags: flags.0,
            pos: 0,
            block: BLOCK_NULL,
            off: 0,
            cache: Cache::new(self.geo.cache_size),
            attrs: fcfg.attrs,
        };

        // find the entry, or where it would go
        let mut mdir = MetaDir::default();
        let target = self.dir_find(&mut mdir, path)?;
        file.mdir = mdir;

        let tag = match (target.tag, target.id) {
            (None, id) if id != ID_NONE => {
                file.id = id;

                if flags.0 & fflags::CREAT == 0 {
                    return Err(FlintError::NoEnt);
                }

                // check that the name fits
                let nlen = target.name.len() as u64;
                if nlen > self.name_max {
                    return Err(FlintError::NameTooLong);
                }

                // get the next slot and create an entry to remember the name
                let attrs = [
                    Attr::new(Tag::new(ttype::CREATE, id, 0), Payload::None),
                    Attr::new(
                        Tag::new(ttype::REG, id, nlen as u32),
                        Payload::Bytes(target.name.as_bytes()),
                    ),
                    Attr::new(Tag::new(ttype::INLINESTRUCT, id, 0), Payload::None),
                ];
                let mut m = file.mdir;
                let res = self.dir_commit(&mut m, &attrs, &[]);
                file.mdir = m;

                // the name may simply not fit in the metadata block
                match res {
                    Err(FlintError::NoSpace) => return Err(FlintError::NameTooLong),
                    Err(err) => return Err(err),
                    Ok(()) => {}
                }

                Tag::new(ttype::INLINESTRUCT, 0, 0)
            }
            (None, _) => return Err(FlintError::NoEnt),
            (Some(found), id) => {
                file.id = id;

                if flags.0 & fflags::EXCL != 0 {
                    return Err(FlintError::Exists);
                }
                if found.type3() != ttype::REG {
                    return Err(FlintError::IsDir);
                }

                if flags.0 & fflags::TRUNC != 0 {
                    // truncate if requested
                    file.flags |= fflags::DIRTY;
                    Tag::new(ttype::INLINESTRUCT, file.id, 0)
                } else {
                    // load what's on disk; if it's inlined we'll fix that
                    // below
                    let mut bytes = [0_u8; Ctz::DISK_SIZE];
                    let m = file.mdir;
                    let tag = self.dir_get(
                        &m,
                        Tag::new(ttype::GLOBALS, ID_NONE, 0),
                        Tag::new(ttype::STRUCT, file.id, Ctz::DISK_SIZE as u32),
                        &mut bytes,
                    )?;
                    file.ctz = Ctz::from_bytes(&bytes);
                    tag
                }
            }
        };

        // fetch attrs
        let m = file.mdir;
        for i in 0..file.attrs.len() {
            // if opened for read / read-write operations
            if file.flags & fflags::RDONLY == fflags::RDONLY {
                let atype = file.attrs[i].atype;
                let alen = file.attrs[i].data.len() as u32;
                let res = self.dir_get(
                    &m,
                    Tag::new(ttype::MOVESTATE, ID_NONE, 0),
                    Tag::new(ttype::USERATTR + u16::from(atype), file.id, alen),
                    &mut file.attrs[i].data,
                );
                match res {
                    Ok(_) | Err(FlintError::NoEnt) => {}
                    Err(err) => return Err(err),
                }
            }

            // if opened for write / read-write operations
            if file.flags & fflags::WRONLY == fflags::WRONLY {
                if file.attrs[i].data.len() as u64 > self.attr_max {
                    return Err(FlintError::NoSpace);
                }
                file.flags |= fflags::DIRTY;
            }
        }

        if tag.type3() == ttype::INLINESTRUCT {
            // load inline files
            file.ctz.head = BLOCK_INLINE;
            file.ctz.size = tag.size();
            file.flags |= fflags::INLINE;
            file.cache.block = file.ctz.head;
            file.cache.off = 0;
            file.cache.size = self.geo.cache_size;

            // don't always read; this may be a fresh or truncated file
            if file.ctz.size > 0 {
                let gsize = file.cache.size.min(0x3fe) as usize;
                let m = file.mdir;
                self.dir_get(
                    &m,
                    Tag::new(ttype::GLOBALS, ID_NONE, 0),
                    Tag::new(ttype::STRUCT, file.id, gsize as u32),
                    &mut file.cache.buffer[..gsize],
                )?;
            }
        }

        Ok(file)
    }

    /// Close a file. Pending writes are synced out first.
    pub fn file_close(&mut self, fh: FileHandle) -> Result<()> {
        let mut file = self.handles.take_file(fh)?;
        let res = self.file_sync_raw(&mut file);
        self.handles.release(fh.0);
        res
    }

    // ── Sync ────────────────────────────────────────────────────────────────

    /// Write any pending data and metadata out to storage.
    pub fn file_sync(&mut self, fh: FileHandle) -> Result<()> {
        let mut file = self.handles.take_file(fh)?;
        let res = self.file_sync_raw(&mut file);
        self.handles.put_file(fh, file);
        res
    }

    fn file_sync_raw(&mut self, file: &mut FileNode) -> Result<()> {
        if file.flags & fflags::ERRED != 0 {
            // it's not safe to do anything if the file errored
            return Ok(());
        }

        let res = self.file_sync_inner(file);
        if res.is_err() {
            file.flags |= fflags::ERRED;
        }
        res
    }

    fn file_sync_inner(&mut self, file: &mut FileNode) -> Result<()> {
        self.file_flush(file)?;

        if file.flags & fflags::DIRTY != 0 && !pair_is_null(&file.mdir.pair) {
            // update the dir entry; ctz is copied out so allocation keeps
            // working if the commit relocates
            let mut m = file.mdir;
            let ctz_bytes = file.ctz.to_bytes();
            let inline_len = file.ctz.size as usize;

            let (tag, payload) = if file.flags & fflags::INLINE != 0 {
                // inline the whole file
                (
                    Tag::new(ttype::INLINESTRUCT, file.id, inline_len as u32),
                    Payload::Bytes(&file.cache.buffer[..inline_len]),
                )
            } else {
                // update the ctz reference
                (
                    Tag::new(ttype::CTZSTRUCT, file.id, Ctz::DISK_SIZE as u32),
                    Payload::Bytes(&ctz_bytes),
                )
            };

            // commit file data and attributes atomically
            let attrs = [
                Attr::new(tag, payload),
                Attr::new(
                    Tag::new(
                        ttype::FROM_USERATTRS,
                        file.id,
                        file.attrs.len() as u32,
                    ),
                    Payload::UserAttrs(&file.attrs),
                ),
            ];
            self.dir_commit(&mut m, &attrs, &[&*file])?;
            file.mdir = m;

            file.flags &= !fflags::DIRTY;
        }

        Ok(())
    }

    // ── Flush and relocation ────────────────────────────────────────────────

    /// Flush cached reads and writes; afterwards `ctz` names the file's
    /// on-storage contents (metadata commit still pending via DIRTY).
    pub(crate) fn file_flush(&mut self, file: &mut FileNode) -> Result<()> {
        if file.flags & fflags::READING != 0 {
            if file.flags & fflags::INLINE == 0 {
                file.cache.discard();
            }
            file.flags &= !fflags::READING;
        }

        if file.flags & fflags::WRITING != 0 {
            let pos = file.pos;

            if file.flags & fflags::INLINE == 0 {
                // copy over anything after the current branch of the file
                let mut orig = FileNode {
                    id: 0,
                    mdir: file.mdir,
                    ctz: file.ctz,
                    flags: fflags::RDONLY,
                    pos: file.pos,
                    block: BLOCK_NULL,
                    off: 0,
                    cache: Cache::new(self.geo.cache_size),
                    attrs: Vec::new(),
                };

                while file.pos < file.ctz.size {
                    // copy a byte at a time, leaving efficiency to caching
                    let mut byte = [0_u8; 1];
                    self.file_flushed_read(&mut orig, &mut byte)?;
                    self.file_flushed_write(file, &byte)?;
                }

                // write out what we have
                loop {
                    match bd::flush(
                        &mut self.dev,
                        &self.geo,
                        &mut file.cache,
                        &mut self.rcache,
                        true,
                    ) {
                        Ok(()) => break,
                        Err(FlintError::Corrupt) => {
                            debug!(target: "flint::file", block = file.block, "bad block");
                            self.file_relocate(file)?;
                        }
                        Err(err) => return Err(err),
                    }
                }
            } else {
                file.pos = file.pos.max(file.ctz.size);
            }

            // actual file updates
            file.ctz.head = file.block;
            file.ctz.size = file.pos;
            file.flags &= !fflags::WRITING;
            file.flags |= fflags::DIRTY;

            file.pos = pos;
        }

        Ok(())
    }

    /// Move an inline file out into its own block.
    pub(crate) fn file_outline(&mut self, file: &mut FileNode) -> Result<()> {
        file.off = file.pos;
        self.alloc_ack();

        self.file_relocate(file)?;
        file.flags &= !fflags::INLINE;
        Ok(())
    }

    /// Copy the first `file.off` bytes of the current block (or the inline
    /// payload) onto a fresh block, retrying if the new block is bad.
    fn file_relocate(&mut self, file: &mut FileNode) -> Result<()> {
        loop {
            let nblock = self.alloc(&[&*file])?;
            if self.file_relocate_into(file, nblock)? {
                return Ok(());
            }

            debug!(target: "flint::file", block = nblock, "bad block");
            // just clear the cache and try a new block
            self.pcache.discard();
        }
    }

    fn file_relocate_into(&mut self, file: &mut FileNode, nblock: u64) -> Result<bool> {
        match bd::erase(&mut self.dev, &self.geo, nblock) {
            Ok(()) => {}
            Err(FlintError::Corrupt) => return Ok(false),
            Err(err) => return Err(err),
        }

        // either read from the dirty cache or disk
        for i in 0..file.off {
            let mut byte = [0_u8; 1];
            if file.flags & fflags::INLINE != 0 {
                // note: inline files are evicted before they can be dirty
                let m = file.mdir;
                let hint = file.off - i;
                self.dir_get_read(
                    &m,
                    None,
                    &mut file.cache,
                    hint,
                    Tag::new(0xfff, 0x1ff, 0),
                    Tag::new(ttype::INLINESTRUCT, file.id, 0),
                    i,
                    &mut byte,
                )?;
            } else {
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    Some(&file.cache),
                    &mut self.rcache,
                    file.off - i,
                    file.block,
                    i,
                    &mut byte,
                )?;
            }

            match bd::write(
                &mut self.dev,
                &self.geo,
                &mut self.pcache,
                &mut self.rcache,
                true,
                nblock,
                i,
                &byte,
            ) {
                Ok(()) => {}
                Err(FlintError::Corrupt) => return Ok(false),
                Err(err) => return Err(err),
            }
        }

        // take over the write cache as the file's own
        file.cache.buffer.copy_from_slice(&self.pcache.buffer);
        file.cache.block = self.pcache.block;
        file.cache.off = self.pcache.off;
        file.cache.size = self.pcache.size;
        self.pcache.zero();

        file.block = nblock;
        file.flags |= fflags::WRITING;
        Ok(true)
    }

    // ── Read ────────────────────────────────────────────────────────────────

    fn file_flushed_read(&mut self, file: &mut FileNode, buf: &mut [u8]) -> Result<usize> {
        if file.pos >= file.ctz.size {
            // eof if past end
            return Ok(0);
        }

        let size = (buf.len() as u64).min(file.ctz.size - file.pos);
        let mut nsize = size;
        let mut done = 0_usize;

        while nsize > 0 {
            // check if we need a new block
            if file.flags & fflags::READING == 0 || file.off == self.geo.block_size {
                if file.flags & fflags::INLINE == 0 {
                    let (head, csize, pos) = (file.ctz.head, file.ctz.size, file.pos);
                    let (block, off) = self.ctz_find(&mut file.cache, head, csize, pos)?;
                    file.block = block;
                    file.off = off;
                } else {
                    file.block = BLOCK_INLINE;
                    file.off = file.pos;
                }

                file.flags |= fflags::READING;
            }

            // read as much as we can in the current block
            let diff = nsize.min(self.geo.block_size - file.off) as usize;
            let chunk = &mut buf[done..done + diff];

            if file.flags & fflags::INLINE != 0 {
                let m = file.mdir;
                let off = file.off;
                self.dir_get_read(
                    &m,
                    None,
                    &mut file.cache,
                    self.geo.block_size,
                    Tag::new(0xfff, 0x1ff, 0),
                    Tag::new(ttype::INLINESTRUCT, file.id, 0),
                    off,
                    chunk,
                )?;
            } else {
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut file.cache,
                    self.geo.block_size,
                    file.block,
                    file.off,
                    chunk,
                )?;
            }

            file.pos += diff as u64;
            file.off += diff as u64;
            done += diff;
            nsize -= diff as u64;
        }

        Ok(size as usize)
    }

    /// Read from the current position. Returns the number of bytes read;
    /// zero at end of file.
    pub fn file_read(&mut self, fh: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.handles.take_file(fh)?;
        let res = self.file_read_raw(&mut file, buf);
        self.handles.put_file(fh, file);
        res
    }

    fn file_read_raw(&mut self, file: &mut FileNode, buf: &mut [u8]) -> Result<usize> {
        if file.flags & fflags::RDONLY == 0 {
            return Err(FlintError::BadFd);
        }

        if file.flags & fflags::WRITING != 0 {
            // flush out any writes
            self.file_flush(file)?;
        }

        self.file_flushed_read(file, buf)
    }

    // ── Write ───────────────────────────────────────────────────────────────

    fn file_flushed_write(&mut self, file: &mut FileNode, data: &[u8]) -> Result<usize> {
        let size = data.len() as u64;

        if file.flags & fflags::INLINE != 0
            && (file.pos + size).max(file.ctz.size) > self.inline_max()
        {
            // the inline file doesn't fit anymore
            if let Err(err) = self.file_outline(file) {
                file.flags |= fflags::ERRED;
                return Err(err);
            }
        }

        let mut nsize = size;
        let mut done = 0_usize;

        while nsize > 0 {
            // check if we need a new block
            if file.flags & fflags::WRITING == 0 || file.off == self.geo.block_size {
                if file.flags & fflags::INLINE == 0 {
                    if file.flags & fflags::WRITING == 0 && file.pos > 0 {
                        // find out which block we're extending from
                        let (head, csize, pos) =
                            (file.ctz.head, file.ctz.size, file.pos - 1);
                        match self.ctz_find(&mut file.cache, head, csize, pos) {
                            Ok((block, _)) => file.block = block,
                            Err(err) => {
                                file.flags |= fflags::ERRED;
                                return Err(err);
                            }
                        }

                        // mark the cache as dirty since we may have read
                        // data into it
                        file.cache.zero();
                    }

                    // extend the file with new blocks
                    self.alloc_ack();
                    let (head, pos) = (file.block, file.pos);
                    match self.ctz_extend(file, head, pos) {
                        Ok((block, off)) => {
                            file.block = block;
                            file.off = off;
                        }
                        Err(err) => {
                            file.flags |= fflags::ERRED;
                            return Err(err);
                        }
                    }
                } else {
                    file.block = BLOCK_INLINE;
                    file.off = file.pos;
                }

                file.flags |= fflags::WRITING;
            }

            // program as much as we can in the current block
            let diff = nsize.min(self.geo.block_size - file.off) as usize;
            loop {
                let res = bd::write(
                    &mut self.dev,
                    &self.geo,
                    &mut file.cache,
                    &mut self.rcache,
                    true,
                    file.block,
                    file.off,
                    &data[done..done + diff],
                );
                match res {
                    Ok(()) => break,
                    Err(FlintError::Corrupt) => {
                        if let Err(err) = self.file_relocate(file) {
                            file.flags |= fflags::ERRED;
                            return Err(err);
                        }
                    }
                    Err(err) => {
                        file.flags |= fflags::ERRED;
                        return Err(err);
                    }
                }
            }

            file.pos += diff as u64;
            file.off += diff as u64;
            done += diff;
            nsize -= diff as u64;

            self.alloc_ack();
        }

        Ok(size as usize)
    }

    /// Write at the current position. The storage is not updated until sync
    /// or close.
    pub fn file_write(&mut self, fh: FileHandle, data: &[u8]) -> Result<usize> {
        let mut file = self.handles.take_file(fh)?;
        let res = self.file_write_raw(&mut file, data);
        self.handles.put_file(fh, file);
        res
    }

    fn file_write_raw(&mut self, file: &mut FileNode, data: &[u8]) -> Result<usize> {
        if file.flags & fflags::WRONLY == 0 {
            return Err(FlintError::BadFd);
        }

        if file.flags & fflags::READING != 0 {
            // drop any reads
            self.file_flush(file)?;
        }

        if file.flags & fflags::APPEND != 0 && file.pos < file.ctz.size {
            file.pos = file.ctz.size;
        }

        if file.pos + data.len() as u64 > self.file_max {
            return Err(FlintError::FileTooBig);
        }

        if file.flags & fflags::WRITING == 0 && file.pos > file.ctz.size {
            // fill the gap from a seek past the end with zeros
            let pos = file.pos;
            file.pos = file.ctz.size;

            while file.pos < pos {
                self.file_flushed_write(file, &[0])?;
            }
        }

        let written = self.file_flushed_write(file, data)?;
        file.flags &= !fflags::ERRED;
        Ok(written)
    }

    // ── Seek / truncate / cursors ───────────────────────────────────────────

    /// Change the file position. Seeks past the end are allowed; the next
    /// write zero-fills the gap.
    pub fn file_seek(&mut self, fh: FileHandle, whence: SeekFrom) -> Result<u64> {
        let mut file = self.handles.take_file(fh)?;
        let res = self.file_seek_raw(&mut file, whence);
        self.handles.put_file(fh, file);
        res
    }

    fn file_seek_raw(&mut self, file: &mut FileNode, whence: SeekFrom) -> Result<u64> {
        // find the new position
        let npos = match whence {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => file
                .pos
                .checked_add_signed(delta)
                .ok_or(FlintError::Inval)?,
            SeekFrom::End(delta) => file_size_of(file)
                .checked_add_signed(delta)
                .ok_or(FlintError::Inval)?,
        };

        if npos > self.file_max {
            // position out of range
            return Err(FlintError::Inval);
        }

        if file.pos == npos {
            // noop, position has not changed
            return Ok(npos);
        }

        // if we're only reading and the new offset is still in the file's
        // cache we can avoid flushing and rereading the data
        if file.flags & fflags::WRITING == 0 {
            let mut ooff = file.pos;
            let oindex = self.ctz_index(&mut ooff);
            let mut noff = npos;
            let nindex = self.ctz_index(&mut noff);

            if oindex == nindex
                && noff >= file.cache.off
                && noff < file.cache.off + file.cache.size
            {
                file.pos = npos;
                file.off = noff;
                return Ok(npos);
            }
        }

        // write out everything beforehand; may be a noop if read-only
        self.file_flush(file)?;

        file.pos = npos;
        Ok(npos)
    }

    /// Truncate (or zero-extend) the file to `size`.
    pub fn file_truncate(&mut self, fh: FileHandle, size: u64) -> Result<()> {
        let mut file = self.handles.take_file(fh)?;
        let res = self.file_truncate_raw(&mut file, size);
        self.handles.put_file(fh, file);
        res
    }

    fn file_truncate_raw(&mut self, file: &mut FileNode, size: u64) -> Result<()> {
        if file.flags & fflags::WRONLY == 0 {
            return Err(FlintError::BadFd);
        }
        if size > flint_types::FILE_MAX_LIMIT {
            return Err(FlintError::Inval);
        }

        let pos = file.pos;
        let oldsize = file_size_of(file);

        if size < oldsize {
            if size <= self.inline_max() {
                // flush and seek to the start
                self.file_seek_raw(file, SeekFrom::Start(0))?;

                // read the remaining prefix and install it as the inline
                // contents
                self.rcache.discard();
                let mut prefix = vec![0_u8; size as usize];
                self.file_flushed_read(file, &mut prefix)?;

                file.ctz.head = BLOCK_INLINE;
                file.ctz.size = size;
                file.flags |= fflags::DIRTY | fflags::READING | fflags::INLINE;
                file.cache.block = file.ctz.head;
                file.cache.off = 0;
                file.cache.size = self.geo.cache_size;
                file.cache.buffer[..size as usize].copy_from_slice(&prefix);
            } else {
                // need to flush since we're changing metadata directly
                self.file_flush(file)?;

                // lookup the new head in the ctz skip list
                let (head, csize) = (file.ctz.head, file.ctz.size);
                let (block, _) = self.ctz_find(&mut file.cache, head, csize, size - 1)?;

                // set pos/block/off consistently so seeking back to the old
                // position doesn't get confused
                file.pos = size;
                file.block = block;
                file.ctz.head = block;
                file.ctz.size = size;
                file.flags |= fflags::DIRTY | fflags::READING;
            }
        } else if size > oldsize {
            // flush and seek if not already at the end
            self.file_seek_raw(file, SeekFrom::End(0))?;

            // fill with zeros
            while file.pos < size {
                self.file_write_raw(file, &[0])?;
            }
        }

        // restore pos
        self.file_seek_raw(file, SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Current position.
    pub fn file_tell(&self, fh: FileHandle) -> Result<u64> {
        match self.handles.get(fh.0) {
            Some(Node::File(file)) => Ok(file.pos),
            _ => Err(FlintError::BadFd),
        }
    }

    /// Seek back to the start.
    pub fn file_rewind(&mut self, fh: FileHandle) -> Result<()> {
        self.file_seek(fh, SeekFrom::Start(0)).map(|_| ())
    }

    /// Current size, including unsynced writes.
    pub fn file_size(&self, fh: FileHandle) -> Result<u64> {
        match self.handles.get(fh.0) {
            Some(Node::File(file)) => Ok(file_size_of(file)),
            _ => Err(FlintError::BadFd),
        }
    }

    /// The per-file attributes supplied at open, as last read or written.
    pub fn file_attrs(&self, fh: FileHandle) -> Result<&[crate::OpenAttr]> {
        match self.handles.get(fh.0) {
            Some(Node::File(file)) => Ok(&file.attrs),
            _ => Err(FlintError::BadFd),
        }
    }
}
