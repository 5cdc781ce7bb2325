//! Directory operations.
//!
//! mkdir threads a freshly allocated pair into the filesystem-order tail
//! chain before linking it into its parent, marking the filesystem orphaned
//! while the two commits are in flight. Directory iteration walks the
//! entries of a pair and follows hard-tails across splits, synthesizing the
//! `.` and `..` entries a POSIX listing expects.

use crate::handles::{DirHandle, DirNode, Node, ScratchNode};
use crate::mdir::MetaDir;
use crate::traverse::{Attr, Payload};
use crate::Fs;
use flint_block::BlockDevice;
use flint_error::{FlintError, Result};
use flint_types::{
    pair_from_bytes, pair_overlap, pair_to_bytes, ttype, EntryInfo, EntryKind, Tag, ID_NONE,
};

impl<D: BlockDevice> Fs<D> {
    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        // deorphan if we haven't yet; needed at most once after power-on
        self.fs_force_consistency()?;

        let mut cwd = MetaDir::default();
        let target = self.dir_find(&mut cwd, path)?;
        let (id, name) = match (target.tag, target.id) {
            (None, id) if id != ID_NONE => (id, target.name),
            (Some(_), _) => return Err(FlintError::Exists),
            _ => return Err(FlintError::NoEnt),
        };

        // check that the name fits
        let nlen = name.len() as u64;
        if nlen > self.name_max {
            return Err(FlintError::NameTooLong);
        }

        // build up the new directory
        self.alloc_ack();
        let mut dir = self.dir_alloc_pair(&[])?;

        // find the end of the parent's chain
        let mut pred = cwd;
        while pred.split {
            let tail = pred.tail;
            pred = self.dir_fetch(&tail)?;
        }

        // set up the dir: its soft-tail takes over the end of the list
        let tail_bytes = pair_to_bytes(&pred.tail);
        let attrs = [Attr::new(
            Tag::new(ttype::SOFTTAIL, ID_NONE, 16),
            Payload::Bytes(&tail_bytes),
        )];
        self.dir_commit(&mut dir, &attrs, &[])?;

        // if the parent pair is not the end of the list, hook the new pair
        // into the chain now; the dir is half-linked until the parent
        // commit below lands
        if cwd.split {
            // updating tails creates a desync
            self.fs_preporphans(1)?;

            // the predecessor may relocate during this commit, and if the
            // parent is the predecessor's predecessor that would outdate
            // cwd; register it so the commit machinery patches it
            let scratch = self
                .handles
                .insert(Node::Scratch(ScratchNode { id: 0, mdir: cwd }));

            let pair_bytes = pair_to_bytes(&dir.pair);
            let attrs = [Attr::new(
                Tag::new(ttype::SOFTTAIL, ID_NONE, 16),
                Payload::Bytes(&pair_bytes),
            )];
            let res = self.dir_commit(&mut pred, &attrs, &[]);

            if let Some(Node::Scratch(s)) = self.handles.take(scratch) {
                cwd = s.mdir;
            }
            self.handles.release(scratch);
            res?;

            self.fs_preporphans(-1)?;
        }

        // now insert into the parent block
        let pair_bytes = pair_to_bytes(&dir.pair);
        let attrs = [
            Attr::new(Tag::new(ttype::CREATE, id, 0), Payload::None),
            Attr::new(
                Tag::new(ttype::DIR, id, nlen as u32),
                Payload::Bytes(name.as_bytes()),
            ),
            Attr::new(
                Tag::new(ttype::DIRSTRUCT, id, 16),
                Payload::Bytes(&pair_bytes),
            ),
            Attr::new(
                Tag::new_if(!cwd.split, ttype::SOFTTAIL, ID_NONE, 16),
                Payload::Bytes(&pair_bytes),
            ),
        ];
        self.dir_commit(&mut cwd, &attrs, &[])?;

        Ok(())
    }

    /// Open a directory for iteration.
    pub fn dir_open(&mut self, path: &str) -> Result<DirHandle> {
        let mut mdir = MetaDir::default();
        let target = self.dir_find(&mut mdir, path)?;
        let Some(tag) = target.tag else {
            return Err(FlintError::NoEnt);
        };
        if tag.type3() != ttype::DIR {
            return Err(FlintError::NotDir);
        }

        let pair = if tag.id() == ID_NONE {
            // handle the root dir separately
            self.root
        } else {
            // get the dir pair from the parent entry
            let mut bytes = [0_u8; 16];
            self.dir_get(
                &mdir,
                Tag::new(ttype::GLOBALS, ID_NONE, 0),
                Tag::new(ttype::STRUCT, tag.id(), 16),
                &mut bytes,
            )?;
            pair_from_bytes(&bytes)
        };

        // fetch the first pair
        let mdir = self.dir_fetch(&pair)?;
        let node = DirNode {
            id: 0,
            mdir,
            head: mdir.pair,
            pos: 0,
        };
        Ok(DirHandle(self.handles.insert(Node::Dir(node))))
    }

    /// Close a directory.
    pub fn dir_close(&mut self, dh: DirHandle) -> Result<()> {
        match self.handles.take(dh.0) {
            Some(Node::Dir(_)) => {
                self.handles.release(dh.0);
                Ok(())
            }
            Some(other) => {
                self.handles.put(dh.0, other);
                Err(FlintError::BadFd)
            }
            None => Err(FlintError::BadFd),
        }
    }

    /// Read the next entry, or `None` at the end of the directory.
    pub fn dir_read(&mut self, dh: DirHandle) -> Result<Option<EntryInfo>> {
        let mut dir = self.handles.take_dir(dh)?;
        let res = self.dir_read_raw(&mut dir);
        self.handles.put_dir(dh, dir);
        res
    }

    fn dir_read_raw(&mut self, dir: &mut DirNode) -> Result<Option<EntryInfo>> {
        // special offsets for '.' and '..'
        if dir.pos == 0 {
            dir.pos += 1;
            return Ok(Some(EntryInfo {
                kind: EntryKind::Dir,
                size: 0,
                name: ".".to_owned(),
            }));
        } else if dir.pos == 1 {
            dir.pos += 1;
            return Ok(Some(EntryInfo {
                kind: EntryKind::Dir,
                size: 0,
                name: "..".to_owned(),
            }));
        }

        loop {
            if dir.id == dir.mdir.count {
                if !dir.mdir.split {
                    return Ok(None);
                }

                // continue into the hard-tail
                let tail = dir.mdir.tail;
                dir.mdir = self.dir_fetch(&tail)?;
                dir.id = 0;
            }

            let mdir = dir.mdir;
            match self.dir_get_info(&mdir, dir.id) {
                Ok(info) => {
                    dir.id += 1;
                    dir.pos += 1;
                    return Ok(Some(info));
                }
                // a hole left by a pending move; skip it
                Err(FlintError::NoEnt) => dir.id += 1,
                Err(err) => return Err(err),
            }
        }
    }

    /// Seek to an offset previously returned by `dir_tell`.
    pub fn dir_seek(&mut self, dh: DirHandle, off: u64) -> Result<()> {
        let mut dir = self.handles.take_dir(dh)?;
        let res = self.dir_seek_raw(&mut dir, off);
        self.handles.put_dir(dh, dir);
        res
    }

    fn dir_seek_raw(&mut self, dir: &mut DirNode, off: u64) -> Result<()> {
        // simply walk from the head dir
        self.dir_rewind_raw(dir)?;

        // first two for '.' and '..'
        dir.pos = off.min(2);
        let mut off = off - dir.pos;

        // skip the superblock entry
        dir.id = u16::from(off > 0 && pair_overlap(&dir.head, &self.root));

        while off > 0 {
            if dir.id == dir.mdir.count {
                if !dir.mdir.split {
                    return Err(FlintError::Inval);
                }

                let tail = dir.mdir.tail;
                dir.mdir = self.dir_fetch(&tail)?;
                dir.id = 0;
            }

            let diff = u64::from(dir.mdir.count - dir.id).min(off);
            dir.id += diff as u16;
            dir.pos += diff;
            off -= diff;
        }

        Ok(())
    }

    /// Current position in the iteration; only meaningful to `dir_seek`.
    pub fn dir_tell(&self, dh: DirHandle) -> Result<u64> {
        match self.handles.get(dh.0) {
            Some(Node::Dir(dir)) => Ok(dir.pos),
            _ => Err(FlintError::BadFd),
        }
    }

    /// Rewind to the beginning of the directory.
    pub fn dir_rewind(&mut self, dh: DirHandle) -> Result<()> {
        let mut dir = self.handles.take_dir(dh)?;
        let res = self.dir_rewind_raw(&mut dir);
        self.handles.put_dir(dh, dir);
        res
    }

    fn dir_rewind_raw(&mut self, dir: &mut DirNode) -> Result<()> {
        // reload the head pair
        let head = dir.head;
        dir.mdir = self.dir_fetch(&head)?;
        dir.id = 0;
        dir.pos = 0;
        Ok(())
    }
}
