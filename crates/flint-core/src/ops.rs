//! Path-level operations: stat, remove, rename and custom attributes.
//!
//! rename is a combined delete-create-copy in one commit on the destination
//! pair; the source entry's tags are replayed through the move expansion.
//! When source and destination live in different pairs, the pending move is
//! recorded in gstate so that a power loss between the two commits is
//! resolved by the next mount's demove pass.

use crate::handles::{Node, ScratchNode};
use crate::mdir::MetaDir;
use crate::traverse::{Attr, Payload};
use crate::Fs;
use flint_block::BlockDevice;
use flint_error::{FlintError, Result};
use flint_types::{
    pair_from_bytes, pair_overlap, ttype, EntryInfo, Tag, ID_NONE, PAIR_NULL, SIZE_DELETE,
};

impl<D: BlockDevice> Fs<D> {
    /// Info about a file or directory.
    pub fn stat(&mut self, path: &str) -> Result<EntryInfo> {
        let mut cwd = MetaDir::default();
        let target = self.dir_find(&mut cwd, path)?;
        let Some(tag) = target.tag else {
            return Err(FlintError::NoEnt);
        };
        self.dir_get_info(&cwd, tag.id())
    }

    /// Remove a file or empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        // deorphan if we haven't yet; needed at most once after power-on
        self.fs_force_consistency()?;

        let mut cwd = MetaDir::default();
        let target = self.dir_find(&mut cwd, path)?;
        let Some(tag) = target.tag else {
            return Err(FlintError::NoEnt);
        };
        if tag.id() == ID_NONE {
            // the root cannot be removed
            return Err(FlintError::Inval);
        }

        let mut dirmeta = MetaDir::default();
        let mut scratch = None;
        if tag.type3() == ttype::DIR {
            // must be empty before removal
            let mut bytes = [0_u8; 16];
            self.dir_get(
                &cwd,
                Tag::new(ttype::GLOBALS, ID_NONE, 0),
                Tag::new(ttype::STRUCT, tag.id(), 16),
                &mut bytes,
            )?;
            let pair = pair_from_bytes(&bytes);

            dirmeta = self.dir_fetch(&pair)?;
            if dirmeta.count > 0 || dirmeta.split {
                return Err(FlintError::NotEmpty);
            }

            // mark the fs as orphaned while the dir is unlinked
            self.fs_preporphans(1)?;

            // the dir can be moved by the parent's commit (if the
            // predecessor is a child); register it for patch-up
            scratch = Some(self.handles.insert(Node::Scratch(ScratchNode {
                id: 0,
                mdir: dirmeta,
            })));
        }

        // delete the entry
        let attrs = [Attr::new(
            Tag::new(ttype::DELETE, tag.id(), 0),
            Payload::None,
        )];
        let res = self.dir_commit(&mut cwd, &attrs, &[]);

        if let Some(idx) = scratch {
            if let Some(Node::Scratch(s)) = self.handles.take(idx) {
                dirmeta = s.mdir;
            }
            self.handles.release(idx);
        }
        res?;

        if tag.type3() == ttype::DIR {
            // fix the orphan
            self.fs_preporphans(-1)?;

            let mut pred = self.fs_pred(&dirmeta.pair)?;
            self.dir_drop(&mut pred, &dirmeta, &[])?;
        }

        Ok(())
    }

    /// Rename or move a file or directory. An existing destination of the
    /// same type is replaced atomically.
    pub fn rename(&mut self, oldpath: &str, newpath: &str) -> Result<()> {
        // deorphan if we haven't yet; needed at most once after power-on
        self.fs_force_consistency()?;

        // find the old entry
        let mut oldcwd = MetaDir::default();
        let oldtarget = self.dir_find(&mut oldcwd, oldpath)?;
        let Some(oldtag) = oldtarget.tag else {
            return Err(FlintError::NoEnt);
        };
        if oldtag.id() == ID_NONE {
            return Err(FlintError::Inval);
        }

        // find the new entry
        let mut newcwd = MetaDir::default();
        let newtarget = self.dir_find(&mut newcwd, newpath)?;
        let newid = newtarget.id;
        let prevtag = newtarget.tag;
        match prevtag {
            Some(t) if t.id() == ID_NONE => return Err(FlintError::Inval),
            None if newid == ID_NONE => return Err(FlintError::NoEnt),
            _ => {}
        }

        // renames within one pair have a few special cases
        let samepair = pair_overlap(&oldcwd.pair, &newcwd.pair);
        let mut newoldid = oldtag.id();

        let mut prevdir = MetaDir::default();
        let mut scratch = None;

        match prevtag {
            None => {
                // check that the name fits
                if newtarget.name.len() as u64 > self.name_max {
                    return Err(FlintError::NameTooLong);
                }

                // there's a small chance we're renaming within one pair to
                // an id below our own; the create shifts our old id up
                if samepair && newid <= newoldid {
                    newoldid += 1;
                }
            }
            Some(t) if t.type3() != oldtag.type3() => {
                // replacement must match in type
                return Err(FlintError::IsDir);
            }
            Some(_) if samepair && newid == newoldid => {
                // renaming to ourselves is a no-op
                return Ok(());
            }
            Some(t) if t.type3() == ttype::DIR => {
                // must be empty before replacement
                let mut bytes = [0_u8; 16];
                self.dir_get(
                    &newcwd,
                    Tag::new(ttype::GLOBALS, ID_NONE, 0),
                    Tag::new(ttype::STRUCT, newid, 16),
                    &mut bytes,
                )?;
                let prevpair = pair_from_bytes(&bytes);

                prevdir = self.dir_fetch(&prevpair)?;
                if prevdir.count > 0 || prevdir.split {
                    return Err(FlintError::NotEmpty);
                }

                // mark the fs as orphaned while the old dir is unlinked
                self.fs_preporphans(1)?;

                // register the doomed dir for patch-up; commits on the
                // destination can still move it
                scratch = Some(self.handles.insert(Node::Scratch(ScratchNode {
                    id: 0,
                    mdir: prevdir,
                })));
            }
            Some(_) => {}
        }

        if !samepair {
            self.fs_prepmove(newoldid, &oldcwd.pair);
        }

        // move over all attributes in one commit on the destination
        let name_bytes = newtarget.name.as_bytes();
        let attrs = [
            Attr::new(
                Tag::new_if(prevtag.is_some(), ttype::DELETE, newid, 0),
                Payload::None,
            ),
            Attr::new(Tag::new(ttype::CREATE, newid, 0), Payload::None),
            Attr::new(
                Tag::new(oldtag.type3(), newid, name_bytes.len() as u32),
                Payload::Bytes(name_bytes),
            ),
            Attr::new(
                Tag::new(ttype::FROM_MOVE, newid, oldtag.id() as u32),
                Payload::Move(&oldcwd),
            ),
            Attr::new(
                Tag::new_if(samepair, ttype::DELETE, newoldid, 0),
                Payload::None,
            ),
        ];
        let mut res = self.dir_commit(&mut newcwd, &attrs, &[]);

        // let the commit clean up after the move; when the pairs differ the
        // source entry still has to be deleted (demove covers a crash in
        // between)
        if res.is_ok() && !samepair && self.gstate.has_move() {
            self.fs_prepmove(ID_NONE, &PAIR_NULL);
            let del = [Attr::new(
                Tag::new(ttype::DELETE, oldtag.id(), 0),
                Payload::None,
            )];
            res = self.dir_commit(&mut oldcwd, &del, &[]);
        }

        if let Some(idx) = scratch {
            if let Some(Node::Scratch(s)) = self.handles.take(idx) {
                prevdir = s.mdir;
            }
            self.handles.release(idx);
        }
        res?;

        if let Some(t) = prevtag {
            if t.type3() == ttype::DIR {
                // fix the orphan
                self.fs_preporphans(-1)?;

                let mut pred = self.fs_pred(&prevdir.pair)?;
                self.dir_drop(&mut pred, &prevdir, &[])?;
            }
        }

        Ok(())
    }

    // ── Custom attributes ───────────────────────────────────────────────────

    /// Read a custom attribute into `buf` (zero-padded past the stored
    /// size). Returns the stored size, or `NoAttr` if absent.
    pub fn get_attr(&mut self, path: &str, atype: u8, buf: &mut [u8]) -> Result<u64> {
        let mut cwd = MetaDir::default();
        let target = self.dir_find(&mut cwd, path)?;
        let Some(tag) = target.tag else {
            return Err(FlintError::NoEnt);
        };

        let mut id = tag.id();
        if id == ID_NONE {
            // special case for the root
            id = 0;
            let root = self.root;
            cwd = self.dir_fetch(&root)?;
        }

        let gsize = (buf.len() as u64).min(self.attr_max) as usize;
        match self.dir_get(
            &cwd,
            Tag::new(ttype::MOVESTATE, ID_NONE, 0),
            Tag::new(ttype::USERATTR + u16::from(atype), id, gsize as u32),
            &mut buf[..gsize],
        ) {
            Ok(tag) => Ok(tag.size()),
            Err(FlintError::NoEnt) => Err(FlintError::NoAttr),
            Err(err) => Err(err),
        }
    }

    /// Set a custom attribute, creating it if absent.
    pub fn set_attr(&mut self, path: &str, atype: u8, value: &[u8]) -> Result<()> {
        if value.len() as u64 > self.attr_max {
            return Err(FlintError::NoSpace);
        }

        self.commit_user_attr(path, atype, value.len() as u32, Payload::Bytes(value))
    }

    /// Remove a custom attribute. Removing an absent attribute is a no-op.
    pub fn remove_attr(&mut self, path: &str, atype: u8) -> Result<()> {
        // a tombstone: the all-ones size marks a deleted attribute
        self.commit_user_attr(path, atype, SIZE_DELETE, Payload::None)
    }

    fn commit_user_attr(
        &mut self,
        path: &str,
        atype: u8,
        size: u32,
        payload: Payload<'_>,
    ) -> Result<()> {
        self.fs_force_consistency()?;

        let mut cwd = MetaDir::default();
        let target = self.dir_find(&mut cwd, path)?;
        let Some(tag) = target.tag else {
            return Err(FlintError::NoEnt);
        };

        let mut id = tag.id();
        if id == ID_NONE {
            // special case for the root
            id = 0;
            let root = self.root;
            cwd = self.dir_fetch(&root)?;
        }

        let attrs = [Attr::new(
            Tag::new(ttype::USERATTR + u16::from(atype), id, size),
            payload,
        )];
        self.dir_commit(&mut cwd, &attrs, &[])
    }
}
