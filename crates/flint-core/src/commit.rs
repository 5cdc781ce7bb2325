//! Metadata commit machinery.
//!
//! A commit appends XOR-chained attributes to a pair's log and finalizes
//! them with one or more CRC tags that pad the log out to the program
//! granularity. When an append does not fit (or the log is corrupt), the
//! pair is compacted into its other block, splitting into a fresh tail pair
//! when even the compacted form exceeds half a block, and relocating onto
//! fresh blocks on persistent corruption or when the revision counter says
//! the pair has earned a wear-leveling move.
//!
//! Commits run inside two wrappers: the relocating commit retries through
//! compaction and patches every open handle the commit touched, and the
//! orphaning commit flattens the tail-recursive cleanups (dropped pairs,
//! relocated parents and predecessors) that would otherwise chain
//! unboundedly.

use crate::handles::{FileNode, Node};
use crate::mdir::MetaDir;
use crate::traverse::{Attr, Payload, Source, Visit};
use crate::{fflags, Fs};
use flint_block::{self as bd, BlockDevice};
use flint_error::{FlintError, Result};
use flint_types::{
    crc32, pair_is_null, pair_overlap, pair_to_bytes, ttype, BlockId, GState, Tag,
    align_up, BlockPair, ID_NONE, PAIR_NULL, PTR_SIZE,
};
use tracing::{debug, warn};

/// Reserved space at the end of a pair: room for the pointers a future
/// split needs to store.
const PAIR_RESERVE: u64 = 16;

/// Worst-case commit overhead a split must leave room for: a tail (4+16),
/// a gstate delta (4+20), a move delete (4) and a crc footer (4+4), with
/// slack for program-size padding.
const SPLIT_RESERVE: u64 = 72;

/// Internal outcome of a commit; never surfaced through the public error
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Committed,
    /// The pair moved to at least one fresh block.
    Relocated,
    /// The pair emptied out and its predecessor absorbed its tail.
    Dropped,
    /// Cleanup commits left orphans that a deorphan pass must collect.
    Orphaned,
}

/// An open commit window on one block of a pair.
pub(crate) struct Commit {
    pub block: BlockId,
    pub off: u64,
    pub ptag: Tag,
    pub crc: u32,
    pub begin: u64,
    pub end: u64,
}

impl<D: BlockDevice> Fs<D> {
    fn commit_prog(&mut self, commit: &mut Commit, data: &[u8]) -> Result<()> {
        bd::write(
            &mut self.dev,
            &self.geo,
            &mut self.pcache,
            &mut self.rcache,
            false,
            commit.block,
            commit.off,
            data,
        )?;
        commit.crc = crc32(commit.crc, data);
        commit.off += data.len() as u64;
        Ok(())
    }

    /// Append one attribute, XOR-chained against the previous tag.
    pub(crate) fn commit_attr(
        &mut self,
        commit: &mut Commit,
        tag: Tag,
        source: Source<'_>,
    ) -> Result<()> {
        // check that we fit
        let dsize = tag.dsize();
        if commit.off + dsize > commit.end {
            return Err(FlintError::NoSpace);
        }

        // write out the tag
        let ntag = Tag((tag.0 & 0x7fff_ffff) ^ commit.ptag.0);
        self.commit_prog(commit, &ntag.to_be_bytes())?;

        if tag.is_valid() {
            // payload is in memory
            if let Source::Bytes(bytes) = source {
                self.commit_prog(commit, &bytes[..(dsize - 4) as usize])?;
            } else {
                debug_assert_eq!(dsize, 4);
            }
        } else if let Source::Disk { block, off } = source {
            // stream the payload from disk, relying on caching to make
            // this reasonable
            for i in 0..dsize - 4 {
                let mut byte = [0_u8; 1];
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    dsize - 4 - i,
                    block,
                    off + i,
                    &mut byte,
                )?;
                self.commit_prog(commit, &byte)?;
            }
        } else {
            return Err(FlintError::Corrupt);
        }

        commit.ptag = Tag(tag.0 & 0x7fff_ffff);
        Ok(())
    }

    /// Finalize the commit: CRC tags pad it to the next program boundary,
    /// the device is synced, and the written range is read back and
    /// verified. The CRC tag's low chunk bit records whether the following
    /// word was erased, so the next scan can re-establish the XOR chain.
    pub(crate) fn commit_crc(&mut self, commit: &mut Commit) -> Result<()> {
        // align to program units
        let end = align_up(commit.off + 2 * PTR_SIZE, self.geo.prog_size);

        let mut off1 = 0_u64;
        let mut crc1 = 0_u32;

        // create crc tags to fill up the remainder of the commit; padding
        // is not crced, which lets fetches skip it but makes committing a
        // bit more complicated
        while commit.off < end {
            let off = commit.off + 4;
            let mut noff = (end - off).min(0x3fe) + off;
            if noff < end {
                noff = noff.min(end - 2 * PTR_SIZE);
            }

            // read the erased state of the next program unit
            let mut raw = [0xff_u8; 4];
            match bd::read(
                &mut self.dev,
                &self.geo,
                None,
                &mut self.rcache,
                4,
                commit.block,
                noff,
                &mut raw,
            ) {
                Ok(()) => {}
                Err(FlintError::Corrupt) => raw = [0xff; 4],
                Err(err) => return Err(err),
            }

            // build the crc tag
            let reset = Tag::from_be_bytes(raw).is_valid();
            let tag = Tag::new(ttype::CRC + u16::from(reset), 0x3ff, (noff - off) as u32);

            // write out the crc tag and checksum
            let mut footer = [0_u8; 8];
            footer[..4].copy_from_slice(&Tag(tag.0 ^ commit.ptag.0).to_be_bytes());
            commit.crc = crc32(commit.crc, &footer[..4]);
            footer[4..].copy_from_slice(&commit.crc.to_le_bytes());
            bd::write(
                &mut self.dev,
                &self.geo,
                &mut self.pcache,
                &mut self.rcache,
                false,
                commit.block,
                commit.off,
                &footer,
            )?;

            // keep track of the non-padding checksum to verify
            if off1 == 0 {
                off1 = commit.off + 4;
                crc1 = commit.crc;
            }

            commit.off += 4 + tag.size();
            commit.ptag = Tag(tag.0 ^ (u32::from(reset) << 31));
            commit.crc = 0xffff_ffff; // reset for the next "commit"
        }

        // flush buffers
        bd::sync(
            &mut self.dev,
            &self.geo,
            &mut self.pcache,
            &mut self.rcache,
            false,
        )?;

        // successful commit; read back and check the checksums
        let mut off = commit.begin;
        let mut noff = off1;
        while off < end {
            let mut crc = 0xffff_ffff_u32;
            let mut i = off;
            while i < noff + 4 {
                // check against the written crc; this may catch blocks
                // that became readonly and matched our commit exactly
                if i == off1 && crc != crc1 {
                    return Err(FlintError::Corrupt);
                }

                let mut byte = [0_u8; 1];
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    noff + 4 - i,
                    commit.block,
                    i,
                    &mut byte,
                )?;
                crc = crc32(crc, &byte);
                i += 1;
            }

            // the crc of data plus its stored checksum drives the register
            // to zero
            if crc != 0 {
                return Err(FlintError::Corrupt);
            }

            // skip padding
            off = (end - noff).min(0x3fe) + noff;
            if off < end {
                off = off.min(end - 2 * PTR_SIZE);
            }
            noff = off + 4;
        }

        Ok(())
    }

    /// Allocate a fresh pair. Nothing is written; the first commit will.
    pub(crate) fn dir_alloc_pair(&mut self, actives: &[&FileNode]) -> Result<MetaDir> {
        // allocate backwards so the second block is written first
        let mut pair = PAIR_NULL;
        for i in 0..2 {
            pair[(i + 1) % 2] = self.alloc(actives)?;
        }

        let mut dir = MetaDir {
            pair,
            ..MetaDir::default()
        };

        // rather than clobbering one of the blocks we pretend the revision
        // may be valid
        let mut raw = [0_u8; 4];
        match bd::read(
            &mut self.dev,
            &self.geo,
            None,
            &mut self.rcache,
            4,
            pair[0],
            0,
            &mut raw,
        ) {
            Ok(()) => dir.rev = u32::from_le_bytes(raw),
            Err(FlintError::Corrupt) => {}
            Err(err) => return Err(err),
        }

        // align the revision to the block_cycles modulus so the new pair
        // isn't immediately evicted
        if self.cfg.block_cycles > 0 {
            dir.rev =
                align_up(u64::from(dir.rev), (self.cfg.block_cycles as u64 + 1) | 1) as u32;
        }

        dir.off = 4;
        Ok(dir)
    }

    /// Absorb a dropped tail pair: its gstate and tail move into `dir`.
    pub(crate) fn dir_drop(
        &mut self,
        dir: &mut MetaDir,
        tail: &MetaDir,
        actives: &[&FileNode],
    ) -> Result<()> {
        // steal state
        let mut gdelta = self.gdelta;
        self.dir_get_gstate(tail, &mut gdelta)?;
        self.gdelta = gdelta;

        // steal the tail
        let bytes = pair_to_bytes(&tail.tail);
        let attrs = [Attr::new(
            Tag::new(ttype::TAIL + u16::from(tail.split), ID_NONE, 16),
            Payload::Bytes(&bytes),
        )];
        self.dir_commit(dir, &attrs, actives)
    }

    /// Move entries `[split, end)` of `source` (plus pending `attrs`) into
    /// a freshly allocated tail pair.
    fn dir_split(
        &mut self,
        dir: &mut MetaDir,
        attrs: &[Attr<'_>],
        source: &MetaDir,
        split: u16,
        end: u16,
        actives: &[&FileNode],
    ) -> Result<()> {
        // create the tail metadata pair
        let mut tail = self.dir_alloc_pair(actives)?;
        tail.split = dir.split;
        tail.tail = dir.tail;

        // we don't care about relocations here
        let _ = self.dir_compact(&mut tail, attrs, source, split, end, actives)?;

        dir.tail = tail.pair;
        dir.split = true;

        // update the root if needed
        if pair_overlap(&dir.pair, &self.root) && split == 0 {
            self.root = tail.pair;
        }

        Ok(())
    }

    /// Wear-leveling rule. The modulus `(block_cycles+1)|1` sidesteps two
    /// degenerate cases: block_cycles = 1 never terminates, and an even
    /// modulus would alias so only one block of the pair ever relocates.
    fn dir_needs_relocation(&self, dir: &MetaDir) -> bool {
        self.cfg.block_cycles > 0
            && (u64::from(dir.rev) + 1) % ((self.cfg.block_cycles as u64 + 1) | 1) == 0
    }

    /// Rewrite the logical contents of `source[begin..end)` plus `attrs`
    /// into the pair's inactive block, then swap. Relocates onto fresh
    /// blocks when the write fails or wear demands it.
    fn dir_compact(
        &mut self,
        dir: &mut MetaDir,
        attrs: &[Attr<'_>],
        source: &MetaDir,
        begin: u16,
        end: u16,
        actives: &[&FileNode],
    ) -> Result<CommitOutcome> {
        // save some state in case the block is bad
        let mut relocated = false;
        let mut tired = self.dir_needs_relocation(dir);

        dir.rev = dir.rev.wrapping_add(1);

        // wear-forced relocation, except for the superblock pair
        let mut force_relocate = tired && !pair_overlap(&dir.pair, &[0, 1]);

        loop {
            if !force_relocate {
                match self.dir_compact_attempt(dir, attrs, source, begin, end, relocated) {
                    Ok(()) => break,
                    Err(FlintError::Corrupt) => {}
                    Err(err) => return Err(err),
                }
            }
            force_relocate = false;

            // commit was corrupted (or the block is worn out); drop caches
            // and relocate
            relocated = true;
            self.pcache.discard();
            if !tired {
                debug!(target: "flint::mdir", block = dir.pair[1], "bad block");
            }

            // the superblock cannot be relocated
            if pair_overlap(&dir.pair, &[0, 1]) {
                warn!(
                    target: "flint::mdir",
                    block = dir.pair[1],
                    "superblock has become unwritable"
                );
                return Err(FlintError::NoSpace);
            }

            // relocate half of the pair
            match self.alloc(actives) {
                Ok(block) => dir.pair[1] = block,
                // out of space is tolerable when only wear asked for the
                // move; stay on the old block
                Err(FlintError::NoSpace) if tired => {}
                Err(err) => return Err(err),
            }

            tired = false;
        }

        Ok(if relocated {
            CommitOutcome::Relocated
        } else {
            CommitOutcome::Committed
        })
    }

    fn dir_compact_attempt(
        &mut self,
        dir: &mut MetaDir,
        attrs: &[Attr<'_>],
        source: &MetaDir,
        begin: u16,
        end: u16,
        relocated: bool,
    ) -> Result<()> {
        // set up the commit on the inactive block
        let mut commit = Commit {
            block: dir.pair[1],
            off: 0,
            ptag: Tag::INVALID,
            crc: 0xffff_ffff,
            begin: 0,
            end: self.metadata_max() - PAIR_RESERVE,
        };

        // erase the block to write to
        bd::erase(&mut self.dev, &self.geo, dir.pair[1])?;

        // write out the header
        let rev = dir.rev;
        self.commit_prog(&mut commit, &rev.to_le_bytes())?;

        // traverse the directory, this time writing out all unique tags
        self.dir_traverse(
            source,
            0,
            Tag::INVALID,
            attrs,
            Tag::new(ttype::SPLICE, 0x3ff, 0),
            Tag::new(ttype::NAME, 0, 0),
            begin,
            end,
            -i32::from(begin),
            &mut Visit::Commit(&mut commit),
        )?;

        // commit the tail, which may be new after the last size check
        if !pair_is_null(&dir.tail) {
            let bytes = pair_to_bytes(&dir.tail);
            self.commit_attr(
                &mut commit,
                Tag::new(ttype::TAIL + u16::from(dir.split), ID_NONE, 16),
                Source::Bytes(&bytes),
            )?;
        }

        // bring over the gstate?
        let mut delta = GState::default();
        if !relocated {
            delta.xor(&self.gdisk);
            delta.xor(&self.gstate);
        }
        delta.xor(&self.gdelta);
        delta.tag = Tag(delta.tag.0 & !0x3ff);
        self.dir_get_gstate(&*dir, &mut delta)?;

        if !delta.is_zero() {
            let bytes = delta.to_bytes();
            self.commit_attr(
                &mut commit,
                Tag::new(ttype::MOVESTATE, ID_NONE, GState::DISK_SIZE as u32),
                Source::Bytes(&bytes),
            )?;
        }

        // complete the commit with the crc
        self.commit_crc(&mut commit)?;

        // successful compaction; swap the pair to mark the new head
        debug_assert_eq!(commit.off % self.geo.prog_size, 0);
        dir.pair.swap(0, 1);
        dir.count = end - begin;
        dir.off = commit.off;
        dir.etag = commit.ptag;

        // update the gstate
        self.gdelta = GState::default();
        if !relocated {
            self.gdisk = self.gstate;
        }

        Ok(())
    }

    /// Compact, splitting the pair first when the compacted contents would
    /// not fit comfortably in one block.
    fn dir_splitting_compact(
        &mut self,
        dir: &mut MetaDir,
        attrs: &[Attr<'_>],
        source: &MetaDir,
        begin: u16,
        end: u16,
        actives: &[&FileNode],
    ) -> Result<CommitOutcome> {
        let mut end = end;
        loop {
            // find the size of the first split by halving until the prefix
            // is guaranteed to fit; the split point never grows back, which
            // may distribute metadata poorly but keeps this simple
            let mut split = begin;
            while end - split > 1 {
                let mut size = 0_u64;
                self.dir_traverse(
                    source,
                    0,
                    Tag::INVALID,
                    attrs,
                    Tag::new(ttype::SPLICE, 0x3ff, 0),
                    Tag::new(ttype::NAME, 0, 0),
                    split,
                    end,
                    -i32::from(split),
                    &mut Visit::Size(&mut size),
                )?;

                // cap at half a block to avoid degenerate cases with
                // nearly-full pairs, and leave room for the commit overhead
                if end - split < 0xff
                    && size
                        <= (self.geo.block_size - SPLIT_RESERVE).min(align_up(
                            self.metadata_max() / 2,
                            self.geo.prog_size,
                        ))
                {
                    break;
                }

                split += (end - split) / 2;
            }

            if split == begin {
                // no split needed
                break;
            }

            // split into two metadata pairs and continue
            match self.dir_split(dir, attrs, source, split, end, actives) {
                Ok(()) => end = split,
                Err(FlintError::NoSpace) => {
                    // we can't allocate a new block, so try to compact with
                    // degraded performance
                    warn!(
                        target: "flint::mdir",
                        pair0 = dir.pair[0],
                        pair1 = dir.pair[1],
                        "unable to split"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        if self.dir_needs_relocation(dir) && pair_overlap(&dir.pair, &[0, 1]) {
            // we're writing too much to the superblock; expand it out of
            // pair (0, 1) if the filesystem is mostly free. Expanded space
            // is never reclaimed, so expand cautiously
            let size = self.fs_size_raw(actives)?;
            if size < self.geo.block_count / 2 {
                debug!(target: "flint::mdir", rev = dir.rev, "expanding superblock");
                match self.dir_split(dir, attrs, source, begin, end, actives) {
                    Ok(()) => end = begin,
                    Err(FlintError::NoSpace) => {
                        // welp, we tried; if we've become frozen we'll
                        // error later
                        warn!(target: "flint::mdir", "unable to expand superblock");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.dir_compact(dir, attrs, source, begin, end, actives)
    }

    /// Append `attrs` to the pair, falling back to (splitting) compaction,
    /// and patch every open handle the commit affected. `opair` is the pair
    /// address the caller knew, used to find those handles.
    pub(crate) fn dir_relocating_commit(
        &mut self,
        dir: &mut MetaDir,
        opair: &BlockPair,
        attrs: &[Attr<'_>],
        mut pdir: Option<&mut MetaDir>,
        actives: &[&FileNode],
    ) -> Result<CommitOutcome> {
        let mut state = CommitOutcome::Committed;

        // calculate the changes to the directory
        let mut hasdelete = false;
        for attr in attrs {
            if attr.tag.type3() == ttype::CREATE {
                dir.count += 1;
            } else if attr.tag.type3() == ttype::DELETE {
                debug_assert!(dir.count > 0);
                dir.count -= 1;
                hasdelete = true;
            } else if attr.tag.type1() == ttype::TAIL {
                if let Payload::Bytes(bytes) = attr.payload {
                    dir.tail = flint_types::pair_from_bytes(bytes);
                }
                dir.split = attr.tag.chunk() & 1 != 0;
            }
        }

        // should we drop the directory block entirely?
        if hasdelete && dir.count == 0 {
            if let Some(pdir) = pdir.as_deref_mut() {
                match self.fs_pred(&dir.pair) {
                    Ok(pred) => {
                        *pdir = pred;
                        if pred.split {
                            state = CommitOutcome::Dropped;
                        }
                    }
                    Err(FlintError::NoEnt) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        if state != CommitOutcome::Dropped {
            let appended = if dir.erased {
                self.dir_try_append(dir, attrs)?
            } else {
                false
            };

            if !appended {
                // fall back to compaction
                self.pcache.discard();
                let source = *dir;
                state =
                    self.dir_splitting_compact(dir, attrs, &source, 0, source.count, actives)?;
            }
        }

        // patch any open handles we may have affected. The committing
        // handle itself is checked out of the registry, so only bystanders
        // see the splice shifts; its owner refreshes it from `dir`.
        let oldpair = *opair;
        for idx in 0..self.handles.len() {
            let Some(mut node) = self.handles.take(idx) else {
                continue;
            };

            if pair_overlap(&node.mdir().pair, &oldpair) {
                *node.mdir_mut() = *dir;

                for attr in attrs {
                    if attr.tag.type3() == ttype::DELETE && node.id() == attr.tag.id() {
                        node.mdir_mut().pair = PAIR_NULL;
                    } else if attr.tag.type3() == ttype::DELETE && node.id() > attr.tag.id() {
                        *node.id_mut() -= 1;
                        if let Node::Dir(d) = &mut node {
                            d.pos -= 1;
                        }
                    } else if attr.tag.type3() == ttype::CREATE && node.id() >= attr.tag.id() {
                        *node.id_mut() += 1;
                        if let Node::Dir(d) = &mut node {
                            d.pos += 1;
                        }
                    }
                }

                while node.id() >= node.mdir().count && node.mdir().split {
                    // the entry was pushed into the split tail
                    *node.id_mut() -= node.mdir().count;
                    let tail = node.mdir().tail;
                    match self.dir_fetch(&tail) {
                        Ok(mdir) => *node.mdir_mut() = mdir,
                        Err(err) => {
                            self.handles.put(idx, node);
                            return Err(err);
                        }
                    }
                }
            }

            self.handles.put(idx, node);
        }

        Ok(state)
    }

    /// Try the append path; `Ok(false)` means it needs a compaction.
    fn dir_try_append(&mut self, dir: &mut MetaDir, attrs: &[Attr<'_>]) -> Result<bool> {
        let mut commit = Commit {
            block: dir.pair[0],
            off: dir.off,
            ptag: dir.etag,
            crc: 0xffff_ffff,
            begin: dir.off,
            end: self.metadata_max() - PAIR_RESERVE,
        };

        let res = (|| -> Result<Commit> {
            // traverse the attrs that need to be written out
            let snapshot = *dir;
            self.dir_traverse(
                &snapshot,
                snapshot.off,
                snapshot.etag,
                attrs,
                Tag::NOOP,
                Tag::NOOP,
                0,
                0,
                0,
                &mut Visit::Commit(&mut commit),
            )?;

            // commit any global diffs if we have any
            let mut delta = GState::default();
            delta.xor(&self.gstate);
            delta.xor(&self.gdisk);
            delta.xor(&self.gdelta);
            delta.tag = Tag(delta.tag.0 & !0x3ff);
            if !delta.is_zero() {
                self.dir_get_gstate(&snapshot, &mut delta)?;

                let bytes = delta.to_bytes();
                self.commit_attr(
                    &mut commit,
                    Tag::new(ttype::MOVESTATE, ID_NONE, GState::DISK_SIZE as u32),
                    Source::Bytes(&bytes),
                )?;
            }

            // finalize the commit with the crc
            self.commit_crc(&mut commit)?;
            Ok(commit)
        })();

        match res {
            Ok(commit) => {
                // successful commit; update the dir and gstate
                debug_assert_eq!(commit.off % self.geo.prog_size, 0);
                dir.off = commit.off;
                dir.etag = commit.ptag;
                self.gdisk = self.gstate;
                self.gdelta = GState::default();
                Ok(true)
            }
            Err(FlintError::NoSpace | FlintError::Corrupt) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Commit plus the flattened cleanups a commit can require: dropping an
    /// emptied pair into its predecessor and re-homing relocated pairs in
    /// their parent and predecessor. These would be tail-recursive; the
    /// loop bounds stack usage.
    pub(crate) fn dir_orphaning_commit(
        &mut self,
        dir: &mut MetaDir,
        attrs: &[Attr<'_>],
        actives: &[&FileNode],
    ) -> Result<CommitOutcome> {
        // inline files that can no longer live in their cache must be
        // evicted first, or the commit could strand their contents
        for idx in 0..self.handles.len() {
            let wants_evict = matches!(
                self.handles.get(idx),
                Some(Node::File(f))
                    if pair_overlap(&f.mdir.pair, &dir.pair)
                        && f.flags & fflags::INLINE != 0
                        && f.ctz.size > self.geo.cache_size
            );
            if wants_evict {
                let Some(Node::File(mut file)) = self.handles.take(idx) else {
                    continue;
                };
                let res = self
                    .file_outline(&mut file)
                    .and_then(|()| self.file_flush(&mut file));
                self.handles.put(idx, Node::File(file));
                res?;
            }
        }

        let mut lpair = dir.pair;
        let mut ldir = *dir;
        let mut pdir = MetaDir::default();
        let mut state =
            self.dir_relocating_commit(&mut ldir, &lpair, attrs, Some(&mut pdir), actives)?;

        // update the caller's copy unless a relocation already renamed it
        if pair_overlap(&dir.pair, &lpair) {
            *dir = ldir;
        }

        // the commit succeeded, but may require other changes in the
        // filesystem; these would normally be tail recursive, but we have
        // flattened them here to avoid unbounded stack usage

        // need to drop?
        if state == CommitOutcome::Dropped {
            // steal state
            let mut gdelta = self.gdelta;
            self.dir_get_gstate(&*dir, &mut gdelta)?;
            self.gdelta = gdelta;

            // steal the tail; note this can't create a recursive drop
            lpair = pdir.pair;
            let bytes = pair_to_bytes(&dir.tail);
            let tail_attrs = [Attr::new(
                Tag::new(ttype::TAIL + u16::from(dir.split), ID_NONE, 16),
                Payload::Bytes(&bytes),
            )];
            state =
                self.dir_relocating_commit(&mut pdir, &lpair, &tail_attrs, None, actives)?;

            ldir = pdir;
        }

        // need to relocate?
        let mut orphans = false;
        while state == CommitOutcome::Relocated {
            debug!(
                target: "flint::mdir",
                from0 = lpair[0],
                from1 = lpair[1],
                to0 = ldir.pair[0],
                to1 = ldir.pair[1],
                "relocating pair"
            );
            state = CommitOutcome::Committed;

            // update the internal root
            if pair_overlap(&lpair, &self.root) {
                self.root = ldir.pair;
            }

            // update internally tracked dirs
            for idx in 0..self.handles.len() {
                let Some(mut node) = self.handles.take(idx) else {
                    continue;
                };
                if pair_overlap(&lpair, &node.mdir().pair) {
                    node.mdir_mut().pair = ldir.pair;
                }
                if let Node::Dir(d) = &mut node {
                    if pair_overlap(&lpair, &d.head) {
                        d.head = ldir.pair;
                    }
                }
                self.handles.put(idx, node);
            }

            // find the parent
            let parent = match self.fs_parent(&lpair) {
                Ok(found) => Some(found),
                Err(FlintError::NoEnt) => None,
                Err(err) => return Err(err),
            };
            let hasparent = parent.is_some();

            if let Some((mut tag, mut parent_dir)) = parent {
                // we have a parent, so we must have a pred: this always
                // creates an orphan
                self.fs_preporphans(1)?;

                // fix a pending move into this pair; this looks like an
                // optimization but is required, since relocating may
                // outdate the move
                let mut moveid = ID_NONE;
                if self.gstate.has_move_here(&parent_dir.pair) {
                    moveid = self.gstate.tag.id();
                    debug!(
                        target: "flint::mdir",
                        pair0 = parent_dir.pair[0],
                        pair1 = parent_dir.pair[1],
                        id = moveid,
                        "fixing move while relocating"
                    );
                    self.fs_prepmove(ID_NONE, &PAIR_NULL);
                    if moveid < tag.id() {
                        tag = tag.wrapping_sub(Tag::new(0, 1, 0));
                    }
                }

                let ppair = parent_dir.pair;
                let bytes = pair_to_bytes(&ldir.pair);
                let fix_attrs = [
                    Attr::new(
                        Tag::new_if(moveid != ID_NONE, ttype::DELETE, moveid, 0),
                        Payload::None,
                    ),
                    Attr::new(tag, Payload::Bytes(&bytes)),
                ];
                state = self.dir_relocating_commit(
                    &mut parent_dir,
                    &ppair,
                    &fix_attrs,
                    None,
                    actives,
                )?;

                if state == CommitOutcome::Relocated {
                    lpair = ppair;
                    ldir = parent_dir;
                    orphans = true;
                    continue;
                }
            }

            // find the predecessor
            match self.fs_pred(&lpair) {
                Ok(mut pred) => {
                    if self.gstate.has_orphans() {
                        // next step: clean up the orphan we created above
                        self.fs_preporphans(if hasparent { -1 } else { 0 })?;
                    }

                    // fix a pending move in this pair as well
                    let mut moveid = ID_NONE;
                    if self.gstate.has_move_here(&pred.pair) {
                        moveid = self.gstate.tag.id();
                        debug!(
                            target: "flint::mdir",
                            pair0 = pred.pair[0],
                            pair1 = pred.pair[1],
                            id = moveid,
                            "fixing move while relocating"
                        );
                        self.fs_prepmove(ID_NONE, &PAIR_NULL);
                    }

                    // replace the bad pair; either we clean up the desync
                    // or no desync occurred
                    lpair = pred.pair;
                    let bytes = pair_to_bytes(&ldir.pair);
                    let fix_attrs = [
                        Attr::new(
                            Tag::new_if(moveid != ID_NONE, ttype::DELETE, moveid, 0),
                            Payload::None,
                        ),
                        Attr::new(
                            Tag::new(ttype::TAIL + u16::from(pred.split), ID_NONE, 16),
                            Payload::Bytes(&bytes),
                        ),
                    ];
                    state = self.dir_relocating_commit(
                        &mut pred,
                        &lpair,
                        &fix_attrs,
                        None,
                        actives,
                    )?;

                    ldir = pred;
                }
                // if we can't find the dir, it must be new; a pair with a
                // parent always has a predecessor
                Err(FlintError::NoEnt) => debug_assert!(!hasparent),
                Err(err) => return Err(err),
            }
        }

        Ok(if orphans {
            CommitOutcome::Orphaned
        } else {
            state
        })
    }

    /// The orphan-aware commit every mutation goes through.
    pub(crate) fn dir_commit(
        &mut self,
        dir: &mut MetaDir,
        attrs: &[Attr<'_>],
        actives: &[&FileNode],
    ) -> Result<()> {
        let state = self.dir_orphaning_commit(dir, attrs, actives)?;

        if state == CommitOutcome::Orphaned {
            // make sure we've removed all orphans; this is a no-op when
            // there are none, but nested block failures may have created
            // some
            self.fs_deorphan(false, actives)?;
        }

        Ok(())
    }
}
