//! Filesystem lifecycle and whole-tree operations.
//!
//! Format seeds the allocator over the whole device and writes the
//! superblock at pair (0, 1) twice, so any previous filesystem at the same
//! location is fully superseded. Mount walks the tail chain from (0, 1),
//! searching block sizes when the configuration leaves it open, validating
//! the superblock, and XOR-accumulating every movestate tag into the global
//! state. The forced-consistency pass (demove + deorphan) then resolves
//! whatever a power loss left half-done, before the first mutation.

use crate::commit::CommitOutcome;
use crate::handles::{FileNode, Node};
use crate::mdir::{FetchFound, Matcher, MetaDir};
use crate::traverse::{Attr, Payload};
use crate::{Config, Fs};
use flint_block::BlockDevice;
use flint_error::{FlintError, Result};
use flint_types::{
    ceil_log2, pair_from_bytes, pair_is_null, pair_overlap, pair_same, pair_to_bytes, ttype,
    BlockId, BlockPair, FsInfo, GState, Superblock, Tag, ATTR_MAX_LIMIT, DISK_VERSION,
    DISK_VERSION_MAJOR, DISK_VERSION_MINOR, FILE_MAX_LIMIT, ID_NONE, MAGIC, NAME_MAX_LIMIT,
    PAIR_NULL, PTR_SIZE,
};
use tracing::{debug, error};

impl<D: BlockDevice> Fs<D> {
    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Format the device, returning it on success. Does not leave the
    /// filesystem mounted.
    pub fn format(dev: D, cfg: Config) -> Result<D> {
        let mut fs = Self::init(dev, cfg)?;
        let res = fs.format_raw();
        res.map(|()| fs.into_device())
    }

    /// Mount a previously formatted device.
    pub fn mount(dev: D, cfg: Config) -> Result<Self> {
        let mut fs = Self::init(dev, cfg)?;
        fs.mount_raw()?;
        Ok(fs)
    }

    /// Unmount, releasing the device. Open handles are abandoned; anything
    /// not synced is lost.
    pub fn unmount(self) -> D {
        self.into_device()
    }

    fn format_raw(&mut self) -> Result<()> {
        // if block_size is unspecified, assume one erase block
        self.geo.block_size = if self.cfg.block_size != 0 {
            self.cfg.block_size
        } else {
            self.geo.erase_size
        };
        if self.cfg.block_count == 0 {
            return Err(FlintError::Inval);
        }
        self.geo.block_count = self.cfg.block_count;

        // the block must be able to hold the ctz skip pointers
        if self.geo.block_size <= 2 * PTR_SIZE {
            return Err(FlintError::Inval);
        }
        let worst_skips = u64::from(ceil_log2(
            (0xffff_ffff_u64 / (self.geo.block_size - 2 * PTR_SIZE)).max(1),
        ));
        if PTR_SIZE * worst_skips > self.geo.block_size {
            return Err(FlintError::Inval);
        }

        // seed the free lookahead over the whole device
        self.free.window.fill(0);
        self.free.off = 0;
        self.free.size = (self.cfg.lookahead_size * 8).min(self.geo.block_count);
        self.free.i = 0;
        self.alloc_ack();

        // create the root dir
        let mut root = self.dir_alloc_pair(&[])?;

        // write one superblock
        let superblock = Superblock {
            version: DISK_VERSION,
            block_size: self.geo.block_size,
            block_count: self.geo.block_count,
            name_max: self.name_max,
            file_max: self.file_max,
            attr_max: self.attr_max,
        };
        let sb_bytes = superblock.to_bytes();
        let attrs = [
            Attr::new(Tag::new(ttype::CREATE, 0, 0), Payload::None),
            Attr::new(Tag::new(ttype::SUPERBLOCK, 0, 8), Payload::Bytes(MAGIC)),
            Attr::new(
                Tag::new(ttype::INLINESTRUCT, 0, Superblock::DISK_SIZE as u32),
                Payload::Bytes(&sb_bytes),
            ),
        ];
        self.dir_commit(&mut root, &attrs, &[])?;

        // force a second compaction so any older filesystem that may live
        // at the same location cannot be accidentally mounted
        root.erased = false;
        self.dir_commit(&mut root, &[], &[])?;

        // sanity check that fetch works
        self.dir_fetch(&[0, 1])?;

        Ok(())
    }

    fn mount_raw(&mut self) -> Result<()> {
        // if block_size is unknown we need to search for it
        self.geo.block_size = self.cfg.block_size;
        let mut block_size_limit = self.cfg.block_size;

        if self.geo.block_size == 0 {
            self.geo.block_size = self.geo.erase_size;

            // make sure the limit doesn't overflow
            block_size_limit = if self.cfg.block_count == 0
                || self.cfg.block_count / 2 > u64::MAX / self.geo.erase_size
            {
                u64::MAX
            } else {
                (self.cfg.block_count / 2) * self.geo.erase_size
            };
        }

        // search for the correct block_size
        'search: loop {
            // set up block_size/count so the underlying operations work
            self.geo.block_count = if self.cfg.block_count == 0 {
                u64::MAX
            } else if self.cfg.block_size == 0 {
                self.cfg.block_count / (self.geo.block_size / self.geo.erase_size)
            } else {
                self.cfg.block_count
            };

            // cached data from a different block_size must not leak into
            // this attempt, and neither may gstate from a failed walk
            self.rcache.discard();
            self.gstate = GState::default();
            self.root = PAIR_NULL;

            // scan directory blocks for the superblock and global updates
            let mut dir = MetaDir {
                tail: [0, 1],
                ..MetaDir::default()
            };
            let mut cycle: u64 = 0;
            let mut wrong_size = false;

            while !pair_is_null(&dir.tail) {
                if cycle >= self.geo.block_count / 2 {
                    // loop detected
                    return Err(FlintError::Corrupt);
                }
                cycle += 1;

                // fetch the next block in the tail list
                let tail = dir.tail;
                let (ndir, found, _) = match self.dir_fetch_match(
                    &tail,
                    Tag::new(ttype::MOVESTATE, ID_NONE, 0),
                    Tag::new(ttype::SUPERBLOCK, 0, 8),
                    &Matcher::Name(MAGIC),
                ) {
                    Ok(res) => res,
                    Err(FlintError::Corrupt) => {
                        // maybe our block_size is wrong
                        wrong_size = true;
                        break;
                    }
                    Err(err) => return Err(err),
                };
                dir = ndir;

                // has a superblock?
                if let FetchFound::Found(tag) = found {
                    if !tag.is_delete() {
                        // grab the superblock
                        let mut bytes = [0_u8; Superblock::DISK_SIZE];
                        match self.dir_get(
                            &dir,
                            Tag::new(ttype::MOVESTATE, ID_NONE, 0),
                            Tag::new(ttype::INLINESTRUCT, 0, Superblock::DISK_SIZE as u32),
                            &mut bytes,
                        ) {
                            Ok(_) => {}
                            Err(FlintError::Corrupt) => {
                                wrong_size = true;
                                break;
                            }
                            Err(err) => return Err(err),
                        }
                        let superblock = Superblock::from_bytes(&bytes);

                        // check the stored block_size first; if it differs
                        // we must remount, since the superblock we just
                        // read may be an outdated copy
                        if superblock.block_size != self.geo.block_size {
                            if self.cfg.block_size != 0
                                || superblock.block_size % self.geo.erase_size != 0
                                || superblock.block_size < self.geo.block_size
                            {
                                error!(
                                    target: "flint::fs",
                                    block_size = superblock.block_size,
                                    "invalid block size"
                                );
                                return Err(FlintError::Inval);
                            }

                            // remount with the correct block_size
                            self.geo.block_size = superblock.block_size;
                            continue 'search;
                        }

                        if superblock.block_count != self.geo.block_count {
                            if self.cfg.block_count != 0
                                || superblock.block_count > self.geo.block_count
                            {
                                error!(
                                    target: "flint::fs",
                                    block_count = superblock.block_count,
                                    "invalid block count"
                                );
                                return Err(FlintError::Inval);
                            }
                            self.geo.block_count = superblock.block_count;
                        }

                        // check the version
                        let major = (superblock.version >> 16) as u16;
                        let minor = (superblock.version & 0xffff) as u16;
                        if major != DISK_VERSION_MAJOR || minor > DISK_VERSION_MINOR {
                            error!(
                                target: "flint::fs",
                                major,
                                minor,
                                "unsupported version"
                            );
                            return Err(FlintError::Inval);
                        }

                        // learn the on-disk limits
                        if superblock.name_max != 0 {
                            if superblock.name_max > NAME_MAX_LIMIT
                                || superblock.name_max > self.name_max
                            {
                                error!(
                                    target: "flint::fs",
                                    name_max = superblock.name_max,
                                    "unsupported name_max"
                                );
                                return Err(FlintError::Inval);
                            }
                            self.name_max = superblock.name_max;
                        }
                        if superblock.file_max != 0 {
                            if superblock.file_max > FILE_MAX_LIMIT
                                || superblock.file_max > self.file_max
                            {
                                error!(
                                    target: "flint::fs",
                                    file_max = superblock.file_max,
                                    "unsupported file_max"
                                );
                                return Err(FlintError::Inval);
                            }
                            self.file_max = superblock.file_max;
                        }
                        if superblock.attr_max != 0 {
                            if superblock.attr_max > ATTR_MAX_LIMIT
                                || superblock.attr_max > self.attr_max
                            {
                                error!(
                                    target: "flint::fs",
                                    attr_max = superblock.attr_max,
                                    "unsupported attr_max"
                                );
                                return Err(FlintError::Inval);
                            }
                            self.attr_max = superblock.attr_max;
                        }

                        // update the root
                        self.root = dir.pair;
                    }
                }

                // has gstate?
                let mut gstate = self.gstate;
                self.dir_get_gstate(&dir, &mut gstate)?;
                self.gstate = gstate;

                // this block_size produced a valid pair; pin it
                block_size_limit = self.geo.block_size;
            }

            if !wrong_size {
                break;
            }

            // try the next block_size
            loop {
                self.geo.block_size += self.geo.erase_size;
                if self.geo.block_size > block_size_limit {
                    return Err(FlintError::Inval);
                }

                // when block_count is known, only sizes that divide it can
                // be right; this brings the search from O(n) to O(d(n))
                if self.cfg.block_count != 0
                    && self.cfg.block_count % (self.geo.block_size / self.geo.erase_size) != 0
                {
                    continue;
                }
                break;
            }
        }

        // found a superblock?
        if pair_is_null(&self.root) {
            return Err(FlintError::Inval);
        }

        if !self.gstate.is_zero() {
            debug!(
                target: "flint::fs",
                tag = self.gstate.tag.0,
                pair0 = self.gstate.pair[0],
                pair1 = self.gstate.pair[1],
                "found pending gstate"
            );
        }

        // nudge an invalid gstate tag to valid
        self.gstate.tag = Tag(
            self.gstate.tag.0 + u32::from(!self.gstate.tag.is_valid()),
        );
        self.gdisk = self.gstate;

        // to distribute allocations uniformly across boots, start the
        // allocator at a pseudorandom location seeded by the commit crcs
        // seen during mount
        self.free.off = u64::from(self.seed) % self.geo.block_count;
        self.alloc_drop();

        Ok(())
    }

    // ── Whole-filesystem traversal ──────────────────────────────────────────

    /// Visit every block in use: metadata pairs, CTZ chains, and the
    /// in-flight chains of open files.
    pub(crate) fn fs_traverse_raw(
        &mut self,
        cb: &mut dyn FnMut(BlockId) -> Result<()>,
        include_orphans: bool,
        actives: &[&FileNode],
    ) -> Result<()> {
        // iterate over metadata pairs
        let mut dir = MetaDir {
            tail: [0, 1],
            ..MetaDir::default()
        };

        let mut cycle: u64 = 0;
        while !pair_is_null(&dir.tail) {
            if cycle >= self.geo.block_count / 2 {
                // loop detected
                return Err(FlintError::Corrupt);
            }
            cycle += 1;

            for i in 0..2 {
                cb(dir.tail[i])?;
            }

            let tail = dir.tail;
            dir = self.dir_fetch(&tail)?;

            // iterate through the ids in this pair
            for id in 0..dir.count {
                let mut bytes = [0_u8; 16];
                let tag = match self.dir_get(
                    &dir,
                    Tag::new(ttype::GLOBALS, ID_NONE, 0),
                    Tag::new(ttype::STRUCT, id, 16),
                    &mut bytes,
                ) {
                    Ok(tag) => tag,
                    Err(FlintError::NoEnt) => continue,
                    Err(err) => return Err(err),
                };

                if tag.type3() == ttype::CTZSTRUCT {
                    let ctz = flint_types::Ctz::from_bytes(&bytes);
                    self.ctz_traverse(None, ctz.head, ctz.size, cb)?;
                } else if include_orphans && tag.type3() == ttype::DIRSTRUCT {
                    let pair = pair_from_bytes(&bytes);
                    for block in pair {
                        cb(block)?;
                    }
                }
            }
        }

        // iterate over any open files
        for idx in 0..self.handles.len() {
            let Some(node) = self.handles.take(idx) else {
                continue;
            };
            let res = if let Node::File(file) = &node {
                self.file_traverse_blocks(file, cb)
            } else {
                Ok(())
            };
            self.handles.put(idx, node);
            res?;
        }
        for file in actives {
            self.file_traverse_blocks(file, cb)?;
        }

        Ok(())
    }

    fn file_traverse_blocks(
        &mut self,
        file: &FileNode,
        cb: &mut dyn FnMut(BlockId) -> Result<()>,
    ) -> Result<()> {
        if file.flags & crate::fflags::DIRTY != 0 && file.flags & crate::fflags::INLINE == 0 {
            self.ctz_traverse(Some(&file.cache), file.ctz.head, file.ctz.size, cb)?;
        }
        if file.flags & crate::fflags::WRITING != 0 && file.flags & crate::fflags::INLINE == 0 {
            self.ctz_traverse(Some(&file.cache), file.block, file.pos, cb)?;
        }
        Ok(())
    }

    /// Visit every block in use by the filesystem.
    pub fn fs_traverse(&mut self, cb: &mut dyn FnMut(BlockId)) -> Result<()> {
        self.fs_traverse_raw(
            &mut |block| {
                cb(block);
                Ok(())
            },
            true,
            &[],
        )
    }

    pub(crate) fn fs_size_raw(&mut self, actives: &[&FileNode]) -> Result<u64> {
        let mut size = 0_u64;
        self.fs_traverse_raw(
            &mut |_| {
                size += 1;
                Ok(())
            },
            false,
            actives,
        )?;
        Ok(size)
    }

    /// Number of blocks in use. Best effort: files sharing COW structure
    /// may be counted more than once.
    pub fn fs_size(&mut self) -> Result<u64> {
        self.fs_size_raw(&[])
    }

    /// Filesystem info as recorded by the superblock.
    pub fn fs_stat(&mut self) -> Result<FsInfo> {
        let usage = self.fs_size_raw(&[])?;
        Ok(FsInfo {
            block_size: self.geo.block_size,
            block_count: self.geo.block_count,
            block_usage: usage,
            name_max: self.name_max,
            file_max: self.file_max,
            attr_max: self.attr_max,
        })
    }

    /// Grow to a new block count, updating the superblock. Irreversible.
    pub fn fs_grow(&mut self, block_count: u64) -> Result<()> {
        self.fs_grow_raw(block_count, &[])
    }

    pub(crate) fn fs_grow_raw(
        &mut self,
        block_count: u64,
        actives: &[&FileNode],
    ) -> Result<()> {
        // shrinking is not supported
        if block_count < self.geo.block_count {
            return Err(FlintError::Inval);
        }
        if block_count == self.geo.block_count {
            return Ok(());
        }

        self.geo.block_count = block_count;

        // fetch the root and rewrite the superblock
        let root_pair = self.root;
        let mut root = self.dir_fetch(&root_pair)?;

        let mut bytes = [0_u8; Superblock::DISK_SIZE];
        let tag = self.dir_get(
            &root,
            Tag::new(ttype::MOVESTATE, ID_NONE, 0),
            Tag::new(ttype::INLINESTRUCT, 0, Superblock::DISK_SIZE as u32),
            &mut bytes,
        )?;

        let mut superblock = Superblock::from_bytes(&bytes);
        superblock.block_count = block_count;
        let sb_bytes = superblock.to_bytes();

        let attrs = [Attr::new(tag, Payload::Bytes(&sb_bytes))];
        self.dir_commit(&mut root, &attrs, actives)
    }

    // ── Tree walks ──────────────────────────────────────────────────────────

    /// Find the pair whose tail points at `pair`.
    pub(crate) fn fs_pred(&mut self, pair: &BlockPair) -> Result<MetaDir> {
        let mut pdir = MetaDir {
            tail: [0, 1],
            ..MetaDir::default()
        };

        let mut cycle: u64 = 0;
        while !pair_is_null(&pdir.tail) {
            if cycle >= self.geo.block_count / 2 {
                // loop detected
                return Err(FlintError::Corrupt);
            }
            cycle += 1;

            if pair_overlap(&pdir.tail, pair) {
                return Ok(pdir);
            }

            let tail = pdir.tail;
            pdir = self.dir_fetch(&tail)?;
        }

        Err(FlintError::NoEnt)
    }

    /// Find the pair whose dirstruct entry names `pair`, returning the
    /// dirstruct tag and the parent pair.
    pub(crate) fn fs_parent(&mut self, pair: &BlockPair) -> Result<(Tag, MetaDir)> {
        let mut parent = MetaDir {
            tail: [0, 1],
            ..MetaDir::default()
        };

        let mut cycle: u64 = 0;
        while !pair_is_null(&parent.tail) {
            if cycle >= self.geo.block_count / 2 {
                return Err(FlintError::Corrupt);
            }
            cycle += 1;

            let tail = parent.tail;
            let (ndir, found, _) = self.dir_fetch_match(
                &tail,
                Tag::new(ttype::MOVESTATE, 0, 0x3ff),
                Tag::new(ttype::DIRSTRUCT, 0, 16),
                &Matcher::ParentOf(pair),
            )?;
            parent = ndir;

            if let FetchFound::Found(tag) = found {
                return Ok((tag, parent));
            }
        }

        Err(FlintError::NoEnt)
    }

    // ── Global-state protocol ───────────────────────────────────────────────

    /// Adjust the orphan counter carried in the gstate tag's size field.
    /// The top bit of the tag mirrors "has orphans" so the state never
    /// reads as a valid tag while orphans are pending.
    pub(crate) fn fs_preporphans(&mut self, orphans: i8) -> Result<()> {
        debug_assert!(self.gstate.tag.size() > 0 || orphans >= 0);
        self.gstate.tag = Tag(self.gstate.tag.0.wrapping_add(orphans as i32 as u32));
        self.gstate.tag = Tag(
            (self.gstate.tag.0 & !Tag::new(ttype::HAS_ORPHANS, 0, 0).0)
                | (u32::from(self.gstate.has_orphans()) << 31),
        );
        Ok(())
    }

    /// Record (or clear, with `ID_NONE`) the pending move of entry `id` in
    /// `pair`. Persisted by the next commit's movestate delta.
    pub(crate) fn fs_prepmove(&mut self, id: u16, pair: &BlockPair) {
        self.gstate.tag = Tag(
            (self.gstate.tag.0 & !Tag::new(ttype::MOVESTATE, 0x3ff, 0).0)
                | if id != ID_NONE {
                    Tag::new(ttype::DELETE, id, 0).0
                } else {
                    0
                },
        );
        self.gstate.pair = if id != ID_NONE { *pair } else { [0, 0] };
    }

    // ── Forced consistency ──────────────────────────────────────────────────

    /// Finish or roll back a rename interrupted by power loss: the
    /// destination already has the entry, so the recorded source id is
    /// deleted.
    pub(crate) fn fs_demove(&mut self, actives: &[&FileNode]) -> Result<()> {
        if !self.gdisk.has_move() {
            return Ok(());
        }

        debug!(
            target: "flint::fs",
            pair0 = self.gdisk.pair[0],
            pair1 = self.gdisk.pair[1],
            id = self.gdisk.tag.id(),
            "fixing move"
        );

        // fetch and delete the moved entry
        let move_pair = self.gdisk.pair;
        let mut movedir = self.dir_fetch(&move_pair)?;

        // prep gstate and delete the move id
        let moveid = self.gdisk.tag.id();
        self.fs_prepmove(ID_NONE, &PAIR_NULL);

        let attrs = [Attr::new(
            Tag::new(ttype::DELETE, moveid, 0),
            Payload::None,
        )];
        self.dir_commit(&mut movedir, &attrs, actives)
    }

    /// Collect orphaned pairs.
    ///
    /// Two passes: half-orphans (a parent whose dirstruct disagrees with
    /// the pair's position in the tail chain, left by relocations) are
    /// fixed first, since they can hide outdated references to full
    /// orphans; full orphans (no parent at all, left by torn removes and
    /// renames) are only collected after a power loss, because mkdir
    /// creates them on purpose mid-operation.
    pub(crate) fn fs_deorphan(&mut self, powerloss: bool, actives: &[&FileNode]) -> Result<()> {
        if !self.gstate.has_orphans() {
            return Ok(());
        }

        let mut found: u8 = 0;
        'restart: loop {
            for pass in 0..2 {
                let mut pdir = MetaDir {
                    split: true,
                    tail: [0, 1],
                    ..MetaDir::default()
                };

                // iterate over all directory pairs
                while !pair_is_null(&pdir.tail) {
                    let tail = pdir.tail;
                    let dir = self.dir_fetch(&tail)?;

                    // check head blocks for orphans
                    if !pdir.split {
                        // do we have a parent?
                        let parent = match self.fs_parent(&pdir.tail) {
                            Ok(found) => Some(found),
                            Err(FlintError::NoEnt) => None,
                            Err(err) => return Err(err),
                        };

                        if pass == 0 {
                            if let Some((tag, parent_dir)) = &parent {
                                let mut bytes = [0_u8; 16];
                                self.dir_get(
                                    parent_dir,
                                    Tag::new(ttype::MOVESTATE, ID_NONE, 0),
                                    *tag,
                                    &mut bytes,
                                )?;
                                let pair = pair_from_bytes(&bytes);

                                if !pair_same(&pair, &pdir.tail) {
                                    // we have desynced
                                    debug!(
                                        target: "flint::fs",
                                        from0 = pdir.tail[0],
                                        from1 = pdir.tail[1],
                                        to0 = pair[0],
                                        to1 = pair[1],
                                        "fixing half-orphan"
                                    );

                                    // fix any pending move into this pair;
                                    // required, since relocating may have
                                    // outdated the move
                                    let mut moveid = ID_NONE;
                                    if self.gstate.has_move_here(&pdir.pair) {
                                        moveid = self.gstate.tag.id();
                                        debug!(
                                            target: "flint::fs",
                                            id = moveid,
                                            "fixing move while fixing orphans"
                                        );
                                        self.fs_prepmove(ID_NONE, &PAIR_NULL);
                                    }

                                    let bytes = pair_to_bytes(&pair);
                                    let attrs = [
                                        Attr::new(
                                            Tag::new_if(
                                                moveid != ID_NONE,
                                                ttype::DELETE,
                                                moveid,
                                                0,
                                            ),
                                            Payload::None,
                                        ),
                                        Attr::new(
                                            Tag::new(ttype::SOFTTAIL, ID_NONE, 16),
                                            Payload::Bytes(&bytes),
                                        ),
                                    ];
                                    let state =
                                        self.dir_orphaning_commit(&mut pdir, &attrs, actives)?;
                                    found += 1;

                                    // did our commit create more orphans?
                                    if state == CommitOutcome::Orphaned {
                                        continue 'restart;
                                    }

                                    // refetch the tail
                                    continue;
                                }
                            }
                        }

                        if pass == 1 && parent.is_none() && powerloss {
                            // we are an orphan
                            debug!(
                                target: "flint::fs",
                                pair0 = pdir.tail[0],
                                pair1 = pdir.tail[1],
                                "fixing orphan"
                            );

                            // steal state
                            let mut gdelta = self.gdelta;
                            self.dir_get_gstate(&dir, &mut gdelta)?;
                            self.gdelta = gdelta;

                            // steal the tail
                            let bytes = pair_to_bytes(&dir.tail);
                            let attrs = [Attr::new(
                                Tag::new(ttype::TAIL + u16::from(dir.split), ID_NONE, 16),
                                Payload::Bytes(&bytes),
                            )];
                            let state =
                                self.dir_orphaning_commit(&mut pdir, &attrs, actives)?;
                            found += 1;

                            // did our commit create more orphans?
                            if state == CommitOutcome::Orphaned {
                                continue 'restart;
                            }

                            // refetch the tail
                            continue;
                        }
                    }

                    pdir = dir;
                }
            }

            break;
        }

        // mark the fixed orphans as resolved
        let fixed = self.gstate.orphan_count().min(found);
        self.fs_preporphans(-(fixed as i8))
    }

    /// Force the filesystem consistent after a possible power loss: resolve
    /// any pending move, then collect orphans. Needed at most once per
    /// power-on, before the first mutation.
    pub(crate) fn fs_force_consistency(&mut self) -> Result<()> {
        self.fs_demove(&[])?;
        self.fs_deorphan(true, &[])
    }
}
