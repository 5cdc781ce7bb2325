//! Metadata pairs: fetch and lookup.
//!
//! A pair is two blocks forming one logical log. The active head is the
//! block with the greater sequence-compared revision whose commits pass
//! their CRCs; everything after the last valid CRC tag is treated as erased.
//! Lookups scan the log backward so the most recent version of an attribute
//! is found first, with splice tags folded into a running id delta so
//! queries see post-splice ids.

use crate::Fs;
use flint_block::{self as bd, BlockDevice, Cache};
use flint_error::{FlintError, Result};
use flint_types::{
    crc32, pair_from_bytes, pair_is_null, seq_cmp, ttype, BlockId, BlockPair, GState, Tag,
    EntryInfo, EntryKind, ID_NONE, PAIR_NULL,
};
use tracing::error;

/// In-memory state of a fetched metadata pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaDir {
    pub pair: BlockPair,
    pub rev: u32,
    /// End of the last valid commit.
    pub off: u64,
    /// Last tag of that commit, for XOR-chaining appends.
    pub etag: Tag,
    pub count: u16,
    /// Whether an append can continue where the log left off.
    pub erased: bool,
    /// Tail is a hard-tail: this pair continues the same directory.
    pub split: bool,
    pub tail: BlockPair,
}

impl Default for MetaDir {
    fn default() -> Self {
        Self {
            pair: PAIR_NULL,
            rev: 0,
            off: 0,
            etag: Tag::INVALID,
            count: 0,
            erased: false,
            split: false,
            tail: PAIR_NULL,
        }
    }
}

/// Result of a fetch-with-match scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchFound {
    /// Most recent matching tag.
    Found(Tag),
    /// Pair fetched fine; nothing matched.
    None,
    /// The best match was deleted by a later splice.
    Deleted,
}

/// Comparison target for the fetch-time match callback.
pub(crate) enum Matcher<'m> {
    None,
    /// Match a name tag whose payload equals these bytes.
    Name(&'m [u8]),
    /// Match a dirstruct whose payload names this pair.
    ParentOf(&'m BlockPair),
}

impl<D: BlockDevice> Fs<D> {
    /// Fetch a pair, picking the newer of its two blocks.
    pub(crate) fn dir_fetch(&mut self, pair: &BlockPair) -> Result<MetaDir> {
        // mask and tag of all ones can never match: the pattern has the
        // invalid bit set
        let (dir, _, _) =
            self.dir_fetch_match(pair, Tag::INVALID, Tag::INVALID, &Matcher::None)?;
        Ok(dir)
    }

    /// Fetch a pair while scanning for the most recent tag matching
    /// `(fmask, ftag)` whose payload satisfies `matcher`.
    ///
    /// Returns the fetched dir, the match outcome, and the id where a
    /// matching entry would be inserted (the matched id, or `count`).
    pub(crate) fn dir_fetch_match(
        &mut self,
        pair: &BlockPair,
        fmask: Tag,
        ftag: Tag,
        matcher: &Matcher<'_>,
    ) -> Result<(MetaDir, FetchFound, u16)> {
        // if either block address is invalid we error here, otherwise later
        // writes to the pair could fail
        if pair[0] >= self.geo.block_count || pair[1] >= self.geo.block_count {
            return Err(FlintError::Corrupt);
        }

        // find the block with the most recent revision
        let mut revs = [0_u32; 2];
        let mut r = 0_usize;
        for i in 0..2 {
            let mut word = [0_u8; 4];
            match bd::read(
                &mut self.dev,
                &self.geo,
                None,
                &mut self.rcache,
                4,
                pair[i],
                0,
                &mut word,
            ) {
                Ok(()) => {
                    revs[i] = u32::from_le_bytes(word);
                    if seq_cmp(revs[i], revs[(i + 1) % 2]) > 0 {
                        r = i;
                    }
                }
                Err(FlintError::Corrupt) => {}
                Err(err) => return Err(err),
            }
        }

        let mut dir = MetaDir {
            pair: [pair[r % 2], pair[(r + 1) % 2]],
            rev: revs[r % 2],
            off: 0, // nonzero means we found some commits
            ..MetaDir::default()
        };

        // now scan tags to fetch the actual dir and find a possible match
        let mut besttag: u32 = u32::MAX;
        for _ in 0..2 {
            let mut off = 0_u64;
            let mut ptag = Tag::INVALID;

            let mut tempcount = 0_u16;
            let mut temptail = PAIR_NULL;
            let mut tempsplit = false;
            let mut tempbesttag = besttag;

            let mut crc = crc32(0xffff_ffff, &dir.rev.to_le_bytes());

            loop {
                // extract the next tag
                off += ptag.dsize();
                let mut raw = [0_u8; 4];
                match bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    self.geo.block_size,
                    dir.pair[0],
                    off,
                    &mut raw,
                ) {
                    Ok(()) => {}
                    Err(FlintError::Corrupt) => {
                        // can't continue?
                        dir.erased = false;
                        break;
                    }
                    Err(err) => return Err(err),
                }

                crc = crc32(crc, &raw);
                let tag = Tag::from_be_bytes(raw).xor(ptag);

                if !tag.is_valid() {
                    // next commit not yet programmed, or we're not in a
                    // valid range
                    dir.erased =
                        ptag.type1() == ttype::CRC && dir.off % self.geo.prog_size == 0;
                    break;
                } else if off + tag.dsize() > self.geo.block_size {
                    dir.erased = false;
                    break;
                }

                ptag = tag;

                if tag.type1() == ttype::CRC {
                    // check the crc attribute
                    let mut word = [0_u8; 4];
                    match bd::read(
                        &mut self.dev,
                        &self.geo,
                        None,
                        &mut self.rcache,
                        self.geo.block_size,
                        dir.pair[0],
                        off + 4,
                        &mut word,
                    ) {
                        Ok(()) => {}
                        Err(FlintError::Corrupt) => {
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }

                    if crc != u32::from_le_bytes(word) {
                        dir.erased = false;
                        break;
                    }

                    // the low chunk bit is a phase that threads the XOR
                    // chain across the CRC boundary
                    ptag = ptag.xor(Tag(u32::from(tag.chunk() & 1) << 31));

                    // toss the crc into the filesystem seed for pseudorandom
                    // numbers; crc is a convenient enough collector
                    self.seed = crc32(self.seed, &crc.to_le_bytes());

                    // update with what's been found so far
                    besttag = tempbesttag;
                    dir.off = off + tag.dsize();
                    dir.etag = ptag;
                    dir.count = tempcount;
                    dir.tail = temptail;
                    dir.split = tempsplit;

                    crc = 0xffff_ffff;
                    continue;
                }

                // crc the entry first, hopefully leaving it in the cache
                for j in 4..tag.dsize() {
                    let mut byte = [0_u8; 1];
                    match bd::read(
                        &mut self.dev,
                        &self.geo,
                        None,
                        &mut self.rcache,
                        self.geo.block_size,
                        dir.pair[0],
                        off + j,
                        &mut byte,
                    ) {
                        Ok(()) => crc = crc32(crc, &byte),
                        Err(FlintError::Corrupt) => {
                            // without a valid closing crc this commit is
                            // discarded anyway
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }

                // directory modification tags?
                if tag.type1() == ttype::NAME {
                    if tag.id() >= tempcount {
                        tempcount = tag.id() + 1;
                    }
                } else if tag.type1() == ttype::SPLICE {
                    tempcount = tempcount.wrapping_add_signed(i16::from(tag.splice()));

                    if tag.0 == Tag::new(ttype::DELETE, 0, 0).0 | (tempbesttag & 0x000f_fc00) {
                        tempbesttag |= 0x8000_0000;
                    } else if tempbesttag != u32::MAX && tag.id() <= Tag(tempbesttag).id() {
                        tempbesttag = Tag(tempbesttag)
                            .wrapping_add(Tag::id_delta(i32::from(tag.splice())))
                            .0;
                    }
                } else if tag.type1() == ttype::TAIL {
                    tempsplit = tag.chunk() & 1 != 0;

                    let mut words = [0_u8; 16];
                    match bd::read(
                        &mut self.dev,
                        &self.geo,
                        None,
                        &mut self.rcache,
                        self.geo.block_size,
                        dir.pair[0],
                        off + 4,
                        &mut words,
                    ) {
                        Ok(()) => temptail = pair_from_bytes(&words),
                        Err(FlintError::Corrupt) => {
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }

                // found a match for our fetcher?
                if fmask.and(tag) == fmask.and(ftag) {
                    match self.fetch_match_cb(matcher, tag, dir.pair[0], off + 4) {
                        Ok(std::cmp::Ordering::Equal) => {
                            // found a match
                            tempbesttag = tag.0;
                        }
                        Ok(res) => {
                            let unique = Tag::new(ttype::MOVESTATE, ID_NONE, 0);
                            if unique.and(tag) == unique.and(Tag(tempbesttag)) {
                                // an identical tag whose contents didn't
                                // match: our best match has been overwritten
                                tempbesttag = u32::MAX;
                            } else if res == std::cmp::Ordering::Greater
                                && tag.id() <= Tag(tempbesttag).id()
                            {
                                // a greater match; track it to keep the
                                // insertion point sorted
                                tempbesttag = tag.0 | 0x8000_0000;
                            }
                        }
                        Err(FlintError::Corrupt) => {
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            // consider what we have good enough
            if dir.off > 0 {
                // synthetic move: hide the entry a pending move claims
                if self.gdisk.has_move_here(&dir.pair) {
                    if self.gdisk.tag.id() == Tag(besttag).id() {
                        besttag |= 0x8000_0000;
                    } else if besttag != u32::MAX && self.gdisk.tag.id() < Tag(besttag).id() {
                        besttag = Tag(besttag).wrapping_sub(Tag::new(0, 1, 0)).0;
                    }
                }

                let id_hint = Tag(besttag).id().min(dir.count);
                let found = if Tag(besttag).is_valid() {
                    FetchFound::Found(Tag(besttag))
                } else if Tag(besttag).id() < dir.count {
                    FetchFound::Deleted
                } else {
                    FetchFound::None
                };
                return Ok((dir, found, id_hint));
            }

            // failed; try the other block?
            dir.pair.swap(0, 1);
            dir.rev = revs[(r + 1) % 2];
        }

        if !pair_is_null(&self.root) {
            error!(
                target: "flint::mdir",
                pair0 = dir.pair[0],
                pair1 = dir.pair[1],
                "corrupted dir pair"
            );
        }

        Err(FlintError::Corrupt)
    }

    fn fetch_match_cb(
        &mut self,
        matcher: &Matcher<'_>,
        tag: Tag,
        block: BlockId,
        off: u64,
    ) -> Result<std::cmp::Ordering> {
        match matcher {
            Matcher::None => Ok(std::cmp::Ordering::Equal),
            Matcher::Name(name) => {
                // compare against the stored name
                let diff = (name.len() as u64).min(tag.size()) as usize;
                let res = bd::cmp(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    diff as u64,
                    block,
                    off,
                    &name[..diff],
                )?;
                if res != std::cmp::Ordering::Equal {
                    return Ok(res);
                }

                // only equal if the sizes match too
                if name.len() as u64 != tag.size() {
                    return Ok(if (name.len() as u64) < tag.size() {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    });
                }

                Ok(std::cmp::Ordering::Equal)
            }
            Matcher::ParentOf(target) => {
                let mut words = [0_u8; 16];
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    Some(&self.pcache),
                    &mut self.rcache,
                    self.geo.block_size,
                    block,
                    off,
                    &mut words,
                )?;
                let child = pair_from_bytes(&words);

                Ok(if flint_types::pair_overlap(&child, target) {
                    std::cmp::Ordering::Equal
                } else {
                    std::cmp::Ordering::Less
                })
            }
        }
    }

    /// Backward-scanning lookup of the most recent tag matching
    /// `(gmask, gtag)`, copying `buf.len()` payload bytes starting at `goff`
    /// (zero-padded past the stored size).
    pub(crate) fn dir_get_slice(
        &mut self,
        dir: &MetaDir,
        gmask: Tag,
        gtag: Tag,
        goff: u64,
        buf: &mut [u8],
    ) -> Result<Tag> {
        let mut off = dir.off;
        let mut ntag = dir.etag;
        let mut gdiff = Tag::NOOP;

        if self.gdisk.has_move_here(&dir.pair)
            && gmask.id() != 0
            && self.gdisk.tag.id() <= gtag.id()
        {
            // synthetic move
            gdiff = gdiff.wrapping_sub(Tag::new(0, 1, 0));
        }

        // iterate over the log backward for faster lookups of recent tags
        while off >= 4 + ntag.dsize() {
            off -= ntag.dsize();
            let tag = ntag;

            let mut raw = [0_u8; 4];
            bd::read(
                &mut self.dev,
                &self.geo,
                None,
                &mut self.rcache,
                4,
                dir.pair[0],
                off,
                &mut raw,
            )?;
            ntag = Tag(Tag::from_be_bytes(raw).xor(tag).0 & 0x7fff_ffff);

            if gmask.id() != 0
                && tag.type1() == ttype::SPLICE
                && tag.id() <= gtag.wrapping_sub(gdiff).id()
            {
                if tag.0
                    == Tag::new(ttype::CREATE, 0, 0).0
                        | (Tag::new(0, 0x3ff, 0).0 & gtag.wrapping_sub(gdiff).0)
                {
                    // found where the entry was created
                    return Err(FlintError::NoEnt);
                }

                // move the query around splices
                gdiff = gdiff.wrapping_add(Tag::id_delta(i32::from(tag.splice())));
            }

            if gmask.and(tag) == gmask.and(gtag.wrapping_sub(gdiff)) {
                if tag.is_delete() {
                    return Err(FlintError::NoEnt);
                }

                let diff = tag.size().min(buf.len() as u64) as usize;
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    diff as u64,
                    dir.pair[0],
                    off + 4 + goff,
                    &mut buf[..diff],
                )?;
                buf[diff..].fill(0);

                return Ok(tag.wrapping_add(gdiff));
            }
        }

        Err(FlintError::NoEnt)
    }

    /// Lookup with the payload copied from offset zero.
    pub(crate) fn dir_get(
        &mut self,
        dir: &MetaDir,
        gmask: Tag,
        gtag: Tag,
        buf: &mut [u8],
    ) -> Result<Tag> {
        self.dir_get_slice(dir, gmask, gtag, 0, buf)
    }

    /// Cached read out of an inline entry's payload, mirroring the shape of
    /// the block-device read path with the entry standing in for a block.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dir_get_read(
        &mut self,
        dir: &MetaDir,
        pcache: Option<&Cache>,
        rcache: &mut Cache,
        hint: u64,
        gmask: Tag,
        gtag: Tag,
        off: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if off + buf.len() as u64 > self.geo.block_size {
            return Err(FlintError::Corrupt);
        }

        let mut off = off;
        let mut buf = buf;

        while !buf.is_empty() {
            let mut diff = buf.len() as u64;

            if let Some(pcache) = pcache {
                if pcache.block == flint_types::BLOCK_INLINE && off < pcache.off + pcache.size {
                    if off >= pcache.off {
                        let diff = diff.min(pcache.size - (off - pcache.off)) as usize;
                        let start = (off - pcache.off) as usize;
                        buf[..diff].copy_from_slice(&pcache.buffer[start..start + diff]);

                        off += diff as u64;
                        buf = &mut buf[diff..];
                        continue;
                    }

                    diff = diff.min(pcache.off - off);
                }
            }

            if rcache.block == flint_types::BLOCK_INLINE && off < rcache.off + rcache.size {
                if off >= rcache.off {
                    let diff = diff.min(rcache.size - (off - rcache.off)) as usize;
                    let start = (off - rcache.off) as usize;
                    buf[..diff].copy_from_slice(&rcache.buffer[start..start + diff]);

                    off += diff as u64;
                    buf = &mut buf[diff..];
                    continue;
                }

                diff = diff.min(rcache.off - off);
            }

            // load into the cache; after this the first condition can no
            // longer fail
            rcache.block = flint_types::BLOCK_INLINE;
            rcache.off = flint_types::align_down(off, self.geo.read_size);
            rcache.size = flint_types::align_up(off + hint, self.geo.read_size)
                .min(self.geo.cache_size);

            let size = rcache.size as usize;
            let roff = rcache.off;
            self.dir_get_slice(dir, gmask, gtag, roff, &mut rcache.buffer[..size])?;
        }

        Ok(())
    }

    /// XOR any movestate recorded in this pair into `gstate`.
    pub(crate) fn dir_get_gstate(&mut self, dir: &MetaDir, gstate: &mut GState) -> Result<()> {
        let mut buf = [0_u8; GState::DISK_SIZE];
        match self.dir_get(
            dir,
            Tag::new(ttype::MOVESTATE, 0, 0),
            Tag::new(ttype::MOVESTATE, 0, GState::DISK_SIZE as u32),
            &mut buf,
        ) {
            Ok(_) => {
                gstate.xor(&GState::from_bytes(&buf));
                Ok(())
            }
            Err(FlintError::NoEnt) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Info about entry `id` in this pair.
    pub(crate) fn dir_get_info(&mut self, dir: &MetaDir, id: u16) -> Result<EntryInfo> {
        if id == ID_NONE {
            // special case for the root
            return Ok(EntryInfo {
                kind: EntryKind::Dir,
                size: 0,
                name: "/".to_owned(),
            });
        }

        let mut name = vec![0_u8; (self.name_max + 1) as usize];
        let tag = self.dir_get(
            dir,
            Tag::new(0x780, 0x3ff, 0),
            Tag::new(ttype::NAME, id, (self.name_max + 1) as u32),
            &mut name,
        )?;

        let kind = match tag.type3() {
            ttype::REG => EntryKind::File,
            ttype::DIR => EntryKind::Dir,
            _ => return Err(FlintError::Corrupt),
        };
        let name = String::from_utf8_lossy(&name[..tag.size() as usize]).into_owned();

        let mut st = [0_u8; flint_types::Ctz::DISK_SIZE];
        let tag = self.dir_get(
            dir,
            Tag::new(ttype::GLOBALS, 0x3ff, 0),
            Tag::new(ttype::STRUCT, id, flint_types::Ctz::DISK_SIZE as u32),
            &mut st,
        )?;

        let size = if tag.type3() == ttype::CTZSTRUCT {
            flint_types::Ctz::from_bytes(&st).size
        } else if tag.type3() == ttype::INLINESTRUCT {
            // inline: the tag's size field is the file size
            tag.size()
        } else {
            // directories have no meaningful size
            0
        };

        Ok(EntryInfo { kind, size, name })
    }
}
