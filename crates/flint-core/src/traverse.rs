//! Bounded-depth traversal over a metadata log plus pending attributes.
//!
//! Compaction, size estimation and commit appends all iterate "the logical
//! contents of this pair plus these new attributes" in order. Three
//! traversals can nest: a commit traverse may expand a move (replaying the
//! source entry's tags), and any candidate tag is checked for staleness by a
//! filter scan over the remainder of the log. The recursion is bounded at
//! that depth, so it runs on an explicit two-frame stack.
//!
//! The filter shortcut on moves matters: filtering the tags a move expands
//! to would spawn a second level of filtering, and duplicate tags are
//! idempotent under filtering anyway. Skipping it bounds rename at O(n²)
//! instead of O(n³).

use crate::commit::Commit;
use crate::mdir::MetaDir;
use crate::{Fs, OpenAttr};
use flint_block::{self as bd, BlockDevice};
use flint_error::Result;
use flint_types::{ttype, BlockId, Tag};

/// One attribute staged for commit.
#[derive(Clone, Copy)]
pub(crate) struct Attr<'a> {
    pub tag: Tag,
    pub payload: Payload<'a>,
}

impl<'a> Attr<'a> {
    pub fn new(tag: Tag, payload: Payload<'a>) -> Self {
        Self { tag, payload }
    }
}

/// Where an attribute's payload lives.
#[derive(Clone, Copy)]
pub(crate) enum Payload<'a> {
    None,
    Bytes(&'a [u8]),
    /// Source pair of a move; traversal expands this into the entry's tags.
    Move(&'a MetaDir),
    /// Batch of per-file user attributes committed with a sync.
    UserAttrs(&'a [OpenAttr]),
}

impl<'a> Payload<'a> {
    fn as_source(self) -> Source<'a> {
        match self {
            Payload::None => Source::None,
            Payload::Bytes(bytes) => Source::Bytes(bytes),
            Payload::Move(dir) => Source::Move(dir),
            Payload::UserAttrs(attrs) => Source::UserAttrs(attrs),
        }
    }
}

/// Payload handed to the visitor: either in memory or still on disk.
#[derive(Clone, Copy)]
pub(crate) enum Source<'a> {
    None,
    Bytes(&'a [u8]),
    Disk { block: BlockId, off: u64 },
    Move(&'a MetaDir),
    UserAttrs(&'a [OpenAttr]),
}

/// What to do with each surviving tag.
pub(crate) enum Visit<'v> {
    /// Accumulate on-disk footprint.
    Size(&'v mut u64),
    /// Append to an open commit.
    Commit(&'v mut Commit),
}

/// Running state of one traversal level.
#[derive(Clone, Copy)]
struct TState<'a> {
    dir: &'a MetaDir,
    off: u64,
    ptag: Tag,
    attrs: &'a [Attr<'a>],
    tmask: Tag,
    ttag: Tag,
    begin: u16,
    end: u16,
    diff: i32,
    filtering: bool,
}

struct TFrame<'a> {
    st: TState<'a>,
    tag: Tag,
    source: Source<'a>,
}

impl<D: BlockDevice> Fs<D> {
    /// Walk the log of `dir` starting after `(off, ptag)`, then the pending
    /// `attrs`, delivering each tag that matches `(tmask, ttag)` — with its
    /// id shifted by `diff` and restricted to `[begin, end)` when the mask
    /// selects ids — to `visit`. Matching candidates are first checked
    /// against the remainder of the log so only the most recent version of
    /// each `(type, id)` survives.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dir_traverse<'a>(
        &mut self,
        dir: &'a MetaDir,
        off: u64,
        ptag: Tag,
        attrs: &'a [Attr<'a>],
        tmask: Tag,
        ttag: Tag,
        begin: u16,
        end: u16,
        diff: i32,
        visit: &mut Visit<'_>,
    ) -> Result<()> {
        let mut stack: Vec<TFrame<'a>> = Vec::with_capacity(2);
        let mut st = TState {
            dir,
            off,
            ptag,
            attrs,
            tmask,
            ttag,
            begin,
            end,
            diff,
            filtering: false,
        };
        let mut pending: Option<(Tag, Source<'a>)> = None;

        loop {
            let (tag, source, via_pop) = if let Some((tag, source)) = pending.take() {
                (tag, source, true)
            } else if st.off + st.ptag.dsize() < st.dir.off {
                // next tag from the log
                st.off += st.ptag.dsize();
                let mut raw = [0_u8; 4];
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    4,
                    st.dir.pair[0],
                    st.off,
                    &mut raw,
                )?;
                // the invalid bit doubles as the "payload is on disk" mark
                let tag = Tag::from_be_bytes(raw).xor(st.ptag).invalidate();
                let source = Source::Disk {
                    block: st.dir.pair[0],
                    off: st.off + 4,
                };
                st.ptag = tag;
                (tag, source, false)
            } else if let Some((first, rest)) = st.attrs.split_first() {
                st.attrs = rest;
                (first.tag, first.payload.as_source(), false)
            } else if let Some(frame) = stack.pop() {
                // finished this level; resume the saved candidate
                st = frame.st;
                pending = Some((frame.tag, frame.source));
                continue;
            } else {
                return Ok(());
            };

            if !via_pop {
                // type filter
                let mask = Tag::new(ttype::MOVESTATE, 0, 0);
                if mask.and(st.tmask).and(tag) != mask.and(st.tmask).and(st.ttag) {
                    continue;
                }

                if st.tmask.id() != 0 {
                    // scan ahead for duplicates and splices before letting
                    // this candidate through
                    stack.push(TFrame { st, tag, source });
                    st.tmask = Tag::NOOP;
                    st.ttag = Tag::NOOP;
                    st.begin = 0;
                    st.end = 0;
                    st.diff = 0;
                    st.filtering = true;
                    continue;
                }
            }

            // in the id range?
            if st.tmask.id() != 0 && !(tag.id() >= st.begin && tag.id() < st.end) {
                continue;
            }

            let type3 = tag.type3();
            if type3 == ttype::FROM_NOOP {
                // nothing to do
            } else if type3 == ttype::FROM_MOVE {
                if st.filtering {
                    // duplicate tags have no effect when filtering; skip the
                    // nested expansion
                    continue;
                }

                let Source::Move(source_dir) = source else {
                    continue;
                };

                let from_id = tag.size() as u16;
                let to_id = tag.id();
                stack.push(TFrame {
                    st,
                    tag: Tag::NOOP,
                    source: Source::None,
                });
                st = TState {
                    dir: source_dir,
                    off: 0,
                    ptag: Tag::INVALID,
                    attrs: &[],
                    tmask: Tag::new(ttype::TAIL, 0x3ff, 0),
                    ttag: Tag::new(ttype::STRUCT, 0, 0),
                    begin: from_id,
                    end: from_id + 1,
                    diff: i32::from(to_id) - i32::from(from_id) + st.diff,
                    filtering: st.filtering,
                };
            } else if type3 == ttype::FROM_USERATTRS {
                let Source::UserAttrs(list) = source else {
                    continue;
                };
                for a in list.iter().take(tag.size() as usize) {
                    let atag = Tag::new(
                        ttype::USERATTR + u16::from(a.atype),
                        shift_id(tag.id(), st.diff),
                        a.data.len() as u32,
                    );
                    if self.visit_one(visit, &mut stack, st.filtering, atag, Source::Bytes(&a.data))? {
                        break;
                    }
                }
            } else {
                let stop = self.visit_one(
                    visit,
                    &mut stack,
                    st.filtering,
                    tag.wrapping_add(Tag::id_delta(st.diff)),
                    source,
                )?;
                if stop {
                    if let Some(frame) = stack.pop() {
                        st = frame.st;
                        pending = Some((frame.tag, frame.source));
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Deliver one tag, either to the filter target on the stack or to the
    /// caller's visitor. Returns whether the current scan should stop.
    fn visit_one<'a>(
        &mut self,
        visit: &mut Visit<'_>,
        stack: &mut Vec<TFrame<'a>>,
        filtering: bool,
        tag: Tag,
        source: Source<'a>,
    ) -> Result<bool> {
        if filtering {
            let Some(frame) = stack.last_mut() else {
                return Ok(false);
            };
            return Ok(traverse_filter(&mut frame.tag, tag));
        }

        match visit {
            Visit::Size(total) => {
                **total += tag.dsize();
                Ok(false)
            }
            Visit::Commit(commit) => {
                self.commit_attr(commit, tag, source)?;
                Ok(false)
            }
        }
    }
}

/// Check `filtertag` (an older candidate) against `tag` (a newer record).
///
/// Clears the candidate to a no-op and stops the scan when the newer record
/// supersedes it; otherwise folds splice id shifts into the candidate.
pub(crate) fn traverse_filter(filtertag: &mut Tag, tag: Tag) -> bool {
    // which mask depends on the uniqueness bit of the type: types with the
    // 0x100 bit are unique per full type, the rest per broad type
    let mask = if tag.0 & Tag::new(ttype::FROM, 0, 0).0 != 0 {
        Tag::new(ttype::MOVESTATE, 0x3ff, 0)
    } else {
        Tag::new(ttype::GLOBALS, 0x3ff, 0)
    };

    // check for redundancy
    if mask.and(tag) == mask.and(*filtertag)
        || filtertag.is_delete()
        || Tag::new(ttype::MOVESTATE, 0x3ff, 0).and(tag).0
            == (Tag::new(ttype::DELETE, 0, 0).0 | (Tag::new(0, 0x3ff, 0).0 & filtertag.0))
    {
        *filtertag = Tag::NOOP;
        return true;
    }

    // adjust for created/deleted tags
    if tag.type1() == ttype::SPLICE && tag.id() <= filtertag.id() {
        *filtertag = filtertag.wrapping_add(Tag::id_delta(i32::from(tag.splice())));
    }

    false
}

fn shift_id(id: u16, diff: i32) -> u16 {
    (i32::from(id) + diff) as u16
}
