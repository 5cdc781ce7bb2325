//! Path resolution.
//!
//! Paths are tokenized by `/` with `.` and `..` collapsed textually against
//! the already-consumed prefix, so `foo/../bar` resolves as `bar` without
//! touching the disk. Each remaining component is matched against the name
//! tags of its directory, following hard-tails across split pairs.

use crate::mdir::{FetchFound, Matcher, MetaDir};
use crate::Fs;
use flint_block::BlockDevice;
use flint_error::{FlintError, Result};
use flint_types::{pair_from_bytes, ttype, Tag, ID_NONE};

/// Outcome of resolving a path.
pub(crate) struct PathTarget<'p> {
    /// Name tag of the final component; `None` if it does not exist (but
    /// its parent does, fetched into the caller's dir).
    pub tag: Option<Tag>,
    /// Id of the final component in its pair, or the id where it would be
    /// inserted; `ID_NONE` when the target is the root.
    pub id: u16,
    /// The final component's name.
    pub name: &'p str,
}

impl<D: BlockDevice> Fs<D> {
    /// Resolve `path` starting at the root, leaving the containing pair in
    /// `dir`.
    ///
    /// A missing final component is not an error: the parent is fetched,
    /// `id` is the insertion point, and `tag` is `None` so creation can
    /// proceed. A missing intermediate component is `NoEnt`.
    pub(crate) fn dir_find<'p>(
        &mut self,
        dir: &mut MetaDir,
        path: &'p str,
    ) -> Result<PathTarget<'p>> {
        let mut name = path.as_bytes();
        let mut id = ID_NONE;
        let mut component: &[u8] = b"";

        // default to the root dir
        let mut tag = Tag::new(ttype::DIR, ID_NONE, 0);
        dir.tail = self.root;

        'next_name: loop {
            // skip slashes
            let lead = name.iter().take_while(|&&c| c == b'/').count();
            name = &name[lead..];
            let namelen = name
                .iter()
                .position(|&c| c == b'/')
                .unwrap_or(name.len());

            // skip '.' and root '..'
            if (namelen == 1 && name[0] == b'.') || (namelen == 2 && &name[..2] == b"..") {
                name = &name[namelen..];
                continue 'next_name;
            }

            // skip this name if a later '..' cancels it
            let mut suffix = &name[namelen..];
            let mut depth = 1_usize;
            loop {
                let lead = suffix.iter().take_while(|&&c| c == b'/').count();
                suffix = &suffix[lead..];
                let sufflen = suffix
                    .iter()
                    .position(|&c| c == b'/')
                    .unwrap_or(suffix.len());
                if sufflen == 0 {
                    break;
                }

                if sufflen == 2 && &suffix[..2] == b".." {
                    depth -= 1;
                    if depth == 0 {
                        name = &suffix[sufflen..];
                        continue 'next_name;
                    }
                } else {
                    depth += 1;
                }

                suffix = &suffix[sufflen..];
            }

            // found the end of the path
            if name.is_empty() {
                return Ok(PathTarget {
                    tag: Some(tag),
                    id,
                    name: bytes_as_str(component)?,
                });
            }

            // update what we've found so far
            component = &name[..namelen];
            let is_last = namelen == name.len();

            // only continue if we hit a directory
            if tag.type3() != ttype::DIR {
                return Err(FlintError::NotDir);
            }

            // grab the entry's child pair
            if tag.id() != ID_NONE {
                let mut bytes = [0_u8; 16];
                self.dir_get(
                    dir,
                    Tag::new(ttype::GLOBALS, ID_NONE, 0),
                    Tag::new(ttype::STRUCT, tag.id(), 16),
                    &mut bytes,
                )?;
                dir.tail = pair_from_bytes(&bytes);
            }

            // find the entry matching this name
            loop {
                let tail = dir.tail;
                let (ndir, found, hint) = self.dir_fetch_match(
                    &tail,
                    Tag::new(0x780, 0, 0),
                    Tag::new(ttype::NAME, 0, namelen as u32),
                    &Matcher::Name(component),
                )?;
                *dir = ndir;
                if is_last {
                    id = hint;
                }

                match found {
                    FetchFound::Found(t) => {
                        tag = t;
                        break;
                    }
                    FetchFound::Deleted => {
                        // the best match was deleted by a later splice
                        return if is_last {
                            Ok(PathTarget {
                                tag: None,
                                id,
                                name: bytes_as_str(component)?,
                            })
                        } else {
                            Err(FlintError::NoEnt)
                        };
                    }
                    FetchFound::None => {
                        if !dir.split {
                            return if is_last {
                                Ok(PathTarget {
                                    tag: None,
                                    id,
                                    name: bytes_as_str(component)?,
                                })
                            } else {
                                Err(FlintError::NoEnt)
                            };
                        }
                        // keep walking the hard-tail chain
                    }
                }
            }

            // to the next name
            name = &name[namelen..];
        }
    }
}

fn bytes_as_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| FlintError::Inval)
}
