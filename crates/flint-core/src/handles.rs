//! Registry of open file and directory handles.
//!
//! The filesystem owns every open handle; public handles are opaque slots
//! into this registry. Commit paths walk the registry to patch entry ids and
//! pair addresses when splices, splits and relocations move things underneath
//! open handles. Short-lived scratch entries let multi-commit operations
//! (remove, rename, mkdir) expose an interior metadata copy to that same
//! patch-up machinery.

use crate::{OpenAttr, mdir::MetaDir};
use flint_block::Cache;
use flint_error::{FlintError, Result};
use flint_types::{BlockId, BlockPair, Ctz};

/// Handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub(crate) usize);

/// Handle to an open directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHandle(pub(crate) usize);

/// One open file.
#[derive(Debug)]
pub(crate) struct FileNode {
    pub id: u16,
    pub mdir: MetaDir,
    pub ctz: Ctz,
    pub flags: u32,
    pub pos: u64,
    pub block: BlockId,
    pub off: u64,
    pub cache: Cache,
    pub attrs: Vec<OpenAttr>,
}

/// One open directory iterator.
#[derive(Debug)]
pub(crate) struct DirNode {
    pub id: u16,
    pub mdir: MetaDir,
    /// First pair of the directory, for rewinds.
    pub head: BlockPair,
    pub pos: u64,
}

/// Interior metadata pinned during a multi-commit operation.
#[derive(Debug)]
pub(crate) struct ScratchNode {
    pub id: u16,
    pub mdir: MetaDir,
}

#[derive(Debug)]
pub(crate) enum Node {
    File(FileNode),
    Dir(DirNode),
    Scratch(ScratchNode),
}

impl Node {
    pub fn id(&self) -> u16 {
        match self {
            Node::File(f) => f.id,
            Node::Dir(d) => d.id,
            Node::Scratch(s) => s.id,
        }
    }

    pub fn id_mut(&mut self) -> &mut u16 {
        match self {
            Node::File(f) => &mut f.id,
            Node::Dir(d) => &mut d.id,
            Node::Scratch(s) => &mut s.id,
        }
    }

    pub fn mdir(&self) -> &MetaDir {
        match self {
            Node::File(f) => &f.mdir,
            Node::Dir(d) => &d.mdir,
            Node::Scratch(s) => &s.mdir,
        }
    }

    pub fn mdir_mut(&mut self) -> &mut MetaDir {
        match self {
            Node::File(f) => &mut f.mdir,
            Node::Dir(d) => &mut d.mdir,
            Node::Scratch(s) => &mut s.mdir,
        }
    }
}

/// Slab of open handles. Slots keep their index for the handle's lifetime;
/// a slot is `None` while its node is checked out for an operation.
#[derive(Debug, Default)]
pub(crate) struct Handles {
    slots: Vec<Option<Node>>,
}

impl Handles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> usize {
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    /// Check a node out of its slot; the slot stays reserved until `put` or
    /// `release`.
    pub fn take(&mut self, idx: usize) -> Option<Node> {
        self.slots.get_mut(idx).and_then(Option::take)
    }

    pub fn put(&mut self, idx: usize, node: Node) {
        debug_assert!(self.slots[idx].is_none());
        self.slots[idx] = Some(node);
    }

    /// Free the slot entirely.
    pub fn release(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = None;
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, idx: usize) -> Option<&Node> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Check a file node out, failing on a dangling or non-file handle.
    pub fn take_file(&mut self, handle: FileHandle) -> Result<FileNode> {
        match self.take(handle.0) {
            Some(Node::File(file)) => Ok(file),
            Some(other) => {
                self.put(handle.0, other);
                Err(FlintError::BadFd)
            }
            None => Err(FlintError::BadFd),
        }
    }

    pub fn put_file(&mut self, handle: FileHandle, file: FileNode) {
        self.put(handle.0, Node::File(file));
    }

    pub fn take_dir(&mut self, handle: DirHandle) -> Result<DirNode> {
        match self.take(handle.0) {
            Some(Node::Dir(dir)) => Ok(dir),
            Some(other) => {
                self.put(handle.0, other);
                Err(FlintError::BadFd)
            }
            None => Err(FlintError::BadFd),
        }
    }

    pub fn put_dir(&mut self, handle: DirHandle, dir: DirNode) {
        self.put(handle.0, Node::Dir(dir));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(id: u16) -> Node {
        Node::Scratch(ScratchNode {
            id,
            mdir: MetaDir::default(),
        })
    }

    #[test]
    fn slots_are_stable_across_checkout() {
        let mut h = Handles::new();
        let a = h.insert(scratch(1));
        let b = h.insert(scratch(2));
        assert_ne!(a, b);

        let node = h.take(a).unwrap();
        assert_eq!(node.id(), 1);
        // slot stays reserved while checked out
        let c = h.insert(scratch(3));
        assert_ne!(c, a);
        h.put(a, node);
        assert_eq!(h.get(a).unwrap().id(), 1);
    }

    #[test]
    fn release_frees_and_trims() {
        let mut h = Handles::new();
        let a = h.insert(scratch(1));
        let b = h.insert(scratch(2));
        h.release(b);
        assert_eq!(h.len(), 1);
        h.release(a);
        assert_eq!(h.len(), 0);
    }

    #[test]
    fn take_file_rejects_wrong_kind() {
        let mut h = Handles::new();
        let idx = h.insert(scratch(0));
        assert_eq!(
            h.take_file(FileHandle(idx)).unwrap_err(),
            FlintError::BadFd
        );
        // node went back after the failed checkout
        assert!(h.get(idx).is_some());
        assert_eq!(h.take_file(FileHandle(99)).unwrap_err(), FlintError::BadFd);
    }
}
