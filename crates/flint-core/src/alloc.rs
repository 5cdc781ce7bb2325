//! Block allocator.
//!
//! A rolling lookahead window over the block address space, stored as a
//! bitmap with one bit per block. The window is replenished by traversing
//! the whole filesystem and marking every reachable block; anything left
//! unmarked is free. The `ack` counter tracks how many blocks have been
//! examined since the last commit acknowledged the in-flight allocations;
//! when it hits zero every block has been looked at and the device is full
//! (or the host grants a grow).

use crate::handles::FileNode;
use crate::Fs;
use flint_block::BlockDevice;
use flint_error::{FlintError, Result};
use flint_types::BlockId;
use tracing::error;

#[derive(Debug)]
pub(crate) struct Lookahead {
    /// Block the window starts at.
    pub off: BlockId,
    /// Window size in bits.
    pub size: u64,
    /// Scan cursor within the window.
    pub i: u64,
    /// Blocks examined since the last ack.
    pub ack: u64,
    /// The bitmap, one bit per block, set = in use.
    pub window: Vec<u64>,
}

impl Lookahead {
    pub fn new(lookahead_size: u64) -> Self {
        Self {
            off: 0,
            size: 0,
            i: 0,
            ack: 0,
            window: vec![0; (lookahead_size / 8) as usize],
        }
    }

    /// Window capacity in bits.
    pub fn capacity(&self) -> u64 {
        self.window.len() as u64 * 64
    }

    pub fn is_set(&self, bit: u64) -> bool {
        self.window[(bit / 64) as usize] & (1_u64 << (bit % 64)) != 0
    }
}

/// Mark `block` used if it falls inside the window.
pub(crate) fn mark_used(
    window: &mut [u64],
    off: BlockId,
    size: u64,
    block_count: u64,
    block: BlockId,
) {
    let rel = block
        .wrapping_sub(off)
        .wrapping_add(block_count)
        % block_count;
    if rel < size {
        window[(rel / 64) as usize] |= 1_u64 << (rel % 64);
    }
}

impl<D: BlockDevice> Fs<D> {
    /// Allocated blocks have been committed into the filesystem; the
    /// traversal will find them, so the window may scan past them again.
    pub(crate) fn alloc_ack(&mut self) {
        self.free.ack = self.geo.block_count;
    }

    /// Invalidate the window. Done at mount and after failed traversals so a
    /// stale bitmap can never satisfy an allocation.
    pub(crate) fn alloc_drop(&mut self) {
        self.free.size = 0;
        self.free.i = 0;
        self.alloc_ack();
    }

    /// Hand out one free block.
    ///
    /// `actives` are open files currently checked out of the handle
    /// registry; their in-flight data blocks must stay visible to the
    /// replenishing traversal.
    pub(crate) fn alloc(&mut self, actives: &[&FileNode]) -> Result<BlockId> {
        loop {
            while self.free.i != self.free.size {
                let bit = self.free.i;
                self.free.i += 1;
                self.free.ack -= 1;

                if !self.free.is_set(bit) {
                    // found a free block
                    let block = (self.free.off + bit) % self.geo.block_count;

                    // eagerly find the next free bit so an ack can discredit
                    // the old window
                    while self.free.i != self.free.size && self.free.is_set(self.free.i) {
                        self.free.i += 1;
                        self.free.ack -= 1;
                    }

                    return Ok(block);
                }
            }

            // have we looked at every block since the last ack?
            if self.free.ack == 0 {
                match self.dev.extend(self.geo.block_count) {
                    Ok(new_count) => {
                        self.fs_grow_raw(new_count, actives)?;
                        self.alloc_ack();
                        continue;
                    }
                    Err(_) => {
                        error!(
                            target: "flint::alloc",
                            block = self.free.i + self.free.off,
                            "no more free space"
                        );
                        return Err(FlintError::NoSpace);
                    }
                }
            }

            // advance the window and repopulate from the tree
            self.free.off = (self.free.off + self.free.size) % self.geo.block_count;
            self.free.size = (self.cfg.lookahead_size * 8).min(self.free.ack);
            self.free.i = 0;

            let mut window = std::mem::take(&mut self.free.window);
            window.fill(0);
            let (off, size, block_count) = (self.free.off, self.free.size, self.geo.block_count);

            let res = self.fs_traverse_raw(
                &mut |block| {
                    mark_used(&mut window, off, size, block_count, block);
                    Ok(())
                },
                true,
                actives,
            );
            self.free.window = window;

            if let Err(err) = res {
                self.alloc_drop();
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_wraps_around_window_origin() {
        let mut window = vec![0_u64; 2];
        // window of 8 bits starting at block 6 on a 10-block device
        mark_used(&mut window, 6, 8, 10, 7);
        mark_used(&mut window, 6, 8, 10, 1); // wraps: (1 - 6 + 10) % 10 = 5
        assert_eq!(window[0] & (1 << 1), 1 << 1);
        assert_eq!(window[0] & (1 << 5), 1 << 5);
        // outside the window: ignored
        mark_used(&mut window, 6, 2, 10, 3);
        assert_eq!(window[0] & !(0b10_0010), 0);
    }

    #[test]
    fn lookahead_capacity_counts_bits() {
        let free = Lookahead::new(16);
        assert_eq!(free.capacity(), 128);
    }
}
