//! CTZ skip-list: the copy-on-write layout for file data.
//!
//! Block `n` of a file (counting from 1) starts with `ctz(n) + 1` back
//! pointers to blocks `n-1, n-2, n-4, …, n-2^k`, giving O(log n) random
//! access and O(1) amortized append under copy-on-write. The head pointer
//! and size stored in the directory identify the whole list.

use crate::handles::FileNode;
use crate::Fs;
use flint_block::{self as bd, BlockDevice, Cache};
use flint_error::{FlintError, Result};
use flint_types::{ceil_log2, BlockId, BLOCK_NULL, PTR_SIZE};
use tracing::debug;

fn popc(x: u64) -> u64 {
    u64::from(x.count_ones())
}

/// Map a byte offset to its block index, leaving the in-block offset in
/// `off`. Solves `pos = b·i + 8·(popcount(i) + k)` in closed form, where
/// `b` is the per-block payload capacity and `k` accounts for the skip
/// pointers at the head of block `i`.
fn block_index(block_size: u64, off: &mut u64) -> u64 {
    let size = *off;
    let b = block_size - 2 * PTR_SIZE;
    let mut i = size / b;
    if i == 0 {
        return 0;
    }

    i = (size - PTR_SIZE * (popc(i - 1) + 2)) / b;
    *off = size - b * i - PTR_SIZE * popc(i);
    i
}

impl<D: BlockDevice> Fs<D> {
    pub(crate) fn ctz_index(&self, off: &mut u64) -> u64 {
        block_index(self.geo.block_size, off)
    }

    /// Locate the block and in-block offset holding byte `pos`.
    ///
    /// Walks from the last block toward the target, each hop taking the
    /// largest skip pointer that does not overshoot.
    pub(crate) fn ctz_find(
        &mut self,
        rcache: &mut Cache,
        head: BlockId,
        size: u64,
        pos: u64,
    ) -> Result<(BlockId, u64)> {
        if size == 0 {
            return Ok((BLOCK_NULL, 0));
        }

        let mut noff = size - 1;
        let mut current = self.ctz_index(&mut noff);
        let mut target_off = pos;
        let target = self.ctz_index(&mut target_off);

        let mut head = head;
        while current > target {
            let skip = u64::from(ceil_log2(current - target + 1) - 1)
                .min(u64::from(head_ctz(current)));

            let mut word = [0_u8; 8];
            bd::read(
                &mut self.dev,
                &self.geo,
                None,
                rcache,
                8,
                head,
                PTR_SIZE * skip,
                &mut word,
            )?;
            head = u64::from_le_bytes(word);

            current -= 1 << skip;
        }

        Ok((head, target_off))
    }

    /// Append a block to the list, returning where writing continues.
    ///
    /// If the previous block is incomplete its contents are copied forward
    /// byte by byte (copy-on-write); otherwise a fresh block is started and
    /// its skip pointers are seeded from the old head. Bad blocks are
    /// retried on a fresh allocation.
    pub(crate) fn ctz_extend(
        &mut self,
        file: &mut FileNode,
        head: BlockId,
        size: u64,
    ) -> Result<(BlockId, u64)> {
        loop {
            // go ahead and grab a block
            let nblock = self.alloc(&[&*file])?;

            if let Some(found) = self.ctz_extend_into(file, head, size, nblock)? {
                return Ok(found);
            }

            debug!(target: "flint::ctz", block = nblock, "bad block");
            // just clear the write cache and try a new block
            file.cache.discard();
        }
    }

    /// `Ok(None)` means the target block went bad mid-write and the caller
    /// should retry on a fresh one; read failures propagate as errors.
    fn ctz_extend_into(
        &mut self,
        file: &mut FileNode,
        head: BlockId,
        size: u64,
        nblock: BlockId,
    ) -> Result<Option<(BlockId, u64)>> {
        match bd::erase(&mut self.dev, &self.geo, nblock) {
            Ok(()) => {}
            Err(FlintError::Corrupt) => return Ok(None),
            Err(err) => return Err(err),
        }

        if size == 0 {
            return Ok(Some((nblock, 0)));
        }

        let mut noff = size - 1;
        let index = self.ctz_index(&mut noff);
        let noff = noff + 1;

        // just copy out the last block if it is incomplete
        if noff != self.geo.block_size {
            for i in 0..noff {
                let mut byte = [0_u8; 1];
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    noff - i,
                    head,
                    i,
                    &mut byte,
                )?;
                match bd::write(
                    &mut self.dev,
                    &self.geo,
                    &mut file.cache,
                    &mut self.rcache,
                    true,
                    nblock,
                    i,
                    &byte,
                ) {
                    Ok(()) => {}
                    Err(FlintError::Corrupt) => return Ok(None),
                    Err(err) => return Err(err),
                }
            }

            return Ok(Some((nblock, noff)));
        }

        // append a fresh block: seed its skip pointers from the old head
        let index = index + 1;
        let skips = u64::from(head_ctz(index)) + 1;
        let mut nhead = head;

        for i in 0..skips {
            match bd::write(
                &mut self.dev,
                &self.geo,
                &mut file.cache,
                &mut self.rcache,
                true,
                nblock,
                PTR_SIZE * i,
                &nhead.to_le_bytes(),
            ) {
                Ok(()) => {}
                Err(FlintError::Corrupt) => return Ok(None),
                Err(err) => return Err(err),
            }

            if i != skips - 1 {
                let mut word = [0_u8; 8];
                bd::read(
                    &mut self.dev,
                    &self.geo,
                    None,
                    &mut self.rcache,
                    8,
                    nhead,
                    PTR_SIZE * i,
                    &mut word,
                )?;
                nhead = u64::from_le_bytes(word);
            }
        }

        Ok(Some((nblock, PTR_SIZE * skips)))
    }

    /// Visit every block of the list exactly once, newest first.
    pub(crate) fn ctz_traverse(
        &mut self,
        pcache: Option<&Cache>,
        head: BlockId,
        size: u64,
        cb: &mut dyn FnMut(BlockId) -> Result<()>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let mut noff = size - 1;
        let mut index = self.ctz_index(&mut noff);
        let mut head = head;

        loop {
            cb(head)?;

            if index == 0 {
                return Ok(());
            }

            // pairs of pointers can be read together while index is even
            let count = 2 - (index & 1);
            let mut words = [0_u8; 16];
            bd::read(
                &mut self.dev,
                &self.geo,
                pcache,
                &mut self.rcache,
                count * 8,
                head,
                0,
                &mut words[..(count * 8) as usize],
            )?;

            let mut word = [0_u8; 8];
            word.copy_from_slice(&words[..8]);
            let first = u64::from_le_bytes(word);
            cb(first)?;

            head = if count == 2 {
                word.copy_from_slice(&words[8..16]);
                u64::from_le_bytes(word)
            } else {
                first
            };
            index -= count;
        }
    }
}

/// Trailing zeros of a block index; the number of extra skip pointers the
/// block carries.
fn head_ctz(index: u64) -> u32 {
    index.trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_block_has_no_pointers() {
        // block 0 carries no skip pointers, so offsets map straight through
        for pos in [0_u64, 1, 40, 63] {
            let mut off = pos;
            assert_eq!(block_index(64, &mut off), 0);
            assert_eq!(off, pos);
        }
    }

    #[test]
    fn index_accounts_for_skip_pointers() {
        // with 64-byte blocks the payload stride is 48; block n >= 1 starts
        // its data after ctz(n)+1 pointers of 8 bytes each
        let mut off = 64;
        assert_eq!(block_index(64, &mut off), 1);
        assert_eq!(off, 8); // one pointer

        let mut off = 120;
        assert_eq!(block_index(64, &mut off), 2);
        assert_eq!(off, 16); // two pointers

        let mut off = 119;
        assert_eq!(block_index(64, &mut off), 1);
        assert_eq!(off, 63); // last byte of block 1
    }

    #[test]
    fn index_is_contiguous() {
        // walking byte positions never skips or repeats a slot: each block's
        // data region starts right after its pointers and runs to the end
        let bs = 128_u64;
        let mut prev_index = 0_u64;
        let mut prev_off = 0_u64;
        for pos in 1..10_000_u64 {
            let mut off = pos;
            let index = block_index(bs, &mut off);
            if index == prev_index {
                assert_eq!(off, prev_off + 1, "hole within block at pos {pos}");
            } else {
                assert_eq!(index, prev_index + 1, "skipped a block at pos {pos}");
                assert_eq!(prev_off, bs - 1, "previous block not full at pos {pos}");
                assert_eq!(
                    off,
                    PTR_SIZE * (u64::from(head_ctz(index)) + 1),
                    "data must start after the skip pointers at pos {pos}"
                );
            }
            prev_index = index;
            prev_off = off;
        }
    }
}
