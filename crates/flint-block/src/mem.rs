//! In-memory block device for tests and simulations.

use crate::{BadBlocks, BlockDevice};
use flint_error::{FlintError, Result};
use flint_types::BlockId;

/// RAM-backed device addressing erase units of a fixed size.
///
/// Erased units read back as all-ones. Units can be marked bad (program and
/// erase report `Corrupt`) or silently corrupting (programs succeed but
/// flip a bit), and every program can be snapshotted to replay power-loss
/// scenarios: any snapshot is a valid "the power died here" image.
#[derive(Debug, Clone)]
pub struct MemDevice {
    erase_size: u64,
    data: Vec<u8>,
    bad: BadBlocks,
    silent: BadBlocks,
    grow_step: Option<u64>,
    record: bool,
    snapshots: Vec<Vec<u8>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(erase_size: u64, erase_count: u64) -> Self {
        Self {
            erase_size,
            data: vec![0xff; (erase_size * erase_count) as usize],
            bad: BadBlocks::new(),
            silent: BadBlocks::new(),
            grow_step: None,
            record: false,
            snapshots: Vec::new(),
        }
    }

    /// Rebuild a device from a snapshot image.
    #[must_use]
    pub fn from_image(erase_size: u64, image: Vec<u8>) -> Self {
        debug_assert_eq!(image.len() as u64 % erase_size, 0);
        Self {
            erase_size,
            data: image,
            bad: BadBlocks::new(),
            silent: BadBlocks::new(),
            grow_step: None,
            record: false,
            snapshots: Vec::new(),
        }
    }

    #[must_use]
    pub fn erase_count(&self) -> u64 {
        self.data.len() as u64 / self.erase_size
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Mark an erase unit bad: program and erase on it return `Corrupt`.
    pub fn set_bad(&mut self, unit: BlockId, bad: bool) {
        if bad {
            self.bad.insert(unit);
        } else {
            self.bad.remove(&unit);
        }
    }

    /// Make programs to a unit succeed but land corrupted, so only
    /// read-back validation can notice.
    pub fn set_silent_corruption(&mut self, unit: BlockId, on: bool) {
        if on {
            self.silent.insert(unit);
        } else {
            self.silent.remove(&unit);
        }
    }

    /// Allow `extend` to grow the device by `step` logical blocks per call.
    pub fn set_grow_step(&mut self, step: Option<u64>) {
        self.grow_step = step;
    }

    /// Record a full image after every successful program.
    pub fn record_snapshots(&mut self, on: bool) {
        self.record = on;
    }

    #[must_use]
    pub fn snapshots(&self) -> &[Vec<u8>] {
        &self.snapshots
    }

    pub fn take_snapshots(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.snapshots)
    }

    fn span(&self, unit: BlockId, off: u64, len: u64) -> Result<std::ops::Range<usize>> {
        let start = unit
            .checked_mul(self.erase_size)
            .and_then(|base| base.checked_add(off))
            .ok_or(FlintError::Io)?;
        let end = start.checked_add(len).ok_or(FlintError::Io)?;
        if off + len > self.erase_size || end as usize > self.data.len() {
            return Err(FlintError::Io);
        }
        Ok(start as usize..end as usize)
    }
}

impl BlockDevice for MemDevice {
    fn read(&mut self, unit: BlockId, off: u64, buf: &mut [u8]) -> Result<()> {
        let span = self.span(unit, off, buf.len() as u64)?;
        buf.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn program(&mut self, unit: BlockId, off: u64, data: &[u8]) -> Result<()> {
        if self.bad.contains(&unit) {
            return Err(FlintError::Corrupt);
        }
        let span = self.span(unit, off, data.len() as u64)?;
        self.data[span.clone()].copy_from_slice(data);
        if self.silent.contains(&unit) && !data.is_empty() {
            self.data[span.start] ^= 0x01;
        }
        if self.record {
            self.snapshots.push(self.data.clone());
        }
        Ok(())
    }

    fn erase(&mut self, unit: BlockId) -> Result<()> {
        if self.bad.contains(&unit) {
            return Err(FlintError::Corrupt);
        }
        let span = self.span(unit, 0, self.erase_size)?;
        self.data[span].fill(0xff);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn extend(&mut self, block_count: u64) -> Result<u64> {
        let Some(step) = self.grow_step else {
            return Err(FlintError::NoSpace);
        };
        // grow by whole logical blocks; the caller re-derives erase units
        let new_count = block_count + step;
        let per_block = self.data.len() as u64 / self.erase_size / block_count.max(1);
        let new_len = new_count * per_block * self.erase_size;
        self.data.resize(new_len as usize, 0xff);
        Ok(new_count)
    }
}
