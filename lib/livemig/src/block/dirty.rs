// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dirty tracking bitmaps.
//!
//! A [`DirtyBitmap`] records which regions of a block node were written,
//! one bit per `granularity` bytes.  All offsets and lengths in this module
//! are in 512-byte sectors.

use bitvec::prelude::*;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::block::BDRV_SECTOR_SIZE;

/// Smallest supported bitmap granularity, in bytes.
pub const MIN_GRANULARITY: u32 = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    #[error("granularity {0} is not a power of two of at least 512")]
    Granularity(u32),

    #[error("bitmap {0:?} is in use")]
    Busy(String),

    #[error("node is blocked by {0}")]
    Blocked(&'static str),

    #[error("bitmap {0:?} already exists")]
    Exists(String),

    #[error("bitmap {0:?} not found")]
    NotFound(String),

    #[error("bitmap already has a successor")]
    SuccessorExists,

    #[error("bitmap has no successor")]
    NoSuccessor,
}

#[derive(Debug)]
pub struct DirtyBitmap {
    /// Anonymous bitmaps belong to internal users and are never migrated.
    name: Option<String>,
    granularity: u32,
    total_sectors: u64,
    bits: BitVec<u64, Lsb0>,

    enabled: bool,
    persistent: bool,
    busy: bool,
    skip_store: bool,

    /// While present, receives new writes in place of this bitmap.
    successor: Option<Box<DirtyBitmap>>,
}

impl DirtyBitmap {
    pub fn new(
        name: Option<&str>,
        granularity: u32,
        total_sectors: u64,
    ) -> Result<Self, BitmapError> {
        if granularity < MIN_GRANULARITY || !granularity.is_power_of_two() {
            return Err(BitmapError::Granularity(granularity));
        }
        let spb = u64::from(granularity) / BDRV_SECTOR_SIZE;
        let nbits = total_sectors.div_ceil(spb) as usize;
        Ok(Self {
            name: name.map(str::to_string),
            granularity,
            total_sectors,
            bits: bitvec![u64, Lsb0; 0; nbits],
            enabled: true,
            persistent: false,
            busy: false,
            skip_store: false,
            successor: None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Bytes covered by each bit.
    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn sectors_per_bit(&self) -> u64 {
        u64::from(self.granularity) / BDRV_SECTOR_SIZE
    }

    /// Bit range covering `[sector, sector + nr_sectors)`, clamped to the
    /// size of the bitmap.
    fn bit_range(&self, sector: u64, nr_sectors: u64) -> std::ops::Range<usize> {
        let spb = self.sectors_per_bit();
        let end = sector.saturating_add(nr_sectors).min(self.total_sectors);
        let first = (sector / spb) as usize;
        let last = end.div_ceil(spb) as usize;
        first.min(self.bits.len())..last.min(self.bits.len())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn skip_store(&self) -> bool {
        self.skip_store
    }

    pub fn has_successor(&self) -> bool {
        self.successor.is_some()
    }

    pub fn successor(&self) -> Option<&DirtyBitmap> {
        self.successor.as_deref()
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub(crate) fn set_skip_store(&mut self, skip: bool) {
        self.skip_store = skip;
    }

    pub(crate) fn enable(&mut self) {
        self.enabled = true;
    }

    pub(crate) fn disable(&mut self) {
        self.enabled = false;
    }

    /// Enable or disable tracking on behalf of a user.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), BitmapError> {
        self.check_not_busy()?;
        self.enabled = enabled;
        Ok(())
    }

    /// Clear every bit on behalf of a user.
    pub fn clear(&mut self) -> Result<(), BitmapError> {
        self.check_not_busy()?;
        self.bits.fill(false);
        Ok(())
    }

    pub(crate) fn check_not_busy(&self) -> Result<(), BitmapError> {
        if self.busy {
            Err(BitmapError::Busy(self.name.clone().unwrap_or_default()))
        } else {
            Ok(())
        }
    }

    /// Record a guest write.  Disabled bitmaps ignore it; a successor sees
    /// it according to its own state.
    pub fn mark(&mut self, sector: u64, nr_sectors: u64) {
        if self.enabled {
            self.set_dirty(sector, nr_sectors);
        }
        if let Some(succ) = self.successor.as_deref_mut() {
            succ.mark(sector, nr_sectors);
        }
    }

    pub fn set_dirty(&mut self, sector: u64, nr_sectors: u64) {
        let range = self.bit_range(sector, nr_sectors);
        self.bits[range].fill(true);
    }

    pub fn reset_dirty(&mut self, sector: u64, nr_sectors: u64) {
        let range = self.bit_range(sector, nr_sectors);
        self.bits[range].fill(false);
    }

    /// Whether the granule holding `sector` is dirty.
    pub fn get(&self, sector: u64) -> bool {
        let idx = (sector / self.sectors_per_bit()) as usize;
        self.bits.get(idx).map_or(false, |b| *b)
    }

    /// Number of dirty sectors, counting whole granules.
    pub fn dirty_sectors(&self) -> u64 {
        let spb = self.sectors_per_bit();
        self.bits
            .iter_ones()
            .map(|idx| {
                let start = idx as u64 * spb;
                spb.min(self.total_sectors - start)
            })
            .sum()
    }

    /// First sector of the first dirty granule at or after `sector`.
    pub fn next_dirty(&self, sector: u64) -> Option<u64> {
        let spb = self.sectors_per_bit();
        let from = (sector / spb) as usize;
        if from >= self.bits.len() {
            return None;
        }
        self.bits[from..]
            .first_one()
            .map(|idx| ((from + idx) as u64 * spb).max(sector))
    }

    /// Size of the serialized form of `[sector, sector + nr_sectors)`:
    /// one bit per granule, padded to whole 64-bit words.
    pub fn serialization_size(&self, sector: u64, nr_sectors: u64) -> usize {
        self.bit_range(sector, nr_sectors).len().div_ceil(64) * 8
    }

    /// Write the bits covering the range to `buf` as little-endian 64-bit
    /// words.
    pub fn serialize_part(&self, buf: &mut [u8], sector: u64, nr_sectors: u64) {
        let range = self.bit_range(sector, nr_sectors);
        buf.fill(0);
        for idx in self.bits[range].iter_ones() {
            let off = idx / 64 * 8;
            let Some(raw) = buf.get_mut(off..off + 8) else {
                break;
            };
            let word = LittleEndian::read_u64(raw) | 1 << (idx % 64);
            LittleEndian::write_u64(raw, word);
        }
    }

    /// Replace the bits covering the range with the contents of `buf`.
    pub fn deserialize_part(&mut self, buf: &[u8], sector: u64, nr_sectors: u64) {
        let range = self.bit_range(sector, nr_sectors);
        for (i, mut bit) in self.bits[range].iter_mut().enumerate() {
            let word = i / 64;
            let set = match buf.get(word * 8..word * 8 + 8) {
                Some(raw) => LittleEndian::read_u64(raw) & (1 << (i % 64)) != 0,
                None => false,
            };
            *bit = set;
        }
    }

    /// Clear the bits covering the range.
    pub fn deserialize_zeroes(&mut self, sector: u64, nr_sectors: u64) {
        self.reset_dirty(sector, nr_sectors);
    }

    /// Freeze this bitmap and divert new writes to a fresh successor which
    /// inherits the current enabled state.
    pub fn create_successor(&mut self) -> Result<(), BitmapError> {
        if self.successor.is_some() {
            return Err(BitmapError::SuccessorExists);
        }
        let mut succ = DirtyBitmap::new(None, self.granularity, self.total_sectors)?;
        succ.enabled = self.enabled;
        self.enabled = false;
        self.successor = Some(Box::new(succ));
        Ok(())
    }

    /// Merge the successor back into this bitmap and drop it.  This bitmap
    /// takes over the successor's enabled state.
    pub fn reclaim_successor(&mut self) -> Result<(), BitmapError> {
        let succ = self.successor.take().ok_or(BitmapError::NoSuccessor)?;
        for idx in succ.bits.iter_ones() {
            self.bits.set(idx, true);
        }
        self.enabled = succ.enabled;
        Ok(())
    }

    pub fn enable_successor(&mut self) -> Result<(), BitmapError> {
        let succ =
            self.successor.as_deref_mut().ok_or(BitmapError::NoSuccessor)?;
        succ.enabled = true;
        Ok(())
    }
}
