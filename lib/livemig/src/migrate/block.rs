// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bulk and incremental migration of block device contents.
//!
//! Every writable device is first copied in full (the bulk phase), one
//! chunk of [`BLK_MIG_BLOCK_SIZE`] at a time, while a dirty bitmap attached
//! to the device records guest writes.  Once the bulk copy is done, dirty
//! chunks are re-sent until the orchestrator decides the remainder is small
//! enough to finish with the guest stopped.
//!
//! Reads are asynchronous: completions land on a shared queue which is
//! drained onto the stream at the start and end of each pass.  Each chunk
//! record on the wire is:
//!
//! ```text
//! be64 (sector << 9 | flags)
//! [u8 name length, name]      if DEVICE_BLOCK
//! [1 MiB of data]             if DEVICE_BLOCK and not ZERO_BLOCK
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use bitflags::bitflags;
use bitvec::prelude::*;
use slog::{debug, error, info, Logger};
use thiserror::Error;

use crate::block::aio::{AioSubmit, ReadRequest};
use crate::block::{
    BitmapError, BitmapRef, BlockGraph, BlockNode, BDRV_SECTOR_BITS,
    BDRV_SECTOR_SIZE,
};
use crate::migrate::{MigrateError, Pending, SaveVmHandlers};
use crate::stream::{Stream, StreamError};

pub const BLK_MIG_BLOCK_SIZE: u64 = 1 << 20;
pub const BDRV_SECTORS_PER_DIRTY_CHUNK: u64 =
    BLK_MIG_BLOCK_SIZE >> BDRV_SECTOR_BITS;

/// Longest run of sectors covered by one allocation query.
const MAX_IS_ALLOCATED_SEARCH: u64 = 65536;

/// Cap on chunk buffers which are either being read or waiting to be sent.
const MAX_INFLIGHT_IO: u64 = 512;

const BLOCKER: &str = "block device is in use by migration";

bitflags! {
    /// Flags in the low bits of a chunk record's leading word.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u64 {
        const DEVICE_BLOCK = 0x01;
        const EOS = 0x02;
        const PROGRESS = 0x04;
        const ZERO_BLOCK = 0x08;
    }
}

#[derive(Debug, Error)]
pub enum BlockMigError {
    #[error("block device {0:?} is empty")]
    EmptyDevice(String),

    #[error("dirty tracking for {device:?}: {source}")]
    Bitmap {
        device: String,
        #[source]
        source: BitmapError,
    },

    /// A chunk read failed; reported when the chunk reaches the head of the
    /// send queue.
    #[error("read of {device:?} at sector {sector} failed: {source}")]
    ReadFailed {
        device: String,
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("write to {device:?} at sector {sector} failed: {source}")]
    WriteFailed {
        device: String,
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("unknown block device {0:?}")]
    UnknownDevice(String),

    #[error("sector {sector} is beyond the end of {device:?}")]
    OutOfRange { device: String, sector: u64 },

    #[error("unknown block migration flags {0:#x}")]
    UnknownFlags(u64),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BlockMigConfig {
    /// Only send sectors allocated in the top layer of each device, the
    /// destination already holding the shared base.
    pub shared_base: bool,

    /// Send all-zero chunks as a bare record.
    pub zero_blocks: bool,
}

struct DevState {
    node: Arc<BlockNode>,
    total_sectors: u64,
    shared_base: bool,
    bulk_completed: bool,
    cur_sector: u64,
    cur_dirty: u64,
    completed_sectors: u64,
    dirty_bitmap: BitmapRef,
}

/// A chunk whose read has completed.
struct ReadBlock {
    dev: usize,
    sector: u64,
    buf: Vec<u8>,
    ret: io::Result<()>,
}

#[derive(Default)]
struct Queue {
    blocks: VecDeque<ReadBlock>,
    submitted: u64,
    read_done: u64,
    transferred: u64,

    /// Per device, one bit per chunk with a read in flight.
    aio_inflight: Vec<BitVec<u64, Lsb0>>,
}

impl Queue {
    fn set_inflight(&mut self, dev: usize, sector: u64, nr_sectors: u64, set: bool) {
        let Some(bits) = self.aio_inflight.get_mut(dev) else {
            return;
        };
        let first = (sector / BDRV_SECTORS_PER_DIRTY_CHUNK) as usize;
        let last = ((sector + nr_sectors).div_ceil(BDRV_SECTORS_PER_DIRTY_CHUNK)
            as usize)
            .min(bits.len());
        if first < last {
            bits[first..last].fill(set);
        }
    }

    fn inflight(&self, dev: usize, sector: u64) -> bool {
        let chunk = (sector / BDRV_SECTORS_PER_DIRTY_CHUNK) as usize;
        self.aio_inflight
            .get(dev)
            .and_then(|bits| bits.get(chunk).map(|b| *b))
            .unwrap_or(false)
    }
}

/// State shared with read completions.
#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    cv: Condvar,
}

impl Shared {
    fn read_complete(
        &self,
        dev: usize,
        sector: u64,
        nr_sectors: u64,
        buf: Vec<u8>,
        ret: io::Result<()>,
    ) {
        let mut q = self.queue.lock().unwrap();
        q.set_inflight(dev, sector, nr_sectors, false);
        q.submitted -= 1;
        q.read_done += 1;
        q.blocks.push_back(ReadBlock { dev, sector, buf, ret });
        drop(q);
        self.cv.notify_all();
    }

    /// Block until no read covering `sector` of `dev` is in flight.
    fn wait_inflight(&self, dev: usize, sector: u64) {
        let mut q = self.queue.lock().unwrap();
        while q.inflight(dev, sector) {
            q = self.cv.wait(q).unwrap();
        }
    }

    /// Block until every submitted read has completed.
    fn drain(&self) {
        let mut q = self.queue.lock().unwrap();
        while q.submitted > 0 {
            q = self.cv.wait(q).unwrap();
        }
    }

    fn buffers_in_use(&self) -> u64 {
        let q = self.queue.lock().unwrap();
        q.submitted + q.read_done
    }
}

/// Block migration for one session, both directions.
pub struct BlockMigration {
    graph: Arc<BlockGraph>,
    aio: Arc<dyn AioSubmit>,
    config: BlockMigConfig,
    devs: Vec<DevState>,
    shared: Arc<Shared>,
    bulk_completed: bool,
    total_sector_sum: u64,
    prev_progress: Option<u64>,
    log: Logger,
}

impl BlockMigration {
    pub fn new(
        graph: Arc<BlockGraph>,
        aio: Arc<dyn AioSubmit>,
        config: BlockMigConfig,
        log: &Logger,
    ) -> Self {
        Self {
            graph,
            aio,
            config,
            devs: Vec::new(),
            shared: Arc::new(Shared::default()),
            bulk_completed: false,
            total_sector_sum: 0,
            prev_progress: None,
            log: log.new(slog::o!("component" => "block-migration")),
        }
    }

    /// Bytes of device data covered by the bulk phase so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.devs.iter().map(|d| d.completed_sectors).sum::<u64>()
            << BDRV_SECTOR_BITS
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_total() - self.bytes_transferred()
    }

    pub fn bytes_total(&self) -> u64 {
        self.devs.iter().map(|d| d.total_sectors).sum::<u64>()
            << BDRV_SECTOR_BITS
    }

    /// Chunks put on the wire since setup.
    pub fn chunks_sent(&self) -> u64 {
        self.shared.queue.lock().unwrap().transferred
    }

    fn init(&mut self) -> Result<(), BlockMigError> {
        *self.shared.queue.lock().unwrap() = Queue::default();
        self.bulk_completed = false;
        self.total_sector_sum = 0;
        self.prev_progress = None;

        for node in self.graph.nodes() {
            if node.is_read_only() {
                continue;
            }
            let total_sectors = node.total_sectors();
            if total_sectors == 0 {
                return Err(BlockMigError::EmptyDevice(node.name().to_string()));
            }
            let dirty_bitmap = node
                .create_bitmap(None, BLK_MIG_BLOCK_SIZE as u32)
                .map_err(|source| BlockMigError::Bitmap {
                    device: node.name().to_string(),
                    source,
                })?;
            node.block_ops(BLOCKER);

            if self.config.shared_base {
                info!(self.log, "start migration with shared base image";
                    "device" => node.name(), "sectors" => total_sectors);
            } else {
                info!(self.log, "start full migration";
                    "device" => node.name(), "sectors" => total_sectors);
            }
            self.total_sector_sum += total_sectors;
            self.shared.queue.lock().unwrap().aio_inflight.push(
                bitvec![u64, Lsb0; 0; total_sectors.div_ceil(BDRV_SECTORS_PER_DIRTY_CHUNK) as usize],
            );
            self.devs.push(DevState {
                node,
                total_sectors,
                shared_base: self.config.shared_base,
                bulk_completed: false,
                cur_sector: 0,
                cur_dirty: 0,
                completed_sectors: 0,
                dirty_bitmap,
            });
        }
        Ok(())
    }

    fn reset_dirty_cursor(&mut self) {
        for dev in self.devs.iter_mut() {
            dev.cur_dirty = 0;
        }
    }

    /// Read a chunk asynchronously; it joins the send queue on completion.
    fn submit_read(&self, idx: usize, sector: u64, nr_sectors: u64) {
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.submitted += 1;
            q.set_inflight(idx, sector, nr_sectors, true);
        }
        let shared = self.shared.clone();
        self.aio.submit(ReadRequest {
            node: self.devs[idx].node.clone(),
            sector,
            nr_sectors,
            buf: vec![0u8; BLK_MIG_BLOCK_SIZE as usize],
            done: Box::new(move |ret, buf| {
                shared.read_complete(idx, sector, nr_sectors, buf, ret)
            }),
        });
    }

    /// Submit the next bulk chunk of device `idx`.  Returns true once the
    /// device's cursor has passed its end.
    fn save_device_bulk(&mut self, idx: usize) -> bool {
        let dev = &mut self.devs[idx];
        let total = dev.total_sectors;
        let mut cur = dev.cur_sector;

        if dev.shared_base {
            // A failed status query counts as allocated.
            while cur < total {
                match dev.node.block_status(cur, MAX_IS_ALLOCATED_SEARCH.min(total - cur)) {
                    Ok(st) if !st.allocated => cur += st.sectors.max(1),
                    _ => break,
                }
            }
        }

        if cur >= total {
            dev.cur_sector = total;
            dev.completed_sectors = total;
            return true;
        }

        dev.completed_sectors = cur;
        cur &= !(BDRV_SECTORS_PER_DIRTY_CHUNK - 1);
        let nr_sectors = BDRV_SECTORS_PER_DIRTY_CHUNK.min(total - cur);

        dev.dirty_bitmap.lock().unwrap().reset_dirty(cur, nr_sectors);
        dev.cur_sector = cur + nr_sectors;
        let done = dev.cur_sector >= total;

        self.submit_read(idx, cur, nr_sectors);
        done
    }

    /// Advance the bulk phase by one chunk on the first device still in it.
    /// Returns false once every device has finished its bulk phase.
    fn save_bulked_block(&mut self, f: &mut Stream) -> bool {
        let mut completed_sum = 0;
        let mut more = false;
        for idx in 0..self.devs.len() {
            if !self.devs[idx].bulk_completed {
                if self.save_device_bulk(idx) {
                    let dev = &mut self.devs[idx];
                    dev.bulk_completed = true;
                    dev.completed_sectors = dev.total_sectors;
                }
                completed_sum += self.devs[idx].completed_sectors;
                more = true;
                break;
            }
            completed_sum += self.devs[idx].completed_sectors;
        }

        let progress = if self.total_sector_sum != 0 {
            completed_sum * 100 / self.total_sector_sum
        } else {
            100
        };
        if self.prev_progress != Some(progress) {
            self.prev_progress = Some(progress);
            f.put_be64(progress << BDRV_SECTOR_BITS | BlockFlags::PROGRESS.bits());
            debug!(self.log, "bulk progress"; "percent" => progress);
        }
        more
    }

    /// Send (or submit for reading) the next dirty chunk of device `idx`.
    /// Returns true once the dirty cursor has passed the device's end.
    fn save_device_dirty(
        &mut self,
        f: &mut Stream,
        idx: usize,
        is_async: bool,
    ) -> Result<bool, BlockMigError> {
        let total = self.devs[idx].total_sectors;
        let from = self.devs[idx].cur_dirty;
        let next = if from < total {
            self.devs[idx].dirty_bitmap.lock().unwrap().next_dirty(from)
        } else {
            None
        };
        let Some(next) = next else {
            self.devs[idx].cur_dirty = total;
            return Ok(true);
        };

        let sector = next & !(BDRV_SECTORS_PER_DIRTY_CHUNK - 1);
        self.shared.wait_inflight(idx, sector);
        let nr_sectors = BDRV_SECTORS_PER_DIRTY_CHUNK.min(total - sector);
        // Cleared before the read so that writes racing it are sent again.
        self.devs[idx].dirty_bitmap.lock().unwrap().reset_dirty(sector, nr_sectors);

        if is_async {
            self.submit_read(idx, sector, nr_sectors);
        } else {
            let node = &self.devs[idx].node;
            let mut buf = vec![0u8; BLK_MIG_BLOCK_SIZE as usize];
            let len = (nr_sectors * BDRV_SECTOR_SIZE) as usize;
            node.read(sector, &mut buf[..len]).map_err(|source| {
                BlockMigError::ReadFailed {
                    device: node.name().to_string(),
                    sector,
                    source,
                }
            })?;
            self.send_block(f, idx, sector, &buf);
            self.shared.queue.lock().unwrap().transferred += 1;
        }

        let cur = sector + nr_sectors;
        self.devs[idx].cur_dirty = cur;
        Ok(cur >= total)
    }

    /// Returns true once no device has dirty chunks left past its cursor.
    fn save_dirty_block(
        &mut self,
        f: &mut Stream,
        is_async: bool,
    ) -> Result<bool, BlockMigError> {
        for idx in 0..self.devs.len() {
            if !self.save_device_dirty(f, idx, is_async)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn send_block(&self, f: &mut Stream, idx: usize, sector: u64, buf: &[u8]) {
        let mut flags = BlockFlags::DEVICE_BLOCK;
        let zero = self.config.zero_blocks && buf.iter().all(|b| *b == 0);
        if zero {
            flags |= BlockFlags::ZERO_BLOCK;
        }
        f.put_be64(sector << BDRV_SECTOR_BITS | flags.bits());
        f.put_counted_string(self.devs[idx].node.name());
        if zero {
            f.flush();
        } else {
            f.put_buffer(buf);
        }
    }

    /// Put completed reads on the wire, in completion order.  With `limit`,
    /// stop once the stream's rate limit is spent.
    fn flush_blks(&mut self, f: &mut Stream, limit: bool) -> Result<(), BlockMigError> {
        loop {
            if limit && f.rate_limit_exceeded() {
                break;
            }
            let Some(blk) = self.shared.queue.lock().unwrap().blocks.pop_front()
            else {
                break;
            };
            let ReadBlock { dev, sector, buf, ret } = blk;
            if let Err(source) = ret {
                self.shared.queue.lock().unwrap().read_done -= 1;
                return Err(BlockMigError::ReadFailed {
                    device: self.devs[dev].node.name().to_string(),
                    sector,
                    source,
                });
            }
            self.send_block(f, dev, sector, &buf);

            let mut q = self.shared.queue.lock().unwrap();
            q.read_done -= 1;
            q.transferred += 1;
        }
        Ok(f.error()?)
    }

    fn remaining_dirty(&self) -> u64 {
        self.devs
            .iter()
            .map(|d| d.dirty_bitmap.lock().unwrap().dirty_sectors())
            .sum::<u64>()
            * BDRV_SECTOR_SIZE
    }

    fn iterate(&mut self, f: &mut Stream) -> Result<bool, BlockMigError> {
        self.flush_blks(f, true)?;
        self.reset_dirty_cursor();

        loop {
            let in_use = self.shared.buffers_in_use();
            if in_use * BLK_MIG_BLOCK_SIZE >= f.rate_limit_max()
                || in_use >= MAX_INFLIGHT_IO
            {
                break;
            }
            if !self.bulk_completed {
                if !self.save_bulked_block(f) {
                    self.bulk_completed = true;
                }
            } else if self.save_dirty_block(f, true)? {
                break;
            }
        }

        self.flush_blks(f, true)?;
        f.put_be64(BlockFlags::EOS.bits());
        f.error()?;

        Ok(self.bulk_completed
            && self.shared.buffers_in_use() == 0
            && self.remaining_dirty() == 0)
    }

    fn complete(&mut self, f: &mut Stream) -> Result<(), BlockMigError> {
        self.shared.drain();
        self.flush_blks(f, false)?;

        while !self.bulk_completed {
            if !self.save_bulked_block(f) {
                self.bulk_completed = true;
            }
            self.shared.drain();
            self.flush_blks(f, false)?;
        }

        self.reset_dirty_cursor();
        while !self.save_dirty_block(f, false)? {}

        f.put_be64(100 << BDRV_SECTOR_BITS | BlockFlags::PROGRESS.bits());
        f.put_be64(BlockFlags::EOS.bits());
        f.error()?;
        info!(self.log, "block migration complete";
            "chunks" => self.chunks_sent());

        self.cleanup();
        Ok(())
    }

    fn cleanup(&mut self) {
        self.shared.drain();
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.blocks.clear();
            q.read_done = 0;
            q.aio_inflight.clear();
        }
        for dev in self.devs.drain(..) {
            dev.node.release_bitmap(&dev.dirty_bitmap);
            dev.node.unblock_ops(BLOCKER);
        }
    }

    fn load(&mut self, f: &mut Stream) -> Result<(), BlockMigError> {
        loop {
            let word = f.get_be64();
            f.error()?;
            let raw = word & (BDRV_SECTOR_SIZE - 1);
            let sector = word >> BDRV_SECTOR_BITS;
            let flags = BlockFlags::from_bits(raw)
                .ok_or(BlockMigError::UnknownFlags(raw))?;

            if flags.contains(BlockFlags::DEVICE_BLOCK) {
                let name = f.get_counted_string()?;
                let Some(node) = self.graph.find(&name) else {
                    return Err(BlockMigError::UnknownDevice(name));
                };
                let total = node.total_sectors();
                if sector >= total {
                    return Err(BlockMigError::OutOfRange { device: name, sector });
                }
                let nr_sectors = BDRV_SECTORS_PER_DIRTY_CHUNK.min(total - sector);
                let write_err = |source| BlockMigError::WriteFailed {
                    device: name.clone(),
                    sector,
                    source,
                };

                if flags.contains(BlockFlags::ZERO_BLOCK) {
                    node.restore_zeroes(sector, nr_sectors).map_err(write_err)?;
                } else {
                    let mut buf = vec![0u8; BLK_MIG_BLOCK_SIZE as usize];
                    f.get_buffer(&mut buf);
                    f.error()?;
                    let len = (nr_sectors * BDRV_SECTOR_SIZE) as usize;
                    node.restore(sector, &buf[..len]).map_err(write_err)?;
                }
            } else if flags.contains(BlockFlags::PROGRESS) {
                debug!(self.log, "receiving block device images";
                    "percent" => sector);
            } else if !flags.contains(BlockFlags::EOS) {
                return Err(BlockMigError::UnknownFlags(raw));
            }

            f.error()?;
            if flags.contains(BlockFlags::EOS) {
                return Ok(());
            }
        }
    }
}

impl SaveVmHandlers for BlockMigration {
    fn save_setup(&mut self, f: &mut Stream) -> Result<(), MigrateError> {
        if let Err(e) = self.init() {
            error!(self.log, "block migration setup failed"; "error" => %e);
            self.cleanup();
            return Err(e.into());
        }
        self.flush_blks(f, true)?;
        self.reset_dirty_cursor();
        f.put_be64(BlockFlags::EOS.bits());
        Ok(f.error()?)
    }

    fn save_live_iterate(&mut self, f: &mut Stream) -> Result<bool, MigrateError> {
        Ok(self.iterate(f)?)
    }

    fn save_live_complete_precopy(
        &mut self,
        f: &mut Stream,
    ) -> Result<(), MigrateError> {
        Ok(self.complete(f)?)
    }

    fn save_pending(&mut self, max_size: u64) -> Pending {
        let mut pending = self.remaining_dirty()
            + self.shared.buffers_in_use() * BLK_MIG_BLOCK_SIZE;
        // Keep the bulk phase iterating.
        if pending <= max_size && !self.bulk_completed {
            pending = max_size + BLK_MIG_BLOCK_SIZE;
        }
        Pending { precopy: pending, postcopy: 0 }
    }

    fn save_cleanup(&mut self) {
        self.cleanup();
    }

    fn load_state(
        &mut self,
        f: &mut Stream,
        _version_id: i32,
    ) -> Result<(), MigrateError> {
        Ok(self.load(f)?)
    }
}
