// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration of named dirty bitmaps.
//!
//! The stream is a sequence of chunks, each opening with a flags word:
//!
//! ```text
//! flags [device name] [bitmap name] [payload]
//! ```
//!
//! Device and bitmap names are only sent when they differ from those of the
//! previous chunk, so both ends keep the "current" device and bitmap as
//! session state.  Payloads depend on the flags:
//!
//! * `START`: be32 granularity, then a byte of [`StartFlags`].
//! * `BITS`: be64 first sector, be32 sector count, then either nothing
//!   (`ZEROES`) or a be64 buffer size and the serialized bits.
//! * `COMPLETE`, `EOS`: nothing.
//!
//! Every pass of the handler ends with an `EOS` chunk.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use slog::{debug, error, info, warn, Logger};
use thiserror::Error;

use crate::block::{BitmapError, BitmapRef, BlockGraph, BlockNode, BDRV_SECTOR_SIZE};
use crate::migrate::{MigrateError, Pending, SaveVmHandlers};
use crate::stream::{Stream, StreamError};

/// Bytes of serialized bitmap carried by one bulk chunk.
pub const CHUNK_SIZE: u64 = 1 << 10;

/// Largest buffer the destination accepts in a single `BITS` chunk.
const MAX_BUF_SIZE: u64 = 10 * CHUNK_SIZE;

/// Serialized bitmap buffers are padded to this alignment.
const BUF_ALIGN: u64 = 32;

/// Continuation bit of a flags byte: another byte (or two) follows.
const FLAG_EXTRA: u8 = 0x80;

const MAX_NAME_LEN: usize = u8::MAX as usize;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ChunkFlags: u32 {
        const EOS = 0x01;
        const ZEROES = 0x02;
        const BITMAP_NAME = 0x04;
        const DEVICE_NAME = 0x08;
        const START = 0x10;
        const COMPLETE = 0x20;
        const BITS = 0x40;
    }
}

bitflags! {
    /// Properties of a bitmap carried by its `START` chunk.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct StartFlags: u8 {
        const ENABLED = 0x01;
        const PERSISTENT = 0x02;
    }
}

#[derive(Debug, Error)]
pub enum DirtyBitmapMigError {
    /// A local bitmap operation failed.
    #[error("bitmap {bitmap:?} on {device:?}: {source}")]
    Bitmap {
        device: String,
        bitmap: String,
        #[source]
        source: BitmapError,
    },

    #[error("bitmap name {0:?} is longer than 255 bytes")]
    NameTooLong(String),

    #[error("unknown dirty bitmap flags {0:#x}")]
    UnknownFlags(u32),

    #[error("unknown flags {0:#x} in dirty bitmap header")]
    UnknownStartFlags(u8),

    /// The declared buffer size exceeds what a single chunk may carry.
    #[error("bitmap chunk buffer of {0} bytes is too large")]
    OversizedBuffer(u64),

    #[error("bitmap {0:?} already exists on destination")]
    Exists(String),

    #[error(
        "bitmap {bitmap:?}: migrated granularity {incoming} does not match local {local}"
    )]
    GranularityMismatch { bitmap: String, incoming: u32, local: u32 },

    #[error("unsupported dirty bitmap stream version {0}")]
    Version(i32),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

/// Read a flags word of one, two, or four bytes.
///
/// A byte with its top bit set announces that the word continues: a second
/// byte, and if that also has its top bit set, a final be16.  The marker
/// bits are not part of the returned flags.
pub fn get_flags(f: &mut Stream) -> Result<ChunkFlags, DirtyBitmapMigError> {
    let b0 = f.get_byte();
    let raw = if b0 & FLAG_EXTRA == 0 {
        u32::from(b0)
    } else {
        let b1 = f.get_byte();
        if b1 & FLAG_EXTRA == 0 {
            u32::from(b0 & !FLAG_EXTRA) << 8 | u32::from(b1)
        } else {
            u32::from(b0 & !FLAG_EXTRA) << 24
                | u32::from(b1 & !FLAG_EXTRA) << 16
                | u32::from(f.get_be16())
        }
    };
    f.error()?;
    ChunkFlags::from_bits(raw).ok_or(DirtyBitmapMigError::UnknownFlags(raw))
}

/// Every defined flag fits a single byte, which is all the sender emits.
pub fn put_flags(f: &mut Stream, flags: ChunkFlags) {
    f.put_byte(flags.bits() as u8);
}

/// A bitmap being sent.
struct SaveBitmapState {
    node: Arc<BlockNode>,
    bitmap: BitmapRef,
    bitmap_name: String,
    total_sectors: u64,
    sectors_per_chunk: u64,
    cur_sector: u64,
    bulk_completed: bool,
    flags: StartFlags,
}

struct SaveState {
    bitmaps: Vec<SaveBitmapState>,
    bulk_completed: bool,
    no_bitmaps: bool,

    /// Device and bitmap named by the last chunk sent.
    prev_node: Option<Arc<BlockNode>>,
    prev_bitmap: Option<BitmapRef>,
}

impl SaveState {
    fn new() -> Self {
        Self {
            bitmaps: Vec::new(),
            bulk_completed: false,
            no_bitmaps: false,
            prev_node: None,
            prev_bitmap: None,
        }
    }
}

/// A bitmap which has been started by the incoming stream.
struct LoadBitmapState {
    node: Arc<BlockNode>,
    bitmap: BitmapRef,
    migrated: bool,
    enabled: bool,
}

struct LoadState {
    flags: ChunkFlags,
    node_name: String,
    bitmap_name: String,
    node: Option<Arc<BlockNode>>,
    bitmap: Option<BitmapRef>,

    bitmaps: Vec<LoadBitmapState>,
    cancelled: bool,
    before_vm_start_handled: bool,
}

impl LoadState {
    fn new() -> Self {
        Self {
            flags: ChunkFlags::empty(),
            node_name: String::new(),
            bitmap_name: String::new(),
            node: None,
            bitmap: None,
            bitmaps: Vec::new(),
            cancelled: false,
            before_vm_start_handled: false,
        }
    }
}

/// Dirty bitmap migration for one session, both directions.
pub struct DirtyBitmapMigration {
    graph: Arc<BlockGraph>,
    save: SaveState,
    load: Mutex<LoadState>,
    postcopy_active: bool,
    send_zero_chunks: bool,
    log: Logger,
}

impl DirtyBitmapMigration {
    pub fn new(graph: Arc<BlockGraph>, log: &Logger) -> Self {
        Self {
            graph,
            save: SaveState::new(),
            load: Mutex::new(LoadState::new()),
            postcopy_active: false,
            send_zero_chunks: true,
            log: log.new(slog::o!("component" => "dirty-bitmap-migration")),
        }
    }

    /// Send all-zero chunks with their bits rather than as `ZEROES`.
    pub fn set_send_zero_chunks(&mut self, enabled: bool) {
        self.send_zero_chunks = enabled;
    }

    pub fn is_cancelled(&self) -> bool {
        self.load.lock().unwrap().cancelled
    }

    /// Abandon the incoming migration, releasing every bitmap it started.
    pub fn cancel_incoming(&self) {
        self.load.lock().unwrap().cancel(&self.log);
    }

    // Save side

    fn init(&mut self) -> Result<(), DirtyBitmapMigError> {
        let mut found = Vec::new();
        for node in self.graph.nodes() {
            for bitmap in node.bitmaps() {
                let bm = bitmap.lock().unwrap();
                let Some(name) = bm.name() else {
                    continue;
                };
                if bm.is_busy() {
                    return Err(DirtyBitmapMigError::Bitmap {
                        device: node.name().to_string(),
                        bitmap: name.to_string(),
                        source: BitmapError::Busy(name.to_string()),
                    });
                }
                if name.len() > MAX_NAME_LEN {
                    return Err(DirtyBitmapMigError::NameTooLong(
                        name.to_string(),
                    ));
                }
                let mut flags = StartFlags::empty();
                flags.set(StartFlags::ENABLED, bm.is_enabled());
                flags.set(StartFlags::PERSISTENT, bm.is_persistent());
                let spb = u64::from(bm.granularity()) / BDRV_SECTOR_SIZE;
                found.push(SaveBitmapState {
                    node: node.clone(),
                    bitmap: bitmap.clone(),
                    bitmap_name: name.to_string(),
                    total_sectors: node.total_sectors(),
                    sectors_per_chunk: CHUNK_SIZE * 8 * spb,
                    cur_sector: 0,
                    bulk_completed: false,
                    flags,
                });
            }
        }

        for dbms in found.iter() {
            let mut bm = dbms.bitmap.lock().unwrap();
            bm.set_busy(true);
            if dbms.flags.contains(StartFlags::PERSISTENT) {
                bm.set_skip_store(true);
            }
        }

        self.save = SaveState::new();
        self.save.no_bitmaps = found.is_empty();
        self.save.bitmaps = found;
        Ok(())
    }

    fn send_header(&mut self, f: &mut Stream, idx: usize, mut flags: ChunkFlags) {
        let s = &mut self.save;
        let dbms = &s.bitmaps[idx];
        if !s.prev_node.as_ref().is_some_and(|n| Arc::ptr_eq(n, &dbms.node)) {
            s.prev_node = Some(dbms.node.clone());
            flags |= ChunkFlags::DEVICE_NAME;
        }
        if !s.prev_bitmap.as_ref().is_some_and(|b| Arc::ptr_eq(b, &dbms.bitmap))
        {
            s.prev_bitmap = Some(dbms.bitmap.clone());
            flags |= ChunkFlags::BITMAP_NAME;
        }
        put_flags(f, flags);
        if flags.contains(ChunkFlags::DEVICE_NAME) {
            f.put_counted_string(dbms.node.name());
        }
        if flags.contains(ChunkFlags::BITMAP_NAME) {
            f.put_counted_string(&dbms.bitmap_name);
        }
    }

    fn send_start(&mut self, f: &mut Stream, idx: usize) {
        self.send_header(f, idx, ChunkFlags::START);
        let dbms = &self.save.bitmaps[idx];
        f.put_be32(dbms.bitmap.lock().unwrap().granularity());
        f.put_byte(dbms.flags.bits());
    }

    fn send_complete(&mut self, f: &mut Stream, idx: usize) {
        self.send_header(f, idx, ChunkFlags::COMPLETE);
    }

    fn send_bits(&mut self, f: &mut Stream, idx: usize, sector: u64, nr_sectors: u32) {
        let nr = u64::from(nr_sectors);
        let buf = {
            let bm = self.save.bitmaps[idx].bitmap.lock().unwrap();
            let size = align_up(bm.serialization_size(sector, nr) as u64, BUF_ALIGN);
            let mut buf = vec![0u8; size as usize];
            bm.serialize_part(&mut buf, sector, nr);
            buf
        };

        let mut flags = ChunkFlags::BITS;
        let zero = self.send_zero_chunks && buf.iter().all(|b| *b == 0);
        if zero {
            flags |= ChunkFlags::ZEROES;
        }
        self.send_header(f, idx, flags);
        f.put_be64(sector);
        f.put_be32(nr_sectors);
        if zero {
            f.flush();
        } else {
            f.put_be64(buf.len() as u64);
            f.put_buffer(&buf);
        }
    }

    fn bulk_send_chunk(&mut self, f: &mut Stream, idx: usize) {
        let dbms = &self.save.bitmaps[idx];
        let nr = (dbms.total_sectors - dbms.cur_sector)
            .min(dbms.sectors_per_chunk)
            .min(u64::from(u32::MAX));
        let sector = dbms.cur_sector;
        self.send_bits(f, idx, sector, nr as u32);

        let dbms = &mut self.save.bitmaps[idx];
        dbms.cur_sector += nr;
        if dbms.cur_sector >= dbms.total_sectors {
            dbms.bulk_completed = true;
        }
    }

    /// Send every bitmap's bits, yielding once the stream's rate limit is
    /// spent if `limit` is set.
    fn bulk_phase(&mut self, f: &mut Stream, limit: bool) {
        for idx in 0..self.save.bitmaps.len() {
            while !self.save.bitmaps[idx].bulk_completed {
                self.bulk_send_chunk(f, idx);
                if limit && f.rate_limit_exceeded() {
                    return;
                }
            }
        }
        self.save.bulk_completed = true;
    }

    fn complete(&mut self, f: &mut Stream) -> Result<(), DirtyBitmapMigError> {
        if !self.save.bulk_completed {
            self.bulk_phase(f, false);
        }
        for idx in 0..self.save.bitmaps.len() {
            self.send_complete(f, idx);
        }
        put_flags(f, ChunkFlags::EOS);
        f.error()?;
        info!(self.log, "dirty bitmaps sent"; "count" => self.save.bitmaps.len());
        self.cleanup(true);
        Ok(())
    }

    /// Release the bitmaps taken at setup.  Persistent bitmaps stay
    /// skip-store only when the destination has received them in full.
    fn cleanup(&mut self, completed: bool) {
        for dbms in self.save.bitmaps.drain(..) {
            let mut bm = dbms.bitmap.lock().unwrap();
            bm.set_busy(false);
            if !completed && dbms.flags.contains(StartFlags::PERSISTENT) {
                bm.set_skip_store(false);
            }
        }
        self.save.prev_node = None;
        self.save.prev_bitmap = None;
    }
}

impl SaveVmHandlers for DirtyBitmapMigration {
    fn save_setup(&mut self, f: &mut Stream) -> Result<(), MigrateError> {
        if let Err(e) = self.init() {
            error!(self.log, "dirty bitmap migration setup failed"; "error" => %e);
            self.cleanup(false);
            return Err(e.into());
        }
        for idx in 0..self.save.bitmaps.len() {
            self.send_start(f, idx);
        }
        put_flags(f, ChunkFlags::EOS);
        info!(self.log, "dirty bitmap migration setup";
            "bitmaps" => self.save.bitmaps.len());
        Ok(f.error()?)
    }

    fn save_live_iterate(&mut self, f: &mut Stream) -> Result<bool, MigrateError> {
        if self.postcopy_active && !self.save.bulk_completed {
            self.bulk_phase(f, true);
        }
        put_flags(f, ChunkFlags::EOS);
        f.error()?;
        Ok(self.save.bulk_completed)
    }

    fn save_live_complete_precopy(
        &mut self,
        f: &mut Stream,
    ) -> Result<(), MigrateError> {
        Ok(self.complete(f)?)
    }

    fn save_pending(&mut self, _max_size: u64) -> Pending {
        let bits: u64 = self
            .save
            .bitmaps
            .iter()
            .map(|dbms| {
                let gran = u64::from(dbms.bitmap.lock().unwrap().granularity());
                let sectors = if dbms.bulk_completed {
                    0
                } else {
                    dbms.total_sectors - dbms.cur_sector
                };
                (sectors * BDRV_SECTOR_SIZE).div_ceil(gran)
            })
            .sum();
        Pending { precopy: 0, postcopy: bits.div_ceil(8) }
    }

    fn save_cleanup(&mut self) {
        self.cleanup(false);
    }

    fn load_state(
        &mut self,
        f: &mut Stream,
        version_id: i32,
    ) -> Result<(), MigrateError> {
        let mut s = self.load.lock().unwrap();
        Ok(s.load(f, version_id, &self.graph, &self.log)?)
    }

    fn is_active(&self) -> bool {
        !self.save.no_bitmaps
    }

    fn is_active_iterate(&self) -> bool {
        self.postcopy_active && self.is_active()
    }

    fn has_postcopy(&self) -> bool {
        true
    }

    fn enter_postcopy(&mut self) {
        self.postcopy_active = true;
    }

    fn before_vm_start(&mut self) {
        self.load.lock().unwrap().before_vm_start();
    }
}

impl LoadState {
    fn load(
        &mut self,
        f: &mut Stream,
        version_id: i32,
        graph: &BlockGraph,
        log: &Logger,
    ) -> Result<(), DirtyBitmapMigError> {
        if version_id != 1 {
            self.cancel(log);
            return Err(DirtyBitmapMigError::Version(version_id));
        }
        loop {
            if let Err(e) = self.load_chunk(f, graph, log) {
                error!(log, "failed to load dirty bitmap chunk"; "error" => %e);
                self.cancel(log);
                return Err(e);
            }
            if self.flags.contains(ChunkFlags::EOS) {
                return Ok(());
            }
        }
    }

    fn load_chunk(
        &mut self,
        f: &mut Stream,
        graph: &BlockGraph,
        log: &Logger,
    ) -> Result<(), DirtyBitmapMigError> {
        self.load_header(f, graph, log)?;
        if self.flags.contains(ChunkFlags::START) {
            self.load_start(f)?;
        } else if self.flags.contains(ChunkFlags::COMPLETE) {
            self.load_complete()?;
        } else if self.flags.contains(ChunkFlags::BITS) {
            self.load_bits(f, log)?;
        }
        Ok(f.error()?)
    }

    fn load_header(
        &mut self,
        f: &mut Stream,
        graph: &BlockGraph,
        log: &Logger,
    ) -> Result<(), DirtyBitmapMigError> {
        self.flags = get_flags(f)?;
        let eos = self.flags.contains(ChunkFlags::EOS);

        if self.flags.contains(ChunkFlags::DEVICE_NAME) {
            self.node_name = f.get_counted_string()?;
            if !self.cancelled {
                self.node = graph.find(&self.node_name);
                if self.node.is_none() {
                    warn!(log, "unknown block device";
                        "device" => &self.node_name);
                    self.cancel(log);
                }
            }
        } else if self.node.is_none() && !self.cancelled && !eos {
            warn!(log, "block device name is not set");
            self.cancel(log);
        }

        if self.flags.contains(ChunkFlags::BITMAP_NAME) {
            self.bitmap_name = f.get_counted_string()?;
            if !self.cancelled {
                self.bitmap = self
                    .node
                    .as_ref()
                    .and_then(|node| node.find_bitmap(&self.bitmap_name));
                // Absent is expected on the bitmap's first chunk.
                if self.bitmap.is_none()
                    && !self.flags.contains(ChunkFlags::START)
                {
                    warn!(log, "unknown dirty bitmap";
                        "device" => &self.node_name,
                        "bitmap" => &self.bitmap_name);
                    self.cancel(log);
                }
            }
        } else if self.bitmap.is_none() && !self.cancelled && !eos {
            warn!(log, "dirty bitmap name is not set");
            self.cancel(log);
        }
        Ok(())
    }

    fn load_start(&mut self, f: &mut Stream) -> Result<(), DirtyBitmapMigError> {
        let granularity = f.get_be32();
        let raw = f.get_byte();
        f.error()?;
        if self.cancelled {
            return Ok(());
        }
        let Some(node) = self.node.clone() else {
            return Ok(());
        };

        if let Some(existing) = self.bitmap.as_ref() {
            let local = existing.lock().unwrap().granularity();
            return Err(if local != granularity {
                DirtyBitmapMigError::GranularityMismatch {
                    bitmap: self.bitmap_name.clone(),
                    incoming: granularity,
                    local,
                }
            } else {
                DirtyBitmapMigError::Exists(self.bitmap_name.clone())
            });
        }
        let flags = StartFlags::from_bits(raw)
            .ok_or(DirtyBitmapMigError::UnknownStartFlags(raw))?;

        let bitmap_err = |source| DirtyBitmapMigError::Bitmap {
            device: self.node_name.clone(),
            bitmap: self.bitmap_name.clone(),
            source,
        };
        let bitmap = node
            .create_bitmap(Some(&self.bitmap_name), granularity)
            .map_err(bitmap_err)?;
        {
            let mut bm = bitmap.lock().unwrap();
            bm.set_persistent(flags.contains(StartFlags::PERSISTENT));
            bm.disable();
            if flags.contains(StartFlags::ENABLED) {
                bm.create_successor().map_err(bitmap_err)?;
            }
        }

        self.bitmap = Some(bitmap.clone());
        self.bitmaps.push(LoadBitmapState {
            node,
            bitmap,
            migrated: false,
            enabled: flags.contains(StartFlags::ENABLED),
        });
        Ok(())
    }

    fn load_bits(&mut self, f: &mut Stream, log: &Logger) -> Result<(), DirtyBitmapMigError> {
        let sector = f.get_be64();
        let nr_sectors = u64::from(f.get_be32());

        if self.flags.contains(ChunkFlags::ZEROES) {
            f.error()?;
            if let (false, Some(bitmap)) = (self.cancelled, self.bitmap.as_ref()) {
                bitmap.lock().unwrap().deserialize_zeroes(sector, nr_sectors);
            }
            return Ok(());
        }

        let buf_size = f.get_be64();
        f.error()?;
        // Cancelled bitmaps are still consumed, so bound the allocation
        // before anything else.
        if buf_size > MAX_BUF_SIZE {
            return Err(DirtyBitmapMigError::OversizedBuffer(buf_size));
        }
        let mut buf = vec![0u8; buf_size as usize];
        f.get_buffer(&mut buf);
        f.error()?;

        if self.cancelled {
            return Ok(());
        }
        let Some(bitmap) = self.bitmap.clone() else {
            return Ok(());
        };
        let mut bm = bitmap.lock().unwrap();
        let needed = bm.serialization_size(sector, nr_sectors) as u64;
        if needed > buf_size || buf_size > align_up(needed, BUF_ALIGN) {
            drop(bm);
            warn!(log, "migrated bitmap granularity does not match destination";
                "device" => &self.node_name,
                "bitmap" => &self.bitmap_name,
                "buf_size" => buf_size,
                "expected" => needed);
            self.cancel(log);
            return Ok(());
        }
        bm.deserialize_part(&buf, sector, nr_sectors);
        Ok(())
    }

    fn load_complete(&mut self) -> Result<(), DirtyBitmapMigError> {
        if self.cancelled {
            return Ok(());
        }
        let Some(bitmap) = self.bitmap.clone() else {
            return Ok(());
        };
        {
            let mut bm = bitmap.lock().unwrap();
            if bm.has_successor() {
                bm.reclaim_successor().map_err(|source| {
                    DirtyBitmapMigError::Bitmap {
                        device: self.node_name.clone(),
                        bitmap: self.bitmap_name.clone(),
                        source,
                    }
                })?;
            }
        }

        let pos = self.bitmaps.iter().position(|b| Arc::ptr_eq(&b.bitmap, &bitmap));
        if let Some(pos) = pos {
            if self.before_vm_start_handled {
                self.bitmaps.remove(pos);
            } else {
                self.bitmaps[pos].migrated = true;
            }
        }
        Ok(())
    }

    fn before_vm_start(&mut self) {
        for b in self.bitmaps.iter() {
            if !b.enabled {
                continue;
            }
            let mut bm = b.bitmap.lock().unwrap();
            if b.migrated {
                bm.enable();
            } else if bm.enable_successor().is_err() {
                bm.enable();
            }
        }
        self.bitmaps.retain(|b| !b.migrated);
        self.before_vm_start_handled = true;
    }

    fn cancel(&mut self, log: &Logger) {
        if self.cancelled {
            return;
        }
        warn!(log, "cancelling incoming dirty bitmap migration";
            "bitmaps" => self.bitmaps.len());
        self.cancelled = true;
        self.node = None;
        self.bitmap = None;

        for b in self.bitmaps.drain(..) {
            {
                let mut bm = b.bitmap.lock().unwrap();
                if bm.has_successor() {
                    if let Err(e) = bm.reclaim_successor() {
                        warn!(log, "failed to reclaim successor";
                            "device" => b.node.name(),
                            "error" => %e);
                    }
                }
            }
            debug!(log, "releasing bitmap"; "device" => b.node.name());
            b.node.release_bitmap(&b.bitmap);
        }
    }
}
