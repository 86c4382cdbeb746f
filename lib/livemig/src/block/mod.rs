// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block nodes as seen by the migration engines.
//!
//! A [`BlockNode`] names a [`Backend`] and carries the dirty bitmaps which
//! track writes made through it.  Offsets throughout are 512-byte sectors.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex};

use slog::{info, Logger};

pub mod aio;
mod dirty;
mod file;
mod in_memory;

pub use dirty::{BitmapError, DirtyBitmap, MIN_GRANULARITY};
pub use file::FileBackend;
pub use in_memory::InMemoryBackend;

pub const BDRV_SECTOR_BITS: u32 = 9;
pub const BDRV_SECTOR_SIZE: u64 = 1 << BDRV_SECTOR_BITS;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Size of the device in sectors
    pub total_sectors: u64,
    pub read_only: bool,
}

/// Allocation status of the run of sectors starting at a queried offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockStatus {
    pub allocated: bool,
    /// Length of the run sharing `allocated`; at least one sector.
    pub sectors: u64,
}

/// Storage behind a block node.
pub trait Backend: Send + Sync + 'static {
    fn info(&self) -> DeviceInfo;

    /// Fill `buf` from the device starting at `sector`.
    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()>;

    fn write_zeroes(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        let len = usize::try_from(nr_sectors * BDRV_SECTOR_SIZE)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "range too large"))?;
        self.write(sector, &vec![0u8; len])
    }

    /// Report whether the sectors from `sector` (up to `max_sectors`) are
    /// allocated in this layer.  Backends without a notion of layering
    /// report everything as allocated.
    fn block_status(&self, sector: u64, max_sectors: u64) -> Result<BlockStatus> {
        let _ = sector;
        Ok(BlockStatus { allocated: true, sectors: max_sectors.max(1) })
    }

    fn flush(&self) -> Result<()>;
}

pub type BitmapRef = Arc<Mutex<DirtyBitmap>>;

pub struct BlockNode {
    name: String,
    backend: Arc<dyn Backend>,
    bitmaps: Mutex<Vec<BitmapRef>>,

    /// Reasons for which operations on this node are currently blocked.
    blockers: Mutex<Vec<&'static str>>,
}

impl BlockNode {
    pub fn new(name: &str, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            backend,
            bitmaps: Mutex::new(Vec::new()),
            blockers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> DeviceInfo {
        self.backend.info()
    }

    pub fn total_sectors(&self) -> u64 {
        self.backend.info().total_sectors
    }

    pub fn is_read_only(&self) -> bool {
        self.backend.info().read_only
    }

    pub fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.backend.read(sector, buf)
    }

    /// Write through the node, marking every bitmap which tracks it.
    pub fn write(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.backend.write(sector, buf)?;
        self.mark_dirty(sector, (buf.len() as u64).div_ceil(BDRV_SECTOR_SIZE));
        Ok(())
    }

    pub fn write_zeroes(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        self.backend.write_zeroes(sector, nr_sectors)?;
        self.mark_dirty(sector, nr_sectors);
        Ok(())
    }

    /// Store contents received from a migration source.  These are not
    /// guest writes, so no bitmap is marked.
    pub fn restore(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.backend.write(sector, buf)
    }

    pub fn restore_zeroes(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        self.backend.write_zeroes(sector, nr_sectors)
    }

    pub fn block_status(&self, sector: u64, max_sectors: u64) -> Result<BlockStatus> {
        self.backend.block_status(sector, max_sectors)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }

    pub fn mark_dirty(&self, sector: u64, nr_sectors: u64) {
        for bitmap in self.bitmaps.lock().unwrap().iter() {
            bitmap.lock().unwrap().mark(sector, nr_sectors);
        }
    }

    /// Attach a new bitmap sized to the device.  Named bitmaps must be
    /// unique on the node.
    pub fn create_bitmap(
        &self,
        name: Option<&str>,
        granularity: u32,
    ) -> std::result::Result<BitmapRef, BitmapError> {
        let mut bitmaps = self.bitmaps.lock().unwrap();
        if let Some(name) = name {
            let dup = bitmaps
                .iter()
                .any(|bm| bm.lock().unwrap().name() == Some(name));
            if dup {
                return Err(BitmapError::Exists(name.to_string()));
            }
        }
        let bitmap = Arc::new(Mutex::new(DirtyBitmap::new(
            name,
            granularity,
            self.total_sectors(),
        )?));
        bitmaps.push(bitmap.clone());
        Ok(bitmap)
    }

    pub fn find_bitmap(&self, name: &str) -> Option<BitmapRef> {
        self.bitmaps
            .lock()
            .unwrap()
            .iter()
            .find(|bm| bm.lock().unwrap().name() == Some(name))
            .cloned()
    }

    pub fn bitmaps(&self) -> Vec<BitmapRef> {
        self.bitmaps.lock().unwrap().clone()
    }

    /// Detach `bitmap` from the node.  A busy bitmap cannot be removed, nor
    /// can any bitmap while the node is blocked.
    pub fn remove_bitmap(
        &self,
        bitmap: &BitmapRef,
    ) -> std::result::Result<(), BitmapError> {
        if let Some(reason) = self.op_blocker() {
            return Err(BitmapError::Blocked(reason));
        }
        bitmap.lock().unwrap().check_not_busy()?;
        self.release_bitmap(bitmap);
        Ok(())
    }

    /// Detach `bitmap` regardless of its busy state, for use by the owner
    /// which marked it busy.
    pub(crate) fn release_bitmap(&self, bitmap: &BitmapRef) {
        self.bitmaps.lock().unwrap().retain(|bm| !Arc::ptr_eq(bm, bitmap));
    }

    pub fn block_ops(&self, reason: &'static str) {
        self.blockers.lock().unwrap().push(reason);
    }

    pub fn unblock_ops(&self, reason: &'static str) {
        let mut blockers = self.blockers.lock().unwrap();
        if let Some(pos) = blockers.iter().position(|r| *r == reason) {
            blockers.remove(pos);
        }
    }

    /// Reason the node is blocked, if any.
    pub fn op_blocker(&self) -> Option<&'static str> {
        self.blockers.lock().unwrap().first().copied()
    }
}

/// The set of named block nodes known to a migration peer.
#[derive(Default)]
pub struct BlockGraph {
    nodes: Mutex<BTreeMap<String, Arc<BlockNode>>>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every device listed in `config`, attaching its bitmaps.
    pub fn from_config(
        config: &livemig_config::Config,
        log: &Logger,
    ) -> Result<Self> {
        let graph = Self::new();
        for (name, dev) in config.block_devs.iter() {
            let backend = FileBackend::create(&dev.path, Some(dev.read_only))?;
            let node = BlockNode::new(name, backend);
            for bitmap in dev.bitmaps.iter() {
                let bm = node
                    .create_bitmap(Some(&bitmap.name), bitmap.granularity)
                    .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
                bm.lock().unwrap().set_persistent(bitmap.persistent);
            }
            info!(log, "attached block device";
                "device" => name,
                "path" => dev.path.display().to_string(),
                "bitmaps" => dev.bitmaps.len());
            graph.add(node)?;
        }
        Ok(graph)
    }

    pub fn add(&self, node: Arc<BlockNode>) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(node.name()) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("block node {} already exists", node.name()),
            ));
        }
        nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<BlockNode>> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// All nodes, ordered by name.
    pub fn nodes(&self) -> Vec<Arc<BlockNode>> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }
}
