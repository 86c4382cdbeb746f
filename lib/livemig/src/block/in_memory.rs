// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex};

use bitvec::prelude::*;

use crate::block::{self, BlockStatus, DeviceInfo, BDRV_SECTOR_SIZE};

/// A block backend held entirely in memory.
///
/// When created sparse, the backend also tracks which sectors have been
/// written, modelling the top layer of an image chain whose unallocated
/// regions fall through to a shared base.
pub struct InMemoryBackend {
    state: Mutex<State>,
    info: DeviceInfo,
}

struct State {
    bytes: Vec<u8>,
    allocated: Option<BitVec<u64, Lsb0>>,
}

impl InMemoryBackend {
    pub fn create(bytes: Vec<u8>, read_only: bool) -> Result<Arc<Self>> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::Other, "size cannot be 0"));
        } else if (len as u64 % BDRV_SECTOR_SIZE) != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "size {} not multiple of sector size {}!",
                    len, BDRV_SECTOR_SIZE,
                ),
            ));
        }

        let info = DeviceInfo {
            total_sectors: len as u64 / BDRV_SECTOR_SIZE,
            read_only,
        };
        Ok(Arc::new(Self {
            state: Mutex::new(State { bytes, allocated: None }),
            info,
        }))
    }

    /// A zero-filled backend of `total_sectors` with nothing allocated.
    pub fn create_sparse(total_sectors: u64) -> Result<Arc<Self>> {
        let backend = Self::create(
            vec![0u8; (total_sectors * BDRV_SECTOR_SIZE) as usize],
            false,
        )?;
        backend.state.lock().unwrap().allocated =
            Some(bitvec![u64, Lsb0; 0; total_sectors as usize]);
        Ok(backend)
    }

    /// Copy of the current device contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().unwrap().bytes.clone()
    }

    fn range(&self, sector: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = sector
            .checked_mul(BDRV_SECTOR_SIZE)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "bad offset"))?;
        let end = start + len;
        if end as u64 > self.info.total_sectors * BDRV_SECTOR_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "request beyond end of device",
            ));
        }
        Ok(start..end)
    }
}

impl block::Backend for InMemoryBackend {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(sector, buf.len())?;
        let state = self.state.lock().unwrap();
        buf.copy_from_slice(&state.bytes[range]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.info.read_only {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "backend is read-only",
            ));
        }
        let range = self.range(sector, buf.len())?;
        let mut state = self.state.lock().unwrap();
        state.bytes[range].copy_from_slice(buf);
        if let Some(alloc) = state.allocated.as_mut() {
            let first = sector as usize;
            let last = first + (buf.len() as u64).div_ceil(BDRV_SECTOR_SIZE) as usize;
            alloc[first..last].fill(true);
        }
        Ok(())
    }

    fn block_status(&self, sector: u64, max_sectors: u64) -> Result<BlockStatus> {
        let state = self.state.lock().unwrap();
        let Some(alloc) = state.allocated.as_ref() else {
            return Ok(BlockStatus { allocated: true, sectors: max_sectors.max(1) });
        };
        let start = sector as usize;
        if start >= alloc.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "status beyond end of device",
            ));
        }
        let end = (start + max_sectors.max(1) as usize).min(alloc.len());
        let allocated = alloc[start];
        let run = alloc[start..end]
            .iter()
            .position(|b| *b != allocated)
            .unwrap_or(end - start);
        Ok(BlockStatus { allocated, sectors: run as u64 })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
