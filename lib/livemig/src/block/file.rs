// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{metadata, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::block::{self, DeviceInfo, BDRV_SECTOR_SIZE};

/// A block backend over a plain file or raw device.
pub struct FileBackend {
    fp: File,
    info: DeviceInfo,
}

impl FileBackend {
    /// Opens the file at `path`.  With `read_only` of `None` the file's own
    /// permissions decide.
    pub fn create(
        path: impl AsRef<Path>,
        read_only: Option<bool>,
    ) -> Result<Arc<Self>> {
        let p: &Path = path.as_ref();

        let meta = metadata(p)?;
        let read_only = match (read_only, meta.permissions().readonly()) {
            (Some(false), true) => Err(Error::new(
                ErrorKind::Other,
                "writeable backend with read-only file not allowed",
            )),
            (Some(ro), false) => Ok(ro),
            (_, file_ro) => Ok(file_ro),
        }?;

        let fp = OpenOptions::new().read(true).write(!read_only).open(p)?;
        let len = fp.metadata()?.len();

        Ok(Arc::new(Self {
            fp,
            info: DeviceInfo { total_sectors: len / BDRV_SECTOR_SIZE, read_only },
        }))
    }
}

impl block::Backend for FileBackend {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.fp.read_exact_at(buf, sector * BDRV_SECTOR_SIZE)
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.info.read_only {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "backend is read-only",
            ));
        }
        self.fp.write_all_at(buf, sector * BDRV_SECTOR_SIZE)
    }

    fn flush(&self) -> Result<()> {
        self.fp.sync_data()
    }
}
