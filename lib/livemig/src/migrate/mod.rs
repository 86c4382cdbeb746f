// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live state handlers.
//!
//! A live handler streams its state across several passes: a setup pass, any
//! number of iterations while the guest keeps running, and a final pass once
//! it has stopped.  The orchestrator drives every registered handler through
//! [`SaveVmHandlers`] and the destination feeds each received section back
//! through [`SaveVmHandlers::load_state`].

use std::sync::Arc;

use slog::Logger;
use thiserror::Error;

use crate::block::aio::{AioSubmit, InlineAio, ThreadedAio};
use crate::block::BlockGraph;
use crate::savevm::{Registry, SaveVmError};
use crate::stream::{Stream, StreamError};
use crate::vmstate::VmStateError;

pub mod block;
pub mod dirty_bitmap;

pub use self::block::{BlockMigError, BlockMigration};
pub use dirty_bitmap::{DirtyBitmapMigError, DirtyBitmapMigration};

/// Errors surfaced by a live handler to the orchestrator.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("block migration: {0}")]
    Block(#[from] BlockMigError),

    #[error("dirty bitmap migration: {0}")]
    DirtyBitmap(#[from] DirtyBitmapMigError),

    #[error("device state: {0}")]
    VmState(#[from] VmStateError),

    #[error("stream: {0}")]
    Stream(#[from] StreamError),
}

/// Estimate of the bytes a handler still has to send.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Pending {
    /// Must be sent before the guest can run on the destination.
    pub precopy: u64,

    /// May be sent after the guest resumes on the destination.
    pub postcopy: u64,
}

impl Pending {
    pub fn total(&self) -> u64 {
        self.precopy + self.postcopy
    }
}

impl std::ops::AddAssign for Pending {
    fn add_assign(&mut self, rhs: Self) {
        self.precopy += rhs.precopy;
        self.postcopy += rhs.postcopy;
    }
}

pub trait SaveVmHandlers: Send {
    fn save_setup(&mut self, f: &mut Stream) -> Result<(), MigrateError>;

    /// Send another increment of state.  Returns true once the handler has
    /// nothing left to send before completion.
    fn save_live_iterate(&mut self, f: &mut Stream) -> Result<bool, MigrateError>;

    fn save_live_complete_precopy(
        &mut self,
        f: &mut Stream,
    ) -> Result<(), MigrateError>;

    fn save_live_complete_postcopy(
        &mut self,
        f: &mut Stream,
    ) -> Result<(), MigrateError> {
        self.save_live_complete_precopy(f)
    }

    /// Remaining data, given the amount the orchestrator could still send
    /// within its downtime limit.
    fn save_pending(&mut self, max_size: u64) -> Pending;

    /// Release everything acquired in setup.  Safe to call more than once.
    fn save_cleanup(&mut self);

    fn load_state(
        &mut self,
        f: &mut Stream,
        version_id: i32,
    ) -> Result<(), MigrateError>;

    fn is_active(&self) -> bool {
        true
    }

    fn is_active_iterate(&self) -> bool {
        self.is_active()
    }

    /// Whether completion may be deferred to the postcopy phase.
    fn has_postcopy(&self) -> bool {
        false
    }

    /// The source has switched to postcopy.
    fn enter_postcopy(&mut self) {}

    /// The destination is about to resume the guest.
    fn before_vm_start(&mut self) {}
}

pub const BLOCK_SECTION: &str = "block";
pub const DIRTY_BITMAP_SECTION: &str = "dirty-bitmap";

/// Register the storage handlers enabled by `config` with `registry`.
pub fn register_storage_handlers(
    registry: &mut Registry,
    graph: Arc<BlockGraph>,
    config: &livemig_config::Config,
    log: &Logger,
) -> Result<(), SaveVmError> {
    let caps = &config.capabilities;
    if caps.dirty_bitmaps {
        let dbm = DirtyBitmapMigration::new(graph.clone(), log);
        registry.register_live(DIRTY_BITMAP_SECTION, 0, 1, Box::new(dbm))?;
    }
    if caps.block || caps.block_incremental {
        let aio: Arc<dyn AioSubmit> = if config.parameters.read_workers.get() > 1 {
            Arc::new(ThreadedAio::new(config.parameters.read_workers, log)?)
        } else {
            Arc::new(InlineAio)
        };
        let blk = BlockMigration::new(
            graph,
            aio,
            self::block::BlockMigConfig {
                shared_base: caps.block_incremental,
                zero_blocks: caps.zero_blocks,
            },
            log,
        );
        registry.register_live(BLOCK_SECTION, 0, 1, Box::new(blk))?;
    }
    registry.set_max_bandwidth(config.parameters.max_bandwidth);
    registry.set_postcopy(caps.postcopy);
    Ok(())
}
