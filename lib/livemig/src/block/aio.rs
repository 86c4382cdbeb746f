// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous reads from block nodes.
//!
//! The block migration engine hands each chunk read to an [`AioSubmit`]
//! implementation and learns of its completion through a callback, which
//! may run on any thread.

use std::io::Result;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use slog::{debug, Logger};

use crate::block::BlockNode;

/// Invoked once with the outcome of the read and the filled buffer.
pub type ReadDone = Box<dyn FnOnce(Result<()>, Vec<u8>) + Send + 'static>;

pub struct ReadRequest {
    pub node: Arc<BlockNode>,
    pub sector: u64,
    pub nr_sectors: u64,
    /// Destination for the data; at least `nr_sectors` sectors long.
    pub buf: Vec<u8>,
    pub done: ReadDone,
}

impl ReadRequest {
    /// Perform the read on the calling thread and complete the request.
    pub fn run(self) {
        let ReadRequest { node, sector, nr_sectors, mut buf, done } = self;
        let len = (nr_sectors * crate::block::BDRV_SECTOR_SIZE) as usize;
        let res = match buf.get_mut(..len) {
            Some(dst) => node.read(sector, dst),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "read buffer too small",
            )),
        };
        done(res, buf);
    }
}

pub trait AioSubmit: Send + Sync {
    fn submit(&self, req: ReadRequest);
}

/// Completes every read synchronously within `submit`.
#[derive(Default)]
pub struct InlineAio;

impl AioSubmit for InlineAio {
    fn submit(&self, req: ReadRequest) {
        req.run();
    }
}

/// Services reads on a fixed pool of worker threads.
pub struct ThreadedAio {
    tx: Option<Sender<ReadRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedAio {
    pub fn new(worker_count: NonZeroUsize, log: &Logger) -> Result<Self> {
        let (tx, rx) = unbounded::<ReadRequest>();
        let workers = (0..worker_count.get())
            .map(|n| {
                let rx = rx.clone();
                let log = log.new(slog::o!("aio_worker" => n));
                std::thread::Builder::new()
                    .name(format!("aio worker {n}"))
                    .spawn(move || {
                        while let Ok(req) = rx.recv() {
                            debug!(log, "read";
                                "device" => req.node.name(),
                                "sector" => req.sector,
                                "nr_sectors" => req.nr_sectors);
                            req.run();
                        }
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tx: Some(tx), workers })
    }
}

impl AioSubmit for ThreadedAio {
    fn submit(&self, req: ReadRequest) {
        // The channel only closes in drop, so a failed send is impossible
        // while `self` is alive; complete the request rather than lose it.
        if let Some(Err(err)) = self.tx.as_ref().map(|tx| tx.send(req)) {
            err.into_inner().run();
        }
    }
}

impl Drop for ThreadedAio {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
