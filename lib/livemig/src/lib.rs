// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::style)]

pub extern crate livemig_config;

pub mod block;
pub mod migrate;
pub mod savevm;
pub mod stream;
pub mod vmstate;

pub use migrate::{Pending, SaveVmHandlers};
pub use savevm::Registry;
pub use stream::Stream;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
