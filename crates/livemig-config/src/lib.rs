// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for one live-migration session.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub parameters: Parameters,

    #[serde(default, rename = "block_dev")]
    pub block_devs: BTreeMap<String, BlockDevice>,
}

impl Config {
    /// Constructs a new configuration object.
    ///
    /// Typically, the configuration is parsed from a config file via
    /// [`parse`], but this method allows an alternative mechanism for
    /// initialization.
    pub fn new(
        capabilities: Capabilities,
        parameters: Parameters,
        block_devs: BTreeMap<String, BlockDevice>,
    ) -> Config {
        Config { capabilities, parameters, block_devs }
    }
}

/// Optional parts of the migration stream which both peers must agree on.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Capabilities {
    /// Migrate the contents of writable block devices.
    #[serde(default)]
    pub block: bool,

    /// Only transfer regions allocated in the top layer of each device,
    /// assuming the destination already has the shared base image.
    #[serde(default)]
    pub block_incremental: bool,

    /// Send all-zero block chunks as header-only records.
    #[serde(default)]
    pub zero_blocks: bool,

    /// Migrate named dirty bitmaps attached to block nodes.
    #[serde(default)]
    pub dirty_bitmaps: bool,

    /// Transfer dirty bitmap contents after the guest has been resumed on
    /// the destination rather than during the final stop-copy phase.
    #[serde(default)]
    pub postcopy: bool,
}

/// Tunables for a migration session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    /// Bytes which may be written to the stream per iteration window.
    /// Zero disables rate limiting.
    #[serde(default)]
    pub max_bandwidth: u64,

    /// Number of worker threads servicing asynchronous block reads.
    #[serde(default = "default_read_workers")]
    pub read_workers: NonZeroUsize,
}

fn default_read_workers() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(3)
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters { max_bandwidth: 0, read_workers: default_read_workers() }
    }
}

/// A block device backing file, attached as a named node.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BlockDevice {
    pub path: PathBuf,

    #[serde(default)]
    pub read_only: bool,

    /// Names and granularities of the dirty bitmaps to create on the node.
    #[serde(default, rename = "bitmap")]
    pub bitmaps: Vec<Bitmap>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Bitmap {
    pub name: String,

    #[serde(default = "default_granularity")]
    pub granularity: u32,

    #[serde(default)]
    pub persistent: bool,
}

fn default_granularity() -> u32 {
    65536
}

/// Errors which may be returned when parsing the migration configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bitmap {bitmap} on {device}: granularity {granularity} is not a power of two of at least 512")]
    Granularity { device: String, bitmap: String, granularity: u32 },

    #[error("Block device {0}: bitmap name must be 1 to 255 bytes")]
    BitmapName(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

/// Parses TOML text into a configuration object.
pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    for (name, dev) in cfg.block_devs.iter() {
        for bitmap in dev.bitmaps.iter() {
            if bitmap.name.is_empty() || bitmap.name.len() > 255 {
                return Err(ParseError::BitmapName(name.clone()));
            }
            if bitmap.granularity < 512 || !bitmap.granularity.is_power_of_two()
            {
                return Err(ParseError::Granularity {
                    device: name.clone(),
                    bitmap: bitmap.name.clone(),
                    granularity: bitmap.granularity,
                });
            }
        }
    }
    Ok(cfg)
}
