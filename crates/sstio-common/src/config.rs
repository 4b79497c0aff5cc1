//! Configuration types for SSTIO
//!
//! Everything here is plain data that can be loaded from TOML. Runtime
//! collaborators (storage factories, loggers, cleaners) are supplied
//! separately when the provider is opened.

use crate::error::{Error, Result};
use crate::types::Locator;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Initial readahead size for sequential reads (64 KiB)
pub const INITIAL_READAHEAD_SIZE: u64 = 64 * 1024;

/// Default cap on the readahead size (256 KiB)
pub const DEFAULT_MAX_READAHEAD_SIZE: u64 = 256 * 1024;

/// Root configuration for an object storage provider
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Local filesystem objects
    pub local: LocalConfig,
    /// Remote (shared) objects
    pub remote: RemoteConfig,
}

impl ProviderConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Configuration(format!("invalid config: {e}")))
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}

/// Local object configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Skip the fsync when a newly written object is finished; the caller
    /// manages durability itself
    pub no_sync_on_close: bool,
    /// Sync written data every this many bytes (0 = only on finish)
    pub bytes_per_sync: usize,
    /// Readahead behavior for local reads
    pub readahead: ReadaheadConfig,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            no_sync_on_close: false,
            bytes_per_sync: 512 * 1024, // 512 KB
            readahead: ReadaheadConfig::default(),
        }
    }
}

/// How a read handle performs readahead
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadaheadMode {
    /// Never read ahead
    Off,
    /// Issue explicit prefetch hints sized by the readahead heuristic
    #[default]
    SysReadahead,
    /// Like `SysReadahead`, but once the maximum readahead size is reached,
    /// hand over to the OS sequential readahead
    FadviseSequential,
}

/// Readahead configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadaheadConfig {
    /// Mode for ordinary reads, where the access pattern is guessed
    pub speculative: ReadaheadMode,
    /// Mode for reads known to be sequential (compactions)
    pub informed: ReadaheadMode,
    /// Cap on the prefetch size
    pub max_readahead_size: u64,
}

impl Default for ReadaheadConfig {
    fn default() -> Self {
        Self {
            speculative: ReadaheadMode::SysReadahead,
            informed: ReadaheadMode::FadviseSequential,
            max_readahead_size: DEFAULT_MAX_READAHEAD_SIZE,
        }
    }
}

/// Which new objects are placed on shared storage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOnSharedStrategy {
    /// Never create shared objects
    #[default]
    None,
    /// Create shared objects for the lower levels of the LSM only; the engine
    /// decides which objects qualify through `prefer_shared_storage`
    Lower,
    /// Create every eligible object on shared storage
    All,
}

/// Remote object configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Placement of new objects
    pub create_on_shared: CreateOnSharedStrategy,
    /// Locator used for newly created shared objects
    pub create_on_shared_locator: Locator,
    /// Verify our own ref marker whenever a shared object is opened
    /// (expensive; meant for testing)
    pub check_refs_on_open: bool,
    /// Readahead size used by compaction reads of remote objects
    pub compaction_readahead_size: u64,
    /// Block cache in front of remote reads
    pub cache: SharedCacheConfig,
    /// Remote object catalog
    pub catalog: CatalogConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            create_on_shared: CreateOnSharedStrategy::None,
            create_on_shared_locator: Locator::default(),
            check_refs_on_open: false,
            compaction_readahead_size: 1024 * 1024, // 1 MB
            cache: SharedCacheConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

/// Shared block cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedCacheConfig {
    /// Total cache size in bytes (0 disables the cache)
    pub size_bytes: u64,
    /// Cache block size
    pub block_size: usize,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            size_bytes: 0,
            block_size: 32 * 1024, // 32 KB
        }
    }
}

/// Remote object catalog configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Rewrite the catalog log once it grows beyond this size
    pub rotation_size_bytes: u64,
    /// Buffer size for catalog writes
    pub write_buffer_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            rotation_size_bytes: 4 * 1024 * 1024, // 4 MB
            write_buffer_size: 64 * 1024,         // 64 KB
        }
    }
}
