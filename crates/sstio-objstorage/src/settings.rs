//! Provider settings

use crate::cleaner::{Cleaner, DeleteCleaner};
use crate::logger::{Logger, TracingLogger};
use sstio_common::ProviderConfig;
use sstio_remote::StorageFactory;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything needed to open a provider
#[derive(Clone, Debug)]
pub struct Settings {
    /// Directory holding local objects and the remote object catalog
    pub dir: PathBuf,
    /// Directory listing the caller already has, to avoid listing again
    pub initial_listing: Option<Vec<String>>,
    pub config: ProviderConfig,
    pub logger: Arc<dyn Logger>,
    /// Disposal of removed local objects
    pub cleaner: Arc<dyn Cleaner>,
    /// Remote storage clients; `None` disables remote objects
    pub storage_factory: Option<Arc<dyn StorageFactory>>,
}

impl Settings {
    /// Local-only settings with defaults
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            initial_listing: None,
            config: ProviderConfig::default(),
            logger: Arc::new(TracingLogger),
            cleaner: Arc::new(DeleteCleaner),
            storage_factory: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_initial_listing(mut self, listing: Vec<String>) -> Self {
        self.initial_listing = Some(listing);
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn with_cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    #[must_use]
    pub fn with_storage_factory(mut self, factory: Arc<dyn StorageFactory>) -> Self {
        self.storage_factory = Some(factory);
        self
    }

    /// Whether remote objects are enabled
    #[must_use]
    pub const fn remote_enabled(&self) -> bool {
        self.storage_factory.is_some()
    }
}
