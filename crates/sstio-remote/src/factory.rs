//! Resolution of locators to storage clients

use crate::storage::RemoteStorage;
use sstio_common::{Error, Locator, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Creates the storage client for a locator
pub trait StorageFactory: Send + Sync + fmt::Debug {
    fn create_storage(&self, locator: &Locator) -> Result<Arc<dyn RemoteStorage>>;
}

/// Factory backed by a fixed table of clients
#[derive(Debug, Default, Clone)]
pub struct SimpleStorageFactory {
    storages: HashMap<Locator, Arc<dyn RemoteStorage>>,
}

impl SimpleStorageFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client for a locator
    #[must_use]
    pub fn with_storage(mut self, locator: impl Into<Locator>, storage: Arc<dyn RemoteStorage>) -> Self {
        self.storages.insert(locator.into(), storage);
        self
    }

    /// Register the client for a locator
    pub fn insert(&mut self, locator: impl Into<Locator>, storage: Arc<dyn RemoteStorage>) {
        self.storages.insert(locator.into(), storage);
    }
}

impl StorageFactory for SimpleStorageFactory {
    fn create_storage(&self, locator: &Locator) -> Result<Arc<dyn RemoteStorage>> {
        self.storages.get(locator).cloned().ok_or_else(|| {
            Error::Configuration(format!("no remote storage for locator {locator:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    #[test]
    fn test_resolve_locators() {
        let shared: Arc<dyn RemoteStorage> = Arc::new(InMemoryStorage::new());
        let factory = SimpleStorageFactory::new()
            .with_storage("", Arc::clone(&shared))
            .with_storage("bucket-b", Arc::new(InMemoryStorage::new()));

        let a = factory.create_storage(&Locator::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &shared));
        assert!(factory.create_storage(&Locator::new("bucket-b")).is_ok());

        let err = factory.create_storage(&Locator::new("missing")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
