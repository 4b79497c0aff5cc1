//! SSTIO Remote - Remote object storage clients
//!
//! This crate defines the interface the object storage provider uses to talk
//! to shared blob stores, plus two implementations:
//! - `InMemoryStorage`: process-local store, mainly for tests and tools
//! - `LocalDirStorage`: a directory on a (possibly network) filesystem
//!
//! Clients are resolved from a `Locator` through a `StorageFactory`.

pub mod factory;
pub mod localfs;
pub mod mem;
pub mod storage;

pub use factory::{SimpleStorageFactory, StorageFactory};
pub use localfs::LocalDirStorage;
pub use mem::InMemoryStorage;
pub use storage::{ObjectReader, ObjectWriter, RemoteStorage, group_listing};
