//! SSTIO Catalog - Durable catalog of remote objects
//!
//! Local objects are discovered by listing the data directory; remote objects
//! have no local trace, so their metadata is kept in an append-only log in the
//! data directory:
//! - Edits are bincode-encoded and framed with a CRC32C checksum
//! - Replay stops at the first torn or corrupt record and truncates it
//! - The log is periodically rewritten as a single snapshot edit
//!
//! The catalog also records the creator ID of the provider, which can be set
//! only once.

pub mod batch;
pub mod catalog;
pub mod edit;
pub mod log;

pub use batch::{BatchOp, CatalogBatch, RemoteObjectMetadata};
pub use catalog::{CATALOG_FILENAME, CatalogContents, RemoteCatalog};
pub use edit::CatalogEdit;
pub use log::{CatalogLog, LogRecord};
