//! SSTIO object storage provider
//!
//! Manages the on-disk and remote objects (sorted tables and blob files) of an
//! LSM engine. Objects are identified by a file type and a file number and
//! live either as files in a local directory or as objects on remote storage,
//! possibly shared between several provider instances.
//!
//! - Local objects: `NNNNNN.sst` / `NNNNNN.blob` in the provider directory
//! - Remote objects: named `<hash>-<creator>-<file num>.<ext>`, recorded in
//!   the remote object catalog, reference counted with marker objects
//! - Readahead: per-handle sequential read detection driving OS hints for
//!   local files and buffered prefetch for remote objects
//! - Backings: encoded descriptions that let another provider attach a
//!   remote object
//! - Scans: read-only listing of a provider directory for inspection tools

pub mod backing;
pub mod cache;
pub mod cleaner;
pub mod leaktrack;
pub mod local;
pub mod logger;
pub mod metadata;
pub mod naming;
pub mod options;
pub mod provider;
pub mod readable;
pub mod readahead;
pub mod remote;
pub mod scan;
pub mod settings;
pub mod writable;

pub use backing::{RemoteObjectBacking, RemoteObjectBackingHandle};
pub use cache::{ReadFlags, SharedCache, SharedCacheMetrics};
pub use cleaner::{ArchiveCleaner, Cleaner, DeleteCleaner};
pub use leaktrack::HandleTracker;
pub use logger::{Logger, TracingLogger};
pub use metadata::{ObjectBacking, ObjectMetadata, RemoteBacking};
pub use options::{CreateOptions, OpenOptions, RemoteObjectToAttach};
pub use provider::Provider;
pub use readable::{ReadHandle, Readable};
pub use readahead::ReadaheadState;
pub use scan::DirectoryScan;
pub use settings::Settings;
pub use writable::Writable;
