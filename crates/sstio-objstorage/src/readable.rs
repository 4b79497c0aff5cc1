//! Read access to objects

use sstio_common::Result;
use tokio_util::sync::CancellationToken;

/// An object opened for reading
///
/// Reads are positional and may be issued concurrently. Dropping the
/// readable closes it.
pub trait Readable: Send + Sync {
    /// Fill `buf` with the bytes at `offset`; reading past the end is an error
    fn read_at(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Object size in bytes
    fn size(&self) -> u64;

    /// Handle for a sequence of related reads, which can use readahead
    fn new_read_handle(&self) -> Box<dyn ReadHandle>;
}

/// Read handle with per-handle readahead state
pub trait ReadHandle: Send {
    fn read_at(&mut self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()>;

    /// The remaining reads are part of a compaction and known to be
    /// sequential
    fn setup_for_compaction(&mut self);

    /// A block was served from a cache above the provider; keeps the
    /// readahead heuristic informed
    fn record_cache_hit(&mut self, offset: u64, len: u64);
}
