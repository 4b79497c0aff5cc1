//! Readahead heuristic
//!
//! Tracks the reads issued through one read handle and decides when the
//! access pattern is sequential enough to prefetch. A read is sequential if it
//! overlaps the window `[limit, limit + max_readahead_size]`, where `limit` is
//! the offset up to which readahead has already been requested; the window
//! tolerates small gaps such as skipped index blocks.
//!
//! Once `MIN_READS_FOR_READAHEAD` sequential reads have been seen, every read
//! reaching the window asks for a prefetch and doubles the next prefetch size,
//! up to the maximum. A read far away from the window resets the state.

use sstio_common::INITIAL_READAHEAD_SIZE;

/// Sequential reads required before any prefetch is requested
pub const MIN_READS_FOR_READAHEAD: u64 = 2;

/// Per-handle readahead state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadaheadState {
    /// Consecutive sequential reads
    num_reads: u64,
    /// Size of the next prefetch
    size: u64,
    /// Size of the last prefetch
    prev_size: u64,
    /// Offset up to which readahead has been requested
    limit: u64,
    max_readahead_size: u64,
}

impl ReadaheadState {
    #[must_use]
    pub const fn new(max_readahead_size: u64) -> Self {
        Self {
            num_reads: 0,
            size: INITIAL_READAHEAD_SIZE,
            prev_size: 0,
            limit: 0,
            max_readahead_size,
        }
    }

    /// Record a read of `len` bytes at `offset`
    ///
    /// Returns the number of bytes the caller should prefetch starting at
    /// `offset`, or 0 for no prefetch.
    pub fn maybe_readahead(&mut self, offset: u64, len: u64) -> u64 {
        let end = offset.saturating_add(len);
        if self.num_reads >= MIN_READS_FOR_READAHEAD {
            if self.in_window(offset, end) {
                self.num_reads += 1;
                self.limit = offset.saturating_add(self.size);
                self.prev_size = self.size;
                self.size = (self.size * 2).min(self.max_readahead_size);
                return self.prev_size;
            }
            if self.far_from_window(offset, end) {
                self.reset(end);
                return 0;
            }
            // Inside the range already prefetched
            self.num_reads += 1;
            return 0;
        }

        if self.in_window(offset, end) {
            self.num_reads += 1;
        } else {
            self.reset(end);
        }
        0
    }

    /// Record a read that was served from a cache
    ///
    /// Keeps the sequential-read bookkeeping up to date without ever asking
    /// for a prefetch.
    pub fn record_cache_hit(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        if self.num_reads >= MIN_READS_FOR_READAHEAD {
            if self.in_window(offset, end) {
                self.limit = end;
                self.num_reads += 1;
            } else if self.far_from_window(offset, end) {
                self.reset(end);
            } else {
                self.num_reads += 1;
            }
            return;
        }

        if self.in_window(offset, end) {
            self.num_reads += 1;
        } else {
            self.reset(end);
        }
    }

    fn in_window(&self, offset: u64, end: u64) -> bool {
        end >= self.limit && offset <= self.limit.saturating_add(self.max_readahead_size)
    }

    fn far_from_window(&self, offset: u64, end: u64) -> bool {
        end < self.limit.saturating_sub(self.prev_size)
            || offset > self.limit.saturating_add(self.max_readahead_size)
    }

    fn reset(&mut self, end: u64) {
        self.num_reads = 1;
        self.limit = end;
        self.size = INITIAL_READAHEAD_SIZE;
        self.prev_size = 0;
    }

    #[must_use]
    pub const fn num_reads(&self) -> u64 {
        self.num_reads
    }

    /// Size the next prefetch would have
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn prev_size(&self) -> u64 {
        self.prev_size
    }

    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub const fn max_readahead_size(&self) -> u64 {
        self.max_readahead_size
    }
}
