//! Shared block cache for remote objects
//!
//! Remote reads are expensive, so reads of remote objects go through an
//! in-memory cache of fixed-size blocks keyed by object and block index.
//! Eviction is LRU over a logical clock, with blocks indexed by last access so
//! the victim is found without scanning. Reads flagged `read_only` (compaction
//! reads) use cached blocks but do not insert new ones.

use bytes::Bytes;
use parking_lot::Mutex;
use sstio_common::{DiskFileNum, Error, Result, SharedCacheConfig};
use sstio_remote::ObjectReader;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Flags for a cached read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Do not populate the cache with blocks fetched by this read
    pub read_only: bool,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedCacheMetrics {
    /// Reads served entirely from the cache
    pub full_hits: u64,
    /// Reads served partly from the cache
    pub partial_hits: u64,
    /// Reads that fetched every block
    pub misses: u64,
    /// Blocks evicted to make room
    pub evictions: u64,
    /// Bytes fetched from remote storage
    pub bytes_fetched: u64,
    /// Blocks currently cached
    pub cached_blocks: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    full_hits: AtomicU64,
    partial_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bytes_fetched: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    file_num: DiskFileNum,
    block: u64,
}

struct CacheEntry {
    data: Bytes,
    last_access: u64,
}

#[derive(Default)]
struct CacheIndex {
    blocks: HashMap<BlockKey, CacheEntry>,
    /// Blocks by last access; ticks are unique
    lru: BTreeMap<u64, BlockKey>,
    /// Logical clock for LRU ordering
    clock: u64,
}

impl CacheIndex {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &BlockKey) -> Option<Bytes> {
        let now = self.tick();
        let entry = self.blocks.get_mut(key)?;
        self.lru.remove(&entry.last_access);
        entry.last_access = now;
        self.lru.insert(now, *key);
        Some(entry.data.clone())
    }

    fn evict_lru(&mut self) -> bool {
        match self.lru.pop_first() {
            Some((_, key)) => {
                self.blocks.remove(&key);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: BlockKey, data: Bytes) {
        let now = self.tick();
        if let Some(old) = self.blocks.insert(key, CacheEntry { data, last_access: now }) {
            self.lru.remove(&old.last_access);
        }
        self.lru.insert(now, key);
    }

    fn remove_object(&mut self, file_num: DiskFileNum) {
        let lru = &mut self.lru;
        self.blocks.retain(|k, e| {
            if k.file_num == file_num {
                lru.remove(&e.last_access);
                false
            } else {
                true
            }
        });
    }
}

/// Block cache shared by all remote readables of a provider
pub struct SharedCache {
    index: Mutex<CacheIndex>,
    block_size: u64,
    max_blocks: usize,
    counters: CacheCounters,
}

impl SharedCache {
    pub fn new(config: &SharedCacheConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::Configuration("cache block size must be non-zero".into()));
        }
        let block_size = config.block_size as u64;
        let max_blocks = usize::try_from(config.size_bytes / block_size)
            .map_err(|_| Error::Configuration("cache too large".into()))?
            .max(1);
        Ok(Self {
            index: Mutex::new(CacheIndex::default()),
            block_size,
            max_blocks,
            counters: CacheCounters::default(),
        })
    }

    /// Read `buf.len()` bytes at `offset` of an object, using cached blocks
    /// where possible and fetching the rest through `reader`
    #[allow(clippy::too_many_arguments)]
    pub fn read_at(
        &self,
        ctx: &CancellationToken,
        file_num: DiskFileNum,
        buf: &mut [u8],
        offset: u64,
        reader: &dyn ObjectReader,
        object_size: u64,
        flags: ReadFlags,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= object_size)
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "read of {} bytes at offset {} beyond end of object {} ({} bytes)",
                        buf.len(),
                        offset,
                        file_num,
                        object_size
                    ),
                ))
            })?;

        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;
        let mut hits = 0u64;

        for block in first..=last {
            let key = BlockKey { file_num, block };
            let data = if let Some(data) = self.get(&key) {
                hits += 1;
                data
            } else {
                let data = self.fetch(ctx, reader, block, object_size)?;
                if !flags.read_only {
                    self.insert(key, data.clone());
                }
                data
            };

            // Copy the overlap of this block with the request
            let block_start = block * self.block_size;
            let copy_start = offset.max(block_start);
            let copy_end = end.min(block_start + data.len() as u64);
            let src = &data[to_usize(copy_start - block_start)..to_usize(copy_end - block_start)];
            let dst_start = to_usize(copy_start - offset);
            buf[dst_start..dst_start + src.len()].copy_from_slice(src);
        }

        let total = last - first + 1;
        let counter = if hits == total {
            &self.counters.full_hits
        } else if hits > 0 {
            &self.counters.partial_hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fetch(
        &self,
        ctx: &CancellationToken,
        reader: &dyn ObjectReader,
        block: u64,
        object_size: u64,
    ) -> Result<Bytes> {
        let start = block * self.block_size;
        let len = self.block_size.min(object_size - start);
        let mut data = vec![0u8; to_usize(len)];
        reader.read_at(ctx, &mut data, start)?;
        self.counters.bytes_fetched.fetch_add(len, Ordering::Relaxed);
        Ok(Bytes::from(data))
    }

    fn get(&self, key: &BlockKey) -> Option<Bytes> {
        self.index.lock().get(key)
    }

    fn insert(&self, key: BlockKey, data: Bytes) {
        let mut index = self.index.lock();
        if !index.blocks.contains_key(&key) {
            while index.blocks.len() >= self.max_blocks && index.evict_lru() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        index.insert(key, data);
    }

    /// Drop all cached blocks of an object
    pub fn evict_object(&self, file_num: DiskFileNum) {
        self.index.lock().remove_object(file_num);
    }

    #[must_use]
    pub fn metrics(&self) -> SharedCacheMetrics {
        SharedCacheMetrics {
            full_hits: self.counters.full_hits.load(Ordering::Relaxed),
            partial_hits: self.counters.partial_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            bytes_fetched: self.counters.bytes_fetched.load(Ordering::Relaxed),
            cached_blocks: self.index.lock().blocks.len(),
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub const fn max_blocks(&self) -> usize {
        self.max_blocks
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn to_usize(v: u64) -> usize {
    v as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use sstio_remote::{InMemoryStorage, RemoteStorage};
    use std::io::Write;

    const BLOCK: usize = 1024;

    fn setup(blocks: u64) -> (SharedCache, InMemoryStorage, Vec<u8>) {
        let cache = SharedCache::new(&SharedCacheConfig {
            size_bytes: blocks * BLOCK as u64,
            block_size: BLOCK,
        })
        .unwrap();
        let storage = InMemoryStorage::new();
        let data: Vec<u8> = (0..10 * BLOCK + 100).map(|i| (i % 251) as u8).collect();
        let mut w = storage.create_object("obj").unwrap();
        w.write_all(&data).unwrap();
        w.close().unwrap();
        (cache, storage, data)
    }

    fn read(
        cache: &SharedCache,
        storage: &InMemoryStorage,
        offset: usize,
        len: usize,
        flags: ReadFlags,
    ) -> Vec<u8> {
        let ctx = CancellationToken::new();
        let (reader, size) = storage.read_object(&ctx, "obj").unwrap();
        let mut buf = vec![0u8; len];
        cache
            .read_at(&ctx, DiskFileNum::new(1), &mut buf, offset as u64, reader.as_ref(), size, flags)
            .unwrap();
        buf
    }

    #[test]
    fn test_hit_accounting() {
        let (cache, storage, data) = setup(100);

        assert_eq!(read(&cache, &storage, 100, 1000, ReadFlags::default()), data[100..1100]);
        let m = cache.metrics();
        assert_eq!((m.full_hits, m.partial_hits, m.misses), (0, 0, 1));
        assert_eq!(m.bytes_fetched, 2 * BLOCK as u64);

        // Same blocks again
        assert_eq!(read(&cache, &storage, 0, 2 * BLOCK, ReadFlags::default()), data[..2 * BLOCK]);
        assert_eq!(cache.metrics().full_hits, 1);

        // One cached block, one new
        read(&cache, &storage, BLOCK + 10, BLOCK, ReadFlags::default());
        let m = cache.metrics();
        assert_eq!(m.partial_hits, 1);
        assert_eq!(m.cached_blocks, 3);

        // Tail block is short
        let tail = read(&cache, &storage, 10 * BLOCK, 100, ReadFlags::default());
        assert_eq!(tail, data[10 * BLOCK..]);
        assert_eq!(storage.bytes_read(), 3 * BLOCK as u64 + 100);
    }

    #[test]
    fn test_read_only_does_not_populate() {
        let (cache, storage, data) = setup(100);
        let flags = ReadFlags { read_only: true };
        assert_eq!(read(&cache, &storage, 0, 3 * BLOCK, flags), data[..3 * BLOCK]);
        assert_eq!(cache.metrics().cached_blocks, 0);

        // Read-only reads still use cached blocks
        read(&cache, &storage, 0, BLOCK, ReadFlags::default());
        read(&cache, &storage, 0, BLOCK, flags);
        assert_eq!(cache.metrics().full_hits, 1);
    }

    #[test]
    fn test_eviction_respects_capacity() {
        let (cache, storage, data) = setup(4);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let offset = rng.gen_range(0..data.len() - 1);
            let len = rng.gen_range(1..=(data.len() - offset).min(3 * BLOCK));
            let got = read(&cache, &storage, offset, len, ReadFlags::default());
            assert_eq!(got, data[offset..offset + len]);
            assert!(cache.metrics().cached_blocks <= 4);
        }
        assert!(cache.metrics().evictions > 0);

        cache.evict_object(DiskFileNum::new(1));
        assert_eq!(cache.metrics().cached_blocks, 0);
    }

    #[test]
    fn test_least_recently_used_block_evicted() {
        let (cache, storage, data) = setup(3);
        for block in 0..3 {
            read(&cache, &storage, block * BLOCK, BLOCK, ReadFlags::default());
        }
        // Block 0 becomes the most recently used
        read(&cache, &storage, 0, BLOCK, ReadFlags::default());
        read(&cache, &storage, 3 * BLOCK, BLOCK, ReadFlags::default());

        let m = cache.metrics();
        assert_eq!((m.cached_blocks, m.evictions), (3, 1));
        let fetched = storage.bytes_read();
        assert_eq!(read(&cache, &storage, 0, BLOCK, ReadFlags::default()), data[..BLOCK]);
        assert_eq!(storage.bytes_read(), fetched);

        // Block 1 was the victim
        read(&cache, &storage, BLOCK, BLOCK, ReadFlags::default());
        assert_eq!(storage.bytes_read(), fetched + BLOCK as u64);

        let index = cache.index.lock();
        assert_eq!(index.blocks.len(), index.lru.len());
    }

    #[test]
    fn test_read_past_end() {
        let (cache, storage, data) = setup(4);
        let ctx = CancellationToken::new();
        let (reader, size) = storage.read_object(&ctx, "obj").unwrap();
        let mut buf = vec![0u8; 10];
        let err = cache
            .read_at(&ctx, DiskFileNum::new(1), &mut buf, data.len() as u64 - 5, reader.as_ref(), size, ReadFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
