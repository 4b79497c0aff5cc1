//! In-memory remote storage
//!
//! Objects live in a sorted map of immutable buffers. Several providers can
//! share one instance (through `Arc`) to simulate a shared bucket.

use crate::storage::{ObjectReader, ObjectWriter, RemoteStorage, check_range, group_listing};
use bytes::Bytes;
use parking_lot::RwLock;
use sstio_common::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct MemStats {
    objects_created: AtomicU64,
    objects_deleted: AtomicU64,
    bytes_read: AtomicU64,
}

/// Remote storage kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
    stats: Arc<MemStats>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an object with this exact name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().contains_key(name)
    }

    /// Names of all objects, sorted
    #[must_use]
    pub fn object_names(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Number of objects stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Bytes served to readers so far
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read.load(Ordering::Relaxed)
    }

    /// Objects completed so far
    #[must_use]
    pub fn objects_created(&self) -> u64 {
        self.stats.objects_created.load(Ordering::Relaxed)
    }

    /// Objects deleted so far
    #[must_use]
    pub fn objects_deleted(&self) -> u64 {
        self.stats.objects_deleted.load(Ordering::Relaxed)
    }
}

impl RemoteStorage for InMemoryStorage {
    fn create_object(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(MemWriter {
            name: name.to_string(),
            buf: Vec::new(),
            objects: Arc::clone(&self.objects),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn read_object(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<(Box<dyn ObjectReader>, u64)> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let data = self
            .objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RemoteObjectNotFound {
                name: name.to_string(),
            })?;
        let size = data.len() as u64;
        let reader = MemReader {
            name: name.to_string(),
            data,
            stats: Arc::clone(&self.stats),
        };
        Ok((Box::new(reader), size))
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.objects.write().remove(name) {
            Some(_) => {
                self.stats.objects_deleted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::RemoteObjectNotFound {
                name: name.to_string(),
            }),
        }
    }

    fn list(&self, prefix: &str, delimiter: &str) -> Result<Vec<String>> {
        let objects = self.objects.read();
        Ok(group_listing(
            objects.keys().map(String::as_str),
            prefix,
            delimiter,
        ))
    }

    fn size(&self, name: &str) -> Result<u64> {
        self.objects
            .read()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::RemoteObjectNotFound {
                name: name.to_string(),
            })
    }
}

struct MemWriter {
    name: String,
    buf: Vec<u8>,
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
    stats: Arc<MemStats>,
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl ObjectWriter for MemWriter {
    fn close(self: Box<Self>) -> Result<()> {
        let Self {
            name,
            buf,
            objects,
            stats,
        } = *self;
        objects.write().insert(name, Bytes::from(buf));
        stats.objects_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct MemReader {
    name: String,
    data: Bytes,
    stats: Arc<MemStats>,
}

impl ObjectReader for MemReader {
    fn read_at(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        check_range(&self.name, offset, buf.len(), self.data.len() as u64)?;
        #[allow(clippy::cast_possible_truncation)]
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        self.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
