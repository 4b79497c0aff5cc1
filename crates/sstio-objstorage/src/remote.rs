//! Remote object backend
//!
//! Shared objects are reference counted with marker objects: every provider
//! using a shared object owns an empty marker named
//! `<object>.ref.<creator id>.<file num>`. A provider drops its reference by
//! deleting its marker; whoever then finds no markers left deletes the object.
//! External objects (`NoCleanup`) have no markers and are never deleted.

use crate::cache::{ReadFlags, SharedCache};
use crate::leaktrack::TrackedHandle;
use crate::metadata::{ObjectBacking, ObjectMetadata, RemoteBacking};
use crate::naming::{ref_marker_name, ref_marker_prefix, remote_object_name};
use crate::options::{CreateOptions, OpenOptions};
use crate::provider::Provider;
use crate::readable::{ReadHandle, Readable};
use crate::readahead::ReadaheadState;
use crate::writable::{AbortHook, Writable};
use sstio_common::{CleanupMethod, DiskFileNum, Error, FileType, Locator, Result, ResultExt};
use sstio_remote::{ObjectReader, ObjectWriter, RemoteStorage};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Provider {
    /// Create a new object on remote storage
    pub(crate) fn remote_create(
        &self,
        file_type: FileType,
        file_num: DiskFileNum,
        locator: &Locator,
        opts: CreateOptions,
    ) -> Result<(Box<dyn Writable>, ObjectMetadata)> {
        let creator_id = self.check_shared_initialized()?;
        let storage = self.ensure_storage(locator)?;
        let remote = RemoteBacking {
            creator_id,
            creator_file_num: file_num,
            cleanup_method: opts.shared_cleanup_method,
            locator: locator.clone(),
            custom_object_name: None,
            storage: Arc::clone(&storage),
        };
        let object_name = remote_object_name(file_type, &remote);
        let marker = (remote.cleanup_method == CleanupMethod::RefTracking)
            .then(|| ref_marker_name(&object_name, creator_id, file_num));
        let writer = storage.create_object(&object_name)?;

        let provider = self.clone();
        let writable = RemoteWritable {
            storage,
            object_name,
            writer: Some(writer),
            marker,
            on_abort: Some(Box::new(move || {
                provider.remove_metadata(file_num);
            })),
        };
        let meta = ObjectMetadata {
            file_num,
            file_type,
            backing: ObjectBacking::Remote(remote),
        };
        Ok((Box::new(writable), meta))
    }

    /// Open a remote object for reading
    pub(crate) fn remote_open(
        &self,
        meta: &ObjectMetadata,
        remote: &RemoteBacking,
        opts: OpenOptions,
    ) -> Result<Box<dyn Readable>> {
        let settings = &self.inner.settings;
        let storage = &remote.storage;
        let object_name = remote_object_name(meta.file_type, remote);

        if settings.config.remote.check_refs_on_open
            && remote.cleanup_method == CleanupMethod::RefTracking
        {
            let creator_id = self.check_shared_initialized()?;
            let marker = ref_marker_name(&object_name, creator_id, meta.file_num);
            if let Err(e) = storage.size(&marker) {
                if storage.is_not_exist_error(&e) {
                    if opts.must_exist {
                        settings
                            .logger
                            .fatal(&format!("marker object {marker} does not exist"));
                    }
                    return Err(Error::MarkerMissing { name: marker });
                }
                return Err(e.context(format!("checking marker object {marker}")));
            }
        }

        let ctx = CancellationToken::new();
        let (reader, size) = match storage.read_object(&ctx, &object_name) {
            Ok(opened) => opened,
            Err(e) => {
                if opts.must_exist && storage.is_not_exist_error(&e) {
                    settings
                        .logger
                        .fatal(&format!("object {object_name} does not exist"));
                }
                return Err(e);
            }
        };

        let object = RemoteObject {
            reader,
            size,
            file_num: meta.file_num,
            cache: self.inner.cache.clone(),
        };
        Ok(Box::new(RemoteReadable {
            object: Arc::new(object),
            max_readahead_size: settings.config.local.readahead.max_readahead_size,
            compaction_readahead_size: settings.config.remote.compaction_readahead_size,
            _tracked: self.inner.tracker.track(meta.file_num),
        }))
    }

    /// Drop this provider's reference to a remote object, unless the object
    /// is protected, in which case the unref runs once the last protection
    /// is released
    pub(crate) fn remote_unref(&self, meta: &ObjectMetadata, remote: &RemoteBacking) -> Result<()> {
        if remote.cleanup_method != CleanupMethod::RefTracking {
            return Ok(());
        }
        {
            let mut state = self.inner.state.write();
            if state
                .protected_objects
                .get(&meta.file_num)
                .is_some_and(|&count| count > 0)
            {
                info!(
                    "Object {} is protected; deferring removal of its ref marker",
                    meta.file_num
                );
                state.deferred_unrefs.insert(meta.file_num, meta.clone());
                return Ok(());
            }
        }
        self.remote_unref_now(meta, remote)
    }

    pub(crate) fn remote_unref_now(&self, meta: &ObjectMetadata, remote: &RemoteBacking) -> Result<()> {
        let creator_id = self.check_shared_initialized()?;
        let object_name = remote_object_name(meta.file_type, remote);
        let marker = ref_marker_name(&object_name, creator_id, meta.file_num);
        unref_object(remote.storage.as_ref(), &object_name, &marker)
    }
}

/// Create an empty marker object
pub(crate) fn create_marker(storage: &dyn RemoteStorage, marker: &str) -> Result<()> {
    storage
        .create_object(marker)
        .and_then(|writer| writer.close())
        .with_context(|| format!("creating marker object {marker}"))
}

/// Delete `marker`, then delete the object if no other markers remain
pub(crate) fn unref_object(storage: &dyn RemoteStorage, object_name: &str, marker: &str) -> Result<()> {
    if let Err(e) = storage.delete(marker) {
        if !storage.is_not_exist_error(&e) {
            return Err(e.context(format!("deleting marker object {marker}")));
        }
        debug!("Marker {} already gone", marker);
    }

    let remaining = storage
        .list(&ref_marker_prefix(object_name), "")
        .with_context(|| format!("listing markers of {object_name}"))?;
    if !remaining.is_empty() {
        debug!(
            "Object {} still has {} references",
            object_name,
            remaining.len()
        );
        return Ok(());
    }

    match storage.delete(object_name) {
        Ok(()) => {
            debug!("Deleted remote object {}", object_name);
            Ok(())
        }
        Err(e) if storage.is_not_exist_error(&e) => Ok(()),
        Err(e) => Err(e.context(format!("deleting remote object {object_name}"))),
    }
}

/// Writer for a new remote object
pub(crate) struct RemoteWritable {
    storage: Arc<dyn RemoteStorage>,
    object_name: String,
    /// `None` once finished or aborted
    writer: Option<Box<dyn ObjectWriter>>,
    /// Marker created once the object is complete (ref-tracked objects)
    marker: Option<String>,
    on_abort: Option<AbortHook>,
}

impl Writable for RemoteWritable {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::internal("write to a closed object"))?;
        writer
            .write_all(data)
            .with_context(|| format!("writing {}", self.object_name))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::internal("object already closed"))?;
        writer
            .close()
            .with_context(|| format!("uploading {}", self.object_name))?;
        if let Some(marker) = &self.marker {
            create_marker(self.storage.as_ref(), marker)?;
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                debug!("Closing aborted upload {} failed: {}", self.object_name, e);
            }
        }
        match self.storage.delete(&self.object_name) {
            Err(e) if !self.storage.is_not_exist_error(&e) => {
                warn!("Failed to delete aborted object {}: {}", self.object_name, e);
            }
            _ => {}
        }
        if let Some(on_abort) = self.on_abort.take() {
            on_abort();
        }
    }
}

/// An open remote object, shared by its readable and read handles
struct RemoteObject {
    reader: Box<dyn ObjectReader>,
    size: u64,
    file_num: DiskFileNum,
    cache: Option<Arc<SharedCache>>,
}

impl RemoteObject {
    fn read(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64, flags: ReadFlags) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match &self.cache {
            Some(cache) => cache.read_at(
                ctx,
                self.file_num,
                buf,
                offset,
                self.reader.as_ref(),
                self.size,
                flags,
            ),
            None => self.reader.read_at(ctx, buf, offset),
        }
    }
}

/// Remote object opened for reading
pub(crate) struct RemoteReadable {
    object: Arc<RemoteObject>,
    max_readahead_size: u64,
    compaction_readahead_size: u64,
    _tracked: TrackedHandle,
}

impl Readable for RemoteReadable {
    fn read_at(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()> {
        self.object.read(ctx, buf, offset, ReadFlags::default())
    }

    fn size(&self) -> u64 {
        self.object.size
    }

    fn new_read_handle(&self) -> Box<dyn ReadHandle> {
        Box::new(RemoteReadHandle {
            object: Arc::clone(&self.object),
            state: ReadaheadState::new(self.max_readahead_size),
            for_compaction: false,
            compaction_readahead_size: self.compaction_readahead_size,
            buffer: Vec::new(),
            buffer_offset: 0,
        })
    }
}

/// Read handle for a remote object
///
/// Readahead is done by reading more than requested into a buffer that
/// serves the following reads.
struct RemoteReadHandle {
    object: Arc<RemoteObject>,
    state: ReadaheadState,
    for_compaction: bool,
    compaction_readahead_size: u64,
    buffer: Vec<u8>,
    /// Object offset of `buffer[0]`
    buffer_offset: u64,
}

impl RemoteReadHandle {
    const fn flags(&self) -> ReadFlags {
        ReadFlags {
            read_only: self.for_compaction,
        }
    }
}

impl ReadHandle for RemoteReadHandle {
    fn read_at(&mut self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()> {
        let len = buf.len() as u64;
        let end = offset.checked_add(len).ok_or_else(|| {
            Error::invalid_argument(format!("read of {len} bytes at offset {offset} overflows"))
        })?;
        let readahead = if self.for_compaction {
            self.compaction_readahead_size
        } else {
            self.state.maybe_readahead(offset, len)
        };

        if !self.buffer.is_empty() {
            let buffer_end = self.buffer_offset.saturating_add(self.buffer.len() as u64);
            if self.buffer_offset <= offset && end <= buffer_end {
                let start = usize::try_from(offset - self.buffer_offset)
                    .map_err(|_| Error::internal("readahead buffer offset overflow"))?;
                buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
                return Ok(());
            }
            // Only forward sequential reads are served from the buffer
            self.buffer.clear();
        }

        // Don't read past the end of the object
        let readahead = readahead.min(self.object.size.saturating_sub(offset));
        if readahead > len {
            let size = usize::try_from(readahead)
                .map_err(|_| Error::internal("readahead size overflow"))?;
            self.buffer.resize(size, 0);
            let flags = self.flags();
            if let Err(e) = self.object.read(ctx, &mut self.buffer, offset, flags) {
                self.buffer.clear();
                return Err(e);
            }
            self.buffer_offset = offset;
            buf.copy_from_slice(&self.buffer[..buf.len()]);
            return Ok(());
        }

        self.object.read(ctx, buf, offset, self.flags())
    }

    fn setup_for_compaction(&mut self) {
        self.for_compaction = true;
    }

    fn record_cache_hit(&mut self, offset: u64, len: u64) {
        if !self.for_compaction {
            self.state.record_cache_hit(offset, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaktrack::HandleTracker;
    use sstio_common::SharedCacheConfig;
    use sstio_remote::InMemoryStorage;

    fn put(storage: &InMemoryStorage, name: &str, data: &[u8]) {
        let mut w = storage.create_object(name).unwrap();
        w.write_all(data).unwrap();
        w.close().unwrap();
    }

    fn readable(storage: &InMemoryStorage, name: &str, cache: Option<Arc<SharedCache>>) -> RemoteReadable {
        let ctx = CancellationToken::new();
        let (reader, size) = storage.read_object(&ctx, name).unwrap();
        RemoteReadable {
            object: Arc::new(RemoteObject {
                reader,
                size,
                file_num: DiskFileNum::new(1),
                cache,
            }),
            max_readahead_size: 256 * 1024,
            compaction_readahead_size: 1024 * 1024,
            _tracked: HandleTracker::new().track(DiskFileNum::new(1)),
        }
    }

    #[test]
    fn test_unref_deletes_with_last_marker() {
        let storage = InMemoryStorage::new();
        put(&storage, "obj.sst", b"data");
        put(&storage, "obj.sst.ref.1.000001", b"");
        put(&storage, "obj.sst.ref.2.000005", b"");

        unref_object(&storage, "obj.sst", "obj.sst.ref.1.000001").unwrap();
        assert!(storage.contains("obj.sst"));

        unref_object(&storage, "obj.sst", "obj.sst.ref.2.000005").unwrap();
        assert!(storage.is_empty());

        // Missing marker and object are tolerated
        unref_object(&storage, "obj.sst", "obj.sst.ref.2.000005").unwrap();
    }

    #[test]
    fn test_compaction_reads_use_large_buffer() {
        let storage = InMemoryStorage::new();
        let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 199) as u8).collect();
        put(&storage, "obj", &data);
        let r = readable(&storage, "obj", None);

        let ctx = CancellationToken::new();
        let mut handle = r.new_read_handle();
        handle.setup_for_compaction();
        let mut buf = vec![0u8; 4096];
        let mut offset = 0usize;
        while offset < 1024 * 1024 {
            handle.read_at(&ctx, &mut buf, offset as u64).unwrap();
            assert_eq!(buf, data[offset..offset + 4096]);
            offset += 4096;
        }
        // One buffered read covered the whole first MiB
        assert_eq!(storage.bytes_read(), 1024 * 1024);

        // The buffer is clipped at the end of the object
        let tail = data.len() - 4096;
        handle.read_at(&ctx, &mut buf, tail as u64).unwrap();
        assert_eq!(buf, data[tail..]);
    }

    #[test]
    fn test_read_at_overflowing_offset_fails() {
        let storage = InMemoryStorage::new();
        let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 13) as u8).collect();
        put(&storage, "obj", &data);
        let r = readable(&storage, "obj", None);

        let ctx = CancellationToken::new();
        let mut handle = r.new_read_handle();
        handle.setup_for_compaction();
        let mut buf = vec![0u8; 4096];
        handle.read_at(&ctx, &mut buf, 0).unwrap();

        let err = handle.read_at(&ctx, &mut buf, u64::MAX - 10).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(r.read_at(&ctx, &mut buf, u64::MAX - 10).is_err());

        // The handle stays usable
        handle.read_at(&ctx, &mut buf, 4096).unwrap();
        assert_eq!(buf, data[4096..8192]);
    }

    #[test]
    fn test_sequential_reads_trigger_readahead() {
        let storage = InMemoryStorage::new();
        let data = vec![3u8; 1024 * 1024];
        put(&storage, "obj", &data);
        let r = readable(&storage, "obj", None);

        let ctx = CancellationToken::new();
        let mut handle = r.new_read_handle();
        let mut buf = vec![0u8; 4096];
        for i in 0..64u64 {
            handle.read_at(&ctx, &mut buf, i * 4096).unwrap();
        }
        // At most one maximum-size buffer is fetched beyond the data read
        assert!(storage.bytes_read() >= 64 * 4096);
        assert!(storage.bytes_read() <= 64 * 4096 + 256 * 1024);

        // Random access goes straight to storage
        let before = storage.bytes_read();
        handle.read_at(&ctx, &mut buf, 900 * 1024).unwrap();
        assert_eq!(storage.bytes_read() - before, 4096);
    }

    #[test]
    fn test_compaction_reads_do_not_populate_cache() {
        let storage = InMemoryStorage::new();
        put(&storage, "obj", &vec![1u8; 256 * 1024]);
        let cache = Arc::new(
            SharedCache::new(&SharedCacheConfig {
                size_bytes: 1024 * 1024,
                block_size: 4096,
            })
            .unwrap(),
        );
        let r = readable(&storage, "obj", Some(Arc::clone(&cache)));
        let ctx = CancellationToken::new();

        let mut handle = r.new_read_handle();
        handle.setup_for_compaction();
        let mut buf = vec![0u8; 4096];
        handle.read_at(&ctx, &mut buf, 0).unwrap();
        assert_eq!(cache.metrics().cached_blocks, 0);

        r.read_at(&ctx, &mut buf, 0).unwrap();
        assert_eq!(cache.metrics().cached_blocks, 1);
    }

    #[test]
    fn test_cancelled_read() {
        let storage = InMemoryStorage::new();
        put(&storage, "obj", b"abcdef");
        let r = readable(&storage, "obj", None);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let mut buf = [0u8; 2];
        assert!(matches!(r.read_at(&ctx, &mut buf, 0), Err(Error::Cancelled)));
    }
}
