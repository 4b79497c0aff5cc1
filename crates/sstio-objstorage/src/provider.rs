//! Object storage provider
//!
//! The provider is the single owner of the object table. Every object the
//! engine knows about is registered here with its backing, and all creation,
//! reading, removal and durability goes through it.
//!
//! Durability is batched: `create` and `remove` update the in-memory table and
//! either mark the local directory dirty or queue a catalog operation. `sync`
//! makes all changes made before it durable.

use crate::cache::{SharedCache, SharedCacheMetrics};
use crate::leaktrack::HandleTracker;
use crate::local;
use crate::metadata::{ObjectBacking, ObjectMetadata};
use crate::options::{CreateOptions, OpenOptions};
use crate::readable::Readable;
use crate::settings::Settings;
use crate::writable::Writable;
use parking_lot::{Mutex, RwLock};
use sstio_catalog::{CatalogBatch, RemoteCatalog};
use sstio_common::{
    CreateOnSharedStrategy, CreatorId, DiskFileNum, Error, FileType, Locator, Result, ResultExt,
};
use sstio_remote::{RemoteStorage, StorageFactory};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Chunk size used when copying a local file to remote storage
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Mutable provider state, guarded by one lock
#[derive(Default)]
pub(crate) struct ProviderState {
    pub(crate) known_objects: HashMap<DiskFileNum, ObjectMetadata>,
    /// Objects with open backing handles
    pub(crate) protected_objects: HashMap<DiskFileNum, usize>,
    /// Removed protected objects whose unref waits for the last handle
    pub(crate) deferred_unrefs: HashMap<DiskFileNum, ObjectMetadata>,
    /// File numbers with a create in progress
    pub(crate) creating: HashSet<DiskFileNum>,
    /// Local objects were created or removed since the last directory fsync
    pub(crate) local_objects_changed: bool,
    /// Catalog operations not yet persisted
    pub(crate) catalog_batch: CatalogBatch,
    /// Storage clients by locator
    pub(crate) storage_objects: HashMap<Locator, Arc<dyn RemoteStorage>>,
}

pub(crate) struct ProviderInner {
    pub(crate) settings: Settings,
    /// Provider directory, kept open for fsync
    dir_file: File,
    pub(crate) state: RwLock<ProviderState>,
    /// Serializes directory fsyncs; taken before `state`
    local_sync: Mutex<()>,
    /// Serializes catalog flushes; taken before `state`
    catalog_sync: Mutex<()>,
    catalog: Option<RemoteCatalog>,
    creator_id: OnceLock<CreatorId>,
    pub(crate) cache: Option<Arc<SharedCache>>,
    pub(crate) tracker: Arc<HandleTracker>,
}

/// Object storage provider
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct Provider {
    pub(crate) inner: Arc<ProviderInner>,
}

impl Provider {
    /// Open the provider in `settings.dir`, creating the directory if needed
    pub fn open(settings: Settings) -> Result<Self> {
        fs::create_dir_all(&settings.dir)
            .with_context(|| format!("creating directory {}", settings.dir.display()))?;
        let dir_file = File::open(&settings.dir)
            .with_context(|| format!("opening directory {}", settings.dir.display()))?;

        let mut state = ProviderState::default();

        let listing = match &settings.initial_listing {
            Some(listing) => listing.clone(),
            None => local::list_dir(&settings.dir)?,
        };
        for meta in local::objects_in_listing(&listing) {
            state.known_objects.insert(meta.file_num, meta);
        }
        let local_objects = state.known_objects.len();

        let creator_id = OnceLock::new();
        let mut catalog = None;
        let mut cache = None;
        if let Some(factory) = &settings.storage_factory {
            let (remote_catalog, contents) =
                RemoteCatalog::open(&settings.dir, settings.config.remote.catalog.clone())
                    .context("opening remote object catalog")?;

            for record in contents.objects {
                let storage = resolve_storage(&mut state.storage_objects, factory.as_ref(), &record.locator)
                    .with_context(|| format!("creating storage for locator {:?}", record.locator.as_str()))?;
                let file_num = record.file_num;
                let meta = ObjectMetadata::from_catalog(record, storage);
                if state.known_objects.insert(file_num, meta).is_some() {
                    warn!("Object {} is both local and in the remote catalog", file_num);
                }
            }

            match contents.creator_id {
                Some(id) => {
                    let _ = creator_id.set(id);
                    settings
                        .logger
                        .info(&format!("remote storage configured; creator ID = {id}"));
                }
                None => settings
                    .logger
                    .info("remote storage configured; no creator ID yet"),
            }

            if settings.config.remote.cache.size_bytes > 0 {
                cache = Some(Arc::new(SharedCache::new(&settings.config.remote.cache)?));
            }
            catalog = Some(remote_catalog);
        }

        info!(
            "Opened object storage in {}: {} local objects, {} remote objects",
            settings.dir.display(),
            local_objects,
            state.known_objects.len() - local_objects
        );

        Ok(Self {
            inner: Arc::new(ProviderInner {
                settings,
                dir_file,
                state: RwLock::new(state),
                local_sync: Mutex::new(()),
                catalog_sync: Mutex::new(()),
                catalog,
                creator_id,
                cache,
                tracker: HandleTracker::new(),
            }),
        })
    }

    /// Create a new object
    ///
    /// The object is registered immediately; it survives a restart only after
    /// the writable is finished and `sync` has run.
    pub fn create(
        &self,
        file_type: FileType,
        file_num: DiskFileNum,
        opts: CreateOptions,
    ) -> Result<(Box<dyn Writable>, ObjectMetadata)> {
        let _reservation = self.reserve(file_num)?;
        let remote = &self.inner.settings.config.remote;
        let shared = opts.prefer_shared_storage && remote.create_on_shared != CreateOnSharedStrategy::None;

        let (writable, meta) = if shared {
            self.remote_create(file_type, file_num, &remote.create_on_shared_locator, opts)
        } else {
            self.local_create(file_type, file_num)
        }
        .with_context(|| format!("creating object {file_num}"))?;

        self.add_metadata(meta.clone());
        debug!("Created {} object {}", file_type, file_num);
        Ok((writable, meta))
    }

    fn local_create(&self, file_type: FileType, file_num: DiskFileNum) -> Result<(Box<dyn Writable>, ObjectMetadata)> {
        let provider = self.clone();
        let writable = local::create(
            self.local_path(file_type, file_num),
            &self.inner.settings.config.local,
            Box::new(move || {
                provider.remove_metadata(file_num);
            }),
        )?;
        Ok((Box::new(writable), ObjectMetadata::local(file_type, file_num)))
    }

    /// Open an object for reading
    ///
    /// With `must_exist`, a missing object is reported through
    /// `Logger::fatal`.
    pub fn open_for_reading(
        &self,
        file_type: FileType,
        file_num: DiskFileNum,
        opts: OpenOptions,
    ) -> Result<Box<dyn Readable>> {
        let meta = match self.lookup(file_type, file_num) {
            Ok(meta) => meta,
            Err(e) => {
                if opts.must_exist {
                    self.inner.settings.logger.fatal(&e.to_string());
                }
                return Err(e);
            }
        };

        match &meta.backing {
            ObjectBacking::Local => self.local_open(&meta, opts),
            ObjectBacking::Remote(remote) => self.remote_open(&meta, remote, opts),
        }
        .with_context(|| format!("opening object {file_num}"))
    }

    fn local_open(&self, meta: &ObjectMetadata, opts: OpenOptions) -> Result<Box<dyn Readable>> {
        let settings = &self.inner.settings;
        let path = self.local_path(meta.file_type, meta.file_num);
        match local::open(
            path,
            meta.file_num,
            settings.config.local.readahead.clone(),
            &self.inner.tracker,
        ) {
            Ok(readable) => Ok(Box::new(readable)),
            Err(e) if opts.must_exist && e.is_not_found() => settings.logger.fatal(&format!(
                "{} file {} does not exist: {}",
                meta.file_type,
                meta.file_num,
                local::directory_summary(&settings.dir)
            )),
            Err(e) => Err(e),
        }
    }

    /// Remove an object
    ///
    /// An object already missing from its backend is treated as removed.
    /// The removal is durable after the next `sync`.
    pub fn remove(&self, file_type: FileType, file_num: DiskFileNum) -> Result<()> {
        let meta = self.lookup(file_type, file_num)?;

        let result = match &meta.backing {
            ObjectBacking::Local => self
                .inner
                .settings
                .cleaner
                .clean(&self.local_path(file_type, file_num), file_type),
            ObjectBacking::Remote(remote) => self.remote_unref(&meta, remote),
        };
        if let Err(e) = result {
            if !self.is_not_exist_error(&e) {
                warn!("Failed to remove {} object {}: {}", file_type, file_num, e);
                return Err(e.context(format!("removing object {file_num}")));
            }
            debug!("Object {} was already gone", file_num);
        }

        self.remove_metadata(file_num);
        Ok(())
    }

    /// Metadata of a known object
    pub fn lookup(&self, file_type: FileType, file_num: DiskFileNum) -> Result<ObjectMetadata> {
        let state = self.inner.state.read();
        let meta = state
            .known_objects
            .get(&file_num)
            .ok_or(Error::UnknownObject { file_type, file_num })?;
        if meta.file_type != file_type {
            return Err(Error::TypeMismatch {
                file_num,
                known: meta.file_type,
                expected: file_type,
            });
        }
        Ok(meta.clone())
    }

    /// All known objects, sorted by file number
    #[must_use]
    pub fn list(&self) -> Vec<ObjectMetadata> {
        let mut objects: Vec<ObjectMetadata> = self.inner.state.read().known_objects.values().cloned().collect();
        objects.sort_by_key(|m| m.file_num);
        objects
    }

    /// Path of an object, for logging
    #[must_use]
    pub fn path(&self, meta: &ObjectMetadata) -> String {
        meta.location(&self.inner.settings.dir)
    }

    /// Path of a local object
    #[must_use]
    pub fn local_path(&self, file_type: FileType, file_num: DiskFileNum) -> PathBuf {
        local::object_path(&self.inner.settings.dir, file_type, file_num)
    }

    /// Size of an object in bytes
    pub fn size(&self, meta: &ObjectMetadata) -> Result<u64> {
        meta.size(&self.inner.settings.dir)
    }

    /// Make all object creations and removals so far durable
    pub fn sync(&self) -> Result<()> {
        self.local_sync()?;
        match &self.inner.catalog {
            Some(catalog) => self.sync_remote_with(|batch| catalog.apply_batch(batch)),
            None => Ok(()),
        }
    }

    fn local_sync(&self) -> Result<()> {
        // A concurrent sync must not return before this fsync does
        let _sync = self.inner.local_sync.lock();
        let changed = std::mem::take(&mut self.inner.state.write().local_objects_changed);
        if !changed {
            return Ok(());
        }
        if let Err(e) = self.inner.dir_file.sync_all() {
            self.inner.state.write().local_objects_changed = true;
            return Err(Error::Io(e).context(format!(
                "syncing directory {}",
                self.inner.settings.dir.display()
            )));
        }
        Ok(())
    }

    /// Flush the pending catalog batch with `apply`
    ///
    /// On failure the batch is put back ahead of operations queued meanwhile.
    pub(crate) fn sync_remote_with<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&CatalogBatch) -> Result<()>,
    {
        let _sync = self.inner.catalog_sync.lock();
        let batch = self.inner.state.write().catalog_batch.take();
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = apply(&batch) {
            let mut state = self.inner.state.write();
            let newer = state.catalog_batch.take();
            let mut restored = batch;
            restored.append(newer);
            state.catalog_batch = restored;
            warn!("Failed to persist remote object catalog: {}", e);
            return Err(e.context("syncing remote object catalog"));
        }
        debug!("Persisted {} catalog operations", batch.len());
        Ok(())
    }

    /// Set the creator id used to name and reference shared objects
    ///
    /// Can be set once; setting the same id again is a no-op.
    pub fn set_creator_id(&self, id: CreatorId) -> Result<()> {
        let catalog = self.inner.catalog.as_ref().ok_or(Error::RemoteNotConfigured)?;
        catalog.set_creator_id(id)?;
        let current = *self.inner.creator_id.get_or_init(|| {
            self.inner
                .settings
                .logger
                .info(&format!("set creator ID {id}"));
            id
        });
        if current != id {
            return Err(Error::CreatorIdMismatch {
                current,
                requested: id,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn creator_id(&self) -> Option<CreatorId> {
        self.inner.creator_id.get().copied()
    }

    /// Whether the object is shared and was created by another provider
    #[must_use]
    pub fn is_shared_foreign(&self, meta: &ObjectMetadata) -> bool {
        match (self.creator_id(), meta.remote()) {
            (Some(id), Some(remote)) => meta.is_shared() && remote.creator_id != id,
            _ => false,
        }
    }

    /// Import a local file as a new object
    ///
    /// A local target is hard linked (or copied); a shared target is
    /// uploaded.
    pub fn link_or_copy_from_local(
        &self,
        src: &Path,
        file_type: FileType,
        file_num: DiskFileNum,
        opts: CreateOptions,
    ) -> Result<ObjectMetadata> {
        let shared = opts.prefer_shared_storage
            && self.inner.settings.config.remote.create_on_shared != CreateOnSharedStrategy::None;
        if !shared {
            let _reservation = self.reserve(file_num)?;
            let dst = self.local_path(file_type, file_num);
            local::link_or_copy(src, &dst, &self.inner.settings.config.local)
                .with_context(|| format!("creating object {file_num}"))?;
            let meta = ObjectMetadata::local(file_type, file_num);
            self.add_metadata(meta.clone());
            return Ok(meta);
        }

        let (mut writable, meta) = self.create(file_type, file_num, opts)?;
        let mut file = match File::open(src) {
            Ok(file) => file,
            Err(e) => {
                writable.abort();
                return Err(Error::Io(e).context(format!("opening {}", src.display())));
            }
        };
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    writable.abort();
                    return Err(Error::Io(e).context(format!("reading {}", src.display())));
                }
            };
            if let Err(e) = writable.write(&buf[..n]) {
                writable.abort();
                return Err(e);
            }
        }
        writable.finish()?;
        Ok(meta)
    }

    /// Close the provider
    ///
    /// Readables still open are reported as leaks.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        if let Some(catalog) = &self.inner.catalog {
            if let Err(e) = catalog.close() {
                first_err.get_or_insert(e);
            }
        }
        let storages: Vec<Arc<dyn RemoteStorage>> =
            self.inner.state.read().storage_objects.values().cloned().collect();
        for storage in storages {
            if let Err(e) = storage.close() {
                warn!("Failed to close remote storage: {}", e);
                first_err.get_or_insert(e);
            }
        }

        let leaked = self.inner.tracker.open_count();
        if leaked > 0 {
            let msg = format!(
                "{} objects still open at close: {:?}",
                leaked,
                self.inner.tracker.open_handles()
            );
            warn!("{}", msg);
            self.inner.settings.logger.error(&msg);
        }

        info!("Closed object storage in {}", self.inner.settings.dir.display());
        first_err.map_or(Ok(()), Err)
    }

    /// Whether `err` means the object does not exist, according to the
    /// provider or any storage client in use
    #[must_use]
    pub fn is_not_exist_error(&self, err: &Error) -> bool {
        if err.is_not_found() {
            return true;
        }
        self.inner
            .state
            .read()
            .storage_objects
            .values()
            .any(|s| s.is_not_exist_error(err))
    }

    /// Shared cache counters; zero when no cache is configured
    #[must_use]
    pub fn metrics(&self) -> SharedCacheMetrics {
        self.inner
            .cache
            .as_ref()
            .map(|c| c.metrics())
            .unwrap_or_default()
    }

    /// Objects with open readables (debug builds)
    #[must_use]
    pub fn open_handles(&self) -> Vec<DiskFileNum> {
        self.inner.tracker.open_handles()
    }

    /// Number of open readables
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.inner.tracker.open_count()
    }

    /// Claim `file_num` for a create until the guard drops
    fn reserve(&self, file_num: DiskFileNum) -> Result<Reservation<'_>> {
        let mut state = self.inner.state.write();
        if state.known_objects.contains_key(&file_num) || !state.creating.insert(file_num) {
            return Err(Error::ObjectExists { file_num });
        }
        Ok(Reservation {
            provider: self,
            file_num,
        })
    }

    pub(crate) fn add_metadata(&self, meta: ObjectMetadata) {
        let mut state = self.inner.state.write();
        match meta.to_catalog() {
            Some(record) => state.catalog_batch.add_object(record),
            None => state.local_objects_changed = true,
        }
        state.known_objects.insert(meta.file_num, meta);
    }

    pub(crate) fn remove_metadata(&self, file_num: DiskFileNum) -> Option<ObjectMetadata> {
        let meta = {
            let mut state = self.inner.state.write();
            let meta = state.known_objects.remove(&file_num)?;
            if meta.is_remote() {
                state.catalog_batch.delete_object(file_num);
            } else {
                state.local_objects_changed = true;
            }
            meta
        };
        if meta.is_remote() {
            if let Some(cache) = &self.inner.cache {
                cache.evict_object(file_num);
            }
        }
        Some(meta)
    }

    /// Creator id, failing if remote objects cannot be created yet
    pub(crate) fn check_shared_initialized(&self) -> Result<CreatorId> {
        if self.inner.settings.storage_factory.is_none() {
            return Err(Error::RemoteNotConfigured);
        }
        self.creator_id().ok_or(Error::CreatorIdNotSet)
    }

    /// Storage client for `locator`, created on first use
    pub(crate) fn ensure_storage(&self, locator: &Locator) -> Result<Arc<dyn RemoteStorage>> {
        let factory = self
            .inner
            .settings
            .storage_factory
            .as_ref()
            .ok_or(Error::RemoteNotConfigured)?;
        if let Some(storage) = self.inner.state.read().storage_objects.get(locator) {
            return Ok(Arc::clone(storage));
        }
        let storage = factory
            .create_storage(locator)
            .with_context(|| format!("creating storage for locator {:?}", locator.as_str()))?;
        let mut state = self.inner.state.write();
        Ok(Arc::clone(
            state
                .storage_objects
                .entry(locator.clone())
                .or_insert(storage),
        ))
    }
}

pub(crate) fn resolve_storage(
    storages: &mut HashMap<Locator, Arc<dyn RemoteStorage>>,
    factory: &dyn StorageFactory,
    locator: &Locator,
) -> Result<Arc<dyn RemoteStorage>> {
    if let Some(storage) = storages.get(locator) {
        return Ok(Arc::clone(storage));
    }
    let storage = factory.create_storage(locator)?;
    storages.insert(locator.clone(), Arc::clone(&storage));
    Ok(storage)
}

struct Reservation<'a> {
    provider: &'a Provider,
    file_num: DiskFileNum,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.provider.inner.state.write().creating.remove(&self.file_num);
    }
}
