//! Read-only view of a provider directory
//!
//! Loads the same object table a provider would, without creating the
//! directory, truncating the catalog log or removing a stale snapshot.

use crate::local;
use crate::metadata::ObjectMetadata;
use crate::provider::resolve_storage;
use sstio_catalog::RemoteCatalog;
use sstio_common::{CreatorId, Result, ResultExt};
use sstio_remote::{RemoteStorage, StorageFactory};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Objects found in a provider directory
#[derive(Debug)]
pub struct DirectoryScan {
    pub dir: PathBuf,
    pub creator_id: Option<CreatorId>,
    /// Ordered by file number
    pub objects: Vec<ObjectMetadata>,
}

impl DirectoryScan {
    /// Scan `dir` without modifying it
    ///
    /// The remote object catalog is read only when `storage_factory` is
    /// given.
    pub fn read(dir: impl AsRef<Path>, storage_factory: Option<&dyn StorageFactory>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut objects = BTreeMap::new();
        for meta in local::objects_in_listing(&local::list_dir(&dir)?) {
            objects.insert(meta.file_num, meta);
        }

        let mut creator_id = None;
        if let Some(factory) = storage_factory {
            let contents = RemoteCatalog::read_contents(&dir).context("reading remote object catalog")?;
            let mut storages: HashMap<_, Arc<dyn RemoteStorage>> = HashMap::new();
            for record in contents.objects {
                let storage = resolve_storage(&mut storages, factory, &record.locator)
                    .with_context(|| format!("creating storage for locator {:?}", record.locator.as_str()))?;
                let file_num = record.file_num;
                if objects
                    .insert(file_num, ObjectMetadata::from_catalog(record, storage))
                    .is_some()
                {
                    warn!("Object {} is both local and in the remote catalog", file_num);
                }
            }
            creator_id = contents.creator_id;
        }

        debug!("Scanned {}: {} objects", dir.display(), objects.len());
        Ok(Self {
            dir,
            creator_id,
            objects: objects.into_values().collect(),
        })
    }

    /// Local path or remote location of an object
    #[must_use]
    pub fn path(&self, meta: &ObjectMetadata) -> String {
        meta.location(&self.dir)
    }

    /// Size of an object in bytes
    pub fn size(&self, meta: &ObjectMetadata) -> Result<u64> {
        meta.size(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CreateOptions;
    use crate::provider::Provider;
    use crate::settings::Settings;
    use crate::writable::Writable;
    use sstio_catalog::CATALOG_FILENAME;
    use sstio_common::{CreateOnSharedStrategy, DiskFileNum, FileType, Locator, ProviderConfig};
    use sstio_remote::{InMemoryStorage, SimpleStorageFactory};
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn factory(storage: &Arc<InMemoryStorage>) -> SimpleStorageFactory {
        let storage: Arc<dyn RemoteStorage> = Arc::clone(storage) as Arc<dyn RemoteStorage>;
        SimpleStorageFactory::new().with_storage(Locator::default(), storage)
    }

    #[test]
    fn test_scan_matches_provider() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        {
            let mut config = ProviderConfig::default();
            config.remote.create_on_shared = CreateOnSharedStrategy::All;
            let p = Provider::open(
                Settings::new(dir.path())
                    .with_config(config)
                    .with_storage_factory(Arc::new(factory(&storage))),
            )
            .unwrap();
            p.set_creator_id(CreatorId::new(3)).unwrap();
            for (n, opts) in [(1, CreateOptions::default()), (2, CreateOptions::shared())] {
                let (mut w, _) = p.create(FileType::Table, DiskFileNum::new(n), opts).unwrap();
                w.write(b"abc").unwrap();
                w.finish().unwrap();
            }
            p.sync().unwrap();
            p.close().unwrap();
        }

        let factory = factory(&storage);
        let remote: Option<&dyn StorageFactory> = Some(&factory);
        let scan = DirectoryScan::read(dir.path(), remote).unwrap();
        assert_eq!(scan.creator_id, Some(CreatorId::new(3)));
        let nums: Vec<u64> = scan.objects.iter().map(|m| m.file_num.get()).collect();
        assert_eq!(nums, vec![1, 2]);
        assert!(!scan.objects[0].is_remote() && scan.objects[1].is_shared());
        assert_eq!(scan.size(&scan.objects[1]).unwrap(), 3);
        assert!(scan.path(&scan.objects[0]).ends_with("000001.sst"));

        // Without remote storage only local objects are listed
        let scan = DirectoryScan::read(dir.path(), None).unwrap();
        assert_eq!(scan.objects.len(), 1);
        assert!(scan.creator_id.is_none());
    }

    #[test]
    fn test_scan_leaves_directory_untouched() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let factory = factory(&storage);
        let remote: Option<&dyn StorageFactory> = Some(&factory);
        assert!(DirectoryScan::read(dir.path().join("missing"), remote).is_err());
        assert!(!dir.path().join("missing").exists());

        fs::write(dir.path().join("000004.blob"), b"blob").unwrap();
        let scan = DirectoryScan::read(dir.path(), remote).unwrap();
        assert_eq!(scan.objects.len(), 1);
        assert!(!dir.path().join(CATALOG_FILENAME).exists());

        let log = dir.path().join(CATALOG_FILENAME);
        let mut f = fs::File::create(&log).unwrap();
        f.write_all(b"torn").unwrap();
        let temp = dir.path().join(format!("{CATALOG_FILENAME}.tmp"));
        fs::write(&temp, b"stale").unwrap();

        let scan = DirectoryScan::read(dir.path(), remote).unwrap();
        assert_eq!(scan.objects.len(), 1);
        assert_eq!(fs::metadata(&log).unwrap().len(), 4);
        assert!(temp.exists());
    }
}
