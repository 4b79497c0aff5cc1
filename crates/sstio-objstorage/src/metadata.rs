//! Object metadata held by the provider

use crate::local;
use crate::naming::{remote_object_name, remote_path};
use sstio_catalog::RemoteObjectMetadata;
use sstio_common::{CleanupMethod, CreatorId, DiskFileNum, FileType, Locator, Result, ResultExt};
use sstio_remote::RemoteStorage;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Everything the provider knows about one object
#[derive(Clone, Debug)]
pub struct ObjectMetadata {
    pub file_num: DiskFileNum,
    pub file_type: FileType,
    pub backing: ObjectBacking,
}

/// Where an object lives; fixed when the object is created
#[derive(Clone, Debug)]
pub enum ObjectBacking {
    /// File in the provider's directory
    Local,
    /// Object on remote storage
    Remote(RemoteBacking),
}

/// Location and ownership of a remote object
#[derive(Clone, Debug)]
pub struct RemoteBacking {
    /// Provider that created the object
    pub creator_id: CreatorId,
    /// File number the object had in the creating provider
    pub creator_file_num: DiskFileNum,
    pub cleanup_method: CleanupMethod,
    pub locator: Locator,
    /// Name overriding the derived object name
    pub custom_object_name: Option<String>,
    /// Client for `locator`
    pub storage: Arc<dyn RemoteStorage>,
}

impl ObjectMetadata {
    /// Metadata of a local object
    #[must_use]
    pub const fn local(file_type: FileType, file_num: DiskFileNum) -> Self {
        Self {
            file_num,
            file_type,
            backing: ObjectBacking::Local,
        }
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self.backing, ObjectBacking::Remote(_))
    }

    /// Remote object whose lifetime is tracked with ref markers
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.remote()
            .is_some_and(|r| r.cleanup_method == CleanupMethod::RefTracking)
    }

    /// Remote object that no provider ever deletes
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.remote()
            .is_some_and(|r| r.cleanup_method != CleanupMethod::RefTracking)
    }

    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteBacking> {
        match &self.backing {
            ObjectBacking::Local => None,
            ObjectBacking::Remote(r) => Some(r),
        }
    }

    /// Local path or remote location, for a provider rooted at `dir`
    #[must_use]
    pub fn location(&self, dir: &Path) -> String {
        match &self.backing {
            ObjectBacking::Local => local::object_path(dir, self.file_type, self.file_num)
                .display()
                .to_string(),
            ObjectBacking::Remote(remote) => {
                remote_path(&remote.locator, &remote_object_name(self.file_type, remote))
            }
        }
    }

    /// Size in bytes, for a provider rooted at `dir`
    pub fn size(&self, dir: &Path) -> Result<u64> {
        match &self.backing {
            ObjectBacking::Local => {
                let path = local::object_path(dir, self.file_type, self.file_num);
                Ok(fs::metadata(&path)
                    .with_context(|| format!("stat {}", path.display()))?
                    .len())
            }
            ObjectBacking::Remote(remote) => {
                remote.storage.size(&remote_object_name(self.file_type, remote))
            }
        }
    }

    /// Catalog record for a remote object
    pub(crate) fn to_catalog(&self) -> Option<RemoteObjectMetadata> {
        let remote = self.remote()?;
        Some(RemoteObjectMetadata {
            file_num: self.file_num,
            file_type: self.file_type,
            creator_id: remote.creator_id,
            creator_file_num: remote.creator_file_num,
            cleanup_method: remote.cleanup_method,
            locator: remote.locator.clone(),
            custom_object_name: remote.custom_object_name.clone(),
        })
    }

    /// Rebuild metadata from a catalog record
    pub(crate) fn from_catalog(meta: RemoteObjectMetadata, storage: Arc<dyn RemoteStorage>) -> Self {
        Self {
            file_num: meta.file_num,
            file_type: meta.file_type,
            backing: ObjectBacking::Remote(RemoteBacking {
                creator_id: meta.creator_id,
                creator_file_num: meta.creator_file_num,
                cleanup_method: meta.cleanup_method,
                locator: meta.locator,
                custom_object_name: meta.custom_object_name,
                storage,
            }),
        }
    }
}
