//! Per-call options

use sstio_common::{CleanupMethod, DiskFileNum, FileType};

/// Options for creating an object
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateOptions {
    /// Place the object on shared storage if the provider is configured to
    pub prefer_shared_storage: bool,
    /// Cleanup method for a shared object
    pub shared_cleanup_method: CleanupMethod,
}

impl CreateOptions {
    /// Options for a shared, ref-tracked object
    #[must_use]
    pub fn shared() -> Self {
        Self {
            prefer_shared_storage: true,
            shared_cleanup_method: CleanupMethod::RefTracking,
        }
    }
}

/// Options for opening an object
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// The object must exist; a missing object is reported as fatal
    /// corruption
    pub must_exist: bool,
}

/// A remote object handed over by another provider
#[derive(Clone, Debug)]
pub struct RemoteObjectToAttach {
    /// File number the object gets in this provider
    pub file_num: DiskFileNum,
    pub file_type: FileType,
    /// Encoded backing from `Provider::remote_object_backing`
    pub backing: Vec<u8>,
}
