//! Batches of catalog changes
//!
//! The provider accumulates changes between syncs in a `CatalogBatch` and
//! applies them to the catalog in one durable write.

use serde::{Deserialize, Serialize};
use sstio_common::{CleanupMethod, CreatorId, DiskFileNum, FileType, Locator};

/// Persistent description of a remote object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectMetadata {
    /// Local file number of the object in this provider
    pub file_num: DiskFileNum,
    pub file_type: FileType,
    /// Provider that created the object
    pub creator_id: CreatorId,
    /// File number of the object in the creating provider
    pub creator_file_num: DiskFileNum,
    pub cleanup_method: CleanupMethod,
    /// Remote storage target holding the object
    pub locator: Locator,
    /// Object name overriding the derived one (external objects)
    pub custom_object_name: Option<String>,
}

/// A single catalog change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Add(RemoteObjectMetadata),
    Delete(DiskFileNum),
}

/// Ordered list of catalog changes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogBatch {
    ops: Vec<BatchOp>,
}

impl CatalogBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new remote object
    pub fn add_object(&mut self, meta: RemoteObjectMetadata) {
        self.ops.push(BatchOp::Add(meta));
    }

    /// Record the removal of a remote object
    pub fn delete_object(&mut self, file_num: DiskFileNum) {
        self.ops.push(BatchOp::Delete(file_num));
    }

    /// Append all operations of another batch
    pub fn append(&mut self, other: Self) {
        self.ops.extend(other.ops);
    }

    /// Take the operations, leaving this batch empty
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn reset(&mut self) {
        self.ops.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}
