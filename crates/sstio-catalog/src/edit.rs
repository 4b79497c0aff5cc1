//! Catalog edits
//!
//! A `CatalogEdit` is the payload of one log record. Replaying all edits in
//! order reconstructs the creator ID and the set of remote objects.

use crate::batch::{BatchOp, CatalogBatch, RemoteObjectMetadata};
use serde::{Deserialize, Serialize};
use sstio_common::{CreatorId, DiskFileNum, Error, Result};
use std::collections::BTreeMap;

/// One durable change to the catalog
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEdit {
    /// Creator ID, recorded once
    pub creator_id: Option<CreatorId>,
    /// Objects added by this edit
    pub new_objects: Vec<RemoteObjectMetadata>,
    /// Objects removed by this edit
    pub deleted_objects: Vec<DiskFileNum>,
}

impl CatalogEdit {
    /// Build the edit for a batch that has already been validated
    #[must_use]
    pub fn from_batch(batch: &CatalogBatch) -> Self {
        let mut edit = Self::default();
        for op in batch.ops() {
            match op {
                BatchOp::Add(meta) => edit.new_objects.push(meta.clone()),
                BatchOp::Delete(file_num) => {
                    // An object added and removed in the same batch never
                    // needs to reach the log.
                    if let Some(pos) = edit
                        .new_objects
                        .iter()
                        .position(|m| m.file_num == *file_num)
                    {
                        edit.new_objects.remove(pos);
                    } else {
                        edit.deleted_objects.push(*file_num);
                    }
                }
            }
        }
        edit
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("failed to encode catalog edit: {e}")))
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::CatalogCorruption(format!("undecodable catalog edit: {e}")))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creator_id.is_none() && self.new_objects.is_empty() && self.deleted_objects.is_empty()
    }

    /// Apply the edit to replayed catalog state
    pub fn apply(
        self,
        creator_id: &mut Option<CreatorId>,
        objects: &mut BTreeMap<DiskFileNum, RemoteObjectMetadata>,
    ) -> Result<()> {
        if let Some(id) = self.creator_id {
            match *creator_id {
                Some(current) if current != id => {
                    return Err(Error::CatalogCorruption(format!(
                        "creator ID changed from {current} to {id}"
                    )));
                }
                _ => *creator_id = Some(id),
            }
        }
        for file_num in self.deleted_objects {
            if objects.remove(&file_num).is_none() {
                return Err(Error::CatalogCorruption(format!(
                    "deletion of unknown object {file_num}"
                )));
            }
        }
        for meta in self.new_objects {
            if objects.contains_key(&meta.file_num) {
                return Err(Error::CatalogCorruption(format!(
                    "duplicate object {}",
                    meta.file_num
                )));
            }
            objects.insert(meta.file_num, meta);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sstio_common::{CleanupMethod, FileType, Locator};

    fn meta(n: u64) -> RemoteObjectMetadata {
        RemoteObjectMetadata {
            file_num: DiskFileNum::new(n),
            file_type: FileType::Blob,
            creator_id: CreatorId::new(9),
            creator_file_num: DiskFileNum::new(100 + n),
            cleanup_method: CleanupMethod::NoCleanup,
            locator: Locator::new("bucket"),
            custom_object_name: Some(format!("external-{n}")),
        }
    }

    #[test]
    fn test_edit_encoding() {
        let edit = CatalogEdit {
            creator_id: Some(CreatorId::new(9)),
            new_objects: vec![meta(1), meta(2)],
            deleted_objects: vec![DiskFileNum::new(7)],
        };
        let decoded = CatalogEdit::from_bytes(&edit.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, edit);
        assert!(CatalogEdit::from_bytes(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_from_batch_cancels_add_delete() {
        let mut batch = CatalogBatch::new();
        batch.add_object(meta(1));
        batch.add_object(meta(2));
        batch.delete_object(DiskFileNum::new(1));
        batch.delete_object(DiskFileNum::new(5));

        let edit = CatalogEdit::from_batch(&batch);
        assert_eq!(edit.new_objects, vec![meta(2)]);
        assert_eq!(edit.deleted_objects, vec![DiskFileNum::new(5)]);
    }

    #[test]
    fn test_apply_rejects_inconsistent_edits() {
        let mut creator = None;
        let mut objects = BTreeMap::new();

        CatalogEdit {
            creator_id: Some(CreatorId::new(1)),
            new_objects: vec![meta(1)],
            deleted_objects: vec![],
        }
        .apply(&mut creator, &mut objects)
        .unwrap();
        assert_eq!(creator, Some(CreatorId::new(1)));
        assert_eq!(objects.len(), 1);

        let dup = CatalogEdit {
            new_objects: vec![meta(1)],
            ..Default::default()
        };
        assert!(dup.apply(&mut creator, &mut objects).is_err());

        let missing = CatalogEdit {
            deleted_objects: vec![DiskFileNum::new(3)],
            ..Default::default()
        };
        assert!(missing.apply(&mut creator, &mut objects).is_err());

        let other_creator = CatalogEdit {
            creator_id: Some(CreatorId::new(2)),
            ..Default::default()
        };
        assert!(other_creator.apply(&mut creator, &mut objects).is_err());
    }
}
