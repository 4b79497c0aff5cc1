//! Remote object naming
//!
//! Object names start with a short hash so that objects spread across the
//! key space of the remote store:
//! `<hash:04x>-<creator id>-<creator file num:06>.<ext>`. Ref markers append
//! `.ref.<ref creator id>.<ref file num:06>` to the object name.

use crate::metadata::RemoteBacking;
use sstio_common::{CreatorId, DiskFileNum, FileType, Locator};

/// Name of a remote object
#[must_use]
pub fn remote_object_name(file_type: FileType, remote: &RemoteBacking) -> String {
    if let Some(name) = &remote.custom_object_name {
        return name.clone();
    }
    derived_object_name(file_type, remote.creator_id, remote.creator_file_num)
}

/// Name of a remote object without a custom name
#[must_use]
pub fn derived_object_name(
    file_type: FileType,
    creator_id: CreatorId,
    creator_file_num: DiskFileNum,
) -> String {
    format!(
        "{:04x}-{}-{}.{}",
        object_hash(creator_id, creator_file_num),
        creator_id,
        creator_file_num,
        file_type.extension()
    )
}

#[allow(clippy::cast_possible_truncation)]
const fn object_hash(creator_id: CreatorId, creator_file_num: DiskFileNum) -> u16 {
    creator_id
        .get()
        .wrapping_mul(7459)
        .wrapping_add(creator_file_num.get().wrapping_mul(17539)) as u16
}

/// Name of the marker recording that `(ref_creator_id, ref_file_num)` uses
/// the object
#[must_use]
pub fn ref_marker_name(object_name: &str, ref_creator_id: CreatorId, ref_file_num: DiskFileNum) -> String {
    format!("{}{}.{}", ref_marker_prefix(object_name), ref_creator_id, ref_file_num)
}

/// Prefix shared by all markers of an object
#[must_use]
pub fn ref_marker_prefix(object_name: &str) -> String {
    format!("{object_name}.ref.")
}

/// Display path of a remote object
#[must_use]
pub fn remote_path(locator: &Locator, object_name: &str) -> String {
    if locator.is_empty() {
        format!("remote://{object_name}")
    } else {
        format!("remote-{locator}://{object_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_name() {
        let name = derived_object_name(FileType::Table, CreatorId::new(1), DiskFileNum::new(1));
        // 7459 + 17539 = 24998 = 0x61a6
        assert_eq!(name, "61a6-1-000001.sst");

        let name = derived_object_name(FileType::Blob, CreatorId::new(5), DiskFileNum::new(123));
        assert!(name.ends_with("-5-000123.blob"));
        assert_eq!(name.len(), "xxxx-5-000123.blob".len());
    }

    #[test]
    fn test_marker_names() {
        let marker = ref_marker_name("61a6-1-000001.sst", CreatorId::new(2), DiskFileNum::new(42));
        assert_eq!(marker, "61a6-1-000001.sst.ref.2.000042");
        assert!(marker.starts_with(&ref_marker_prefix("61a6-1-000001.sst")));
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path(&Locator::default(), "a.sst"), "remote://a.sst");
        assert_eq!(remote_path(&Locator::new("east"), "a.sst"), "remote-east://a.sst");
    }
}
