//! Core type definitions for SSTIO
//!
//! Identifiers shared by the object storage provider, the remote catalog and
//! the remote storage clients.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of object managed by the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    /// Sorted table
    Table,
    /// Value blob file referenced from tables
    Blob,
}

impl FileType {
    /// File name extension used both locally and on remote storage
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Table => "sst",
            Self::Blob => "blob",
        }
    }

    /// Parse a file name extension
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "sst" => Some(Self::Table),
            "blob" => Some(Self::Blob),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table => f.write_str("table"),
            Self::Blob => f.write_str("blob"),
        }
    }
}

/// Number of an object file on this provider's disk
///
/// Assigned by the engine, unique within the process. Displayed zero-padded
/// to six digits, which is also how it appears in file names.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0:06}")]
pub struct DiskFileNum(u64);

impl DiskFileNum {
    #[must_use]
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identifier of the provider instance that created a shared object
///
/// Zero means "not set".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct CreatorId(u64);

impl CreatorId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

/// Opaque name of a configured remote storage target (e.g. a bucket)
///
/// The empty locator is valid and names the default target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Locator(String);

impl Locator {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Locator {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Locator {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How a remote object is cleaned up once no provider uses it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CleanupMethod {
    /// Every referencing provider owns a marker object; the last one to drop
    /// its marker deletes the object.
    #[default]
    RefTracking,
    /// The object is never deleted by a provider (external objects).
    NoCleanup,
}

impl CleanupMethod {
    /// Wire value used by the backing codec
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        match self {
            Self::RefTracking => 0,
            Self::NoCleanup => 1,
        }
    }

    #[must_use]
    pub const fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::RefTracking),
            1 => Some(Self::NoCleanup),
            _ => None,
        }
    }
}

/// Local file name of an object: `NNNNNN.<ext>`
#[must_use]
pub fn make_filename(file_type: FileType, file_num: DiskFileNum) -> String {
    format!("{file_num}.{}", file_type.extension())
}

/// Parse a local object file name produced by [`make_filename`]
///
/// Returns `None` for anything that is not an object file (logs, manifests,
/// the catalog, lock files, temporaries).
#[must_use]
pub fn parse_filename(name: &str) -> Option<(FileType, DiskFileNum)> {
    let (stem, ext) = name.split_once('.')?;
    let file_type = FileType::from_extension(ext)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let num = stem.parse::<u64>().ok()?;
    Some((file_type, DiskFileNum::new(num)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_roundtrip() {
        let name = make_filename(FileType::Table, DiskFileNum::new(42));
        assert_eq!(name, "000042.sst");
        assert_eq!(
            parse_filename(&name),
            Some((FileType::Table, DiskFileNum::new(42)))
        );

        let name = make_filename(FileType::Blob, DiskFileNum::new(1_234_567));
        assert_eq!(name, "1234567.blob");
        assert_eq!(
            parse_filename(&name),
            Some((FileType::Blob, DiskFileNum::new(1_234_567)))
        );
    }

    #[test]
    fn test_parse_ignores_other_files() {
        assert_eq!(parse_filename("MANIFEST-000001"), None);
        assert_eq!(parse_filename("000001.log"), None);
        assert_eq!(parse_filename("REMOTE-OBJ-CATALOG"), None);
        assert_eq!(parse_filename(".sst"), None);
        assert_eq!(parse_filename("12a.sst"), None);
        assert_eq!(parse_filename("000001.sst.tmp"), None);
    }

    #[test]
    fn test_cleanup_method_wire_values() {
        for m in [CleanupMethod::RefTracking, CleanupMethod::NoCleanup] {
            assert_eq!(CleanupMethod::from_u64(m.as_u64()), Some(m));
        }
        assert_eq!(CleanupMethod::from_u64(7), None);
    }

    #[test]
    fn test_creator_id_set() {
        assert!(!CreatorId::default().is_set());
        assert!(CreatorId::new(3).is_set());
        assert_eq!(DiskFileNum::new(7).to_string(), "000007");
    }
}
